// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::Args;
use capturedisp::{
    image::{encode_jpeg, RgbaImage},
    session::Session,
};
use clap::Parser;
use signal_hook::{consts::SIGINT, consts::SIGTERM, flag};
use std::{
    error::Error,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{info, info_span, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod args;

/// Sleep between polls when the device had no frame ready.
const IDLE_WAIT: Duration = Duration::from_millis(1);

fn update_fps(prev: &mut Instant, history: &mut [i64], index: &mut usize) -> i64 {
    let now = Instant::now();

    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1e9 as i64 / elapsed.as_nanos().max(1) as i64;
    *index = (*index + 1) % history.len();

    (history.iter().sum::<i64>() as f64 / history.len() as f64).round() as i64
}

fn init_tracing(args: &Args) {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout_log = tracing_subscriber::fmt::layer().with_filter(level);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(level)),
        Err(_) => None,
    };

    let tracy = if args.tracy {
        Some(tracing_tracy::TracyLayer::default().with_filter(level))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stdout_log)
        .with(journald)
        .with(tracy)
        .init();
}

/// Last converted frame, kept for the snapshot option.
struct Snapshot {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Snapshot {
    fn store(&mut self, image: &RgbaImage) {
        self.data.clear();
        self.data.extend_from_slice(image.data());
        self.width = image.width();
        self.height = image.height();
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _tracy = args.tracy.then(tracy_client::Client::start);
    init_tracing(&args);

    let term = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&term))?;
    flag::register(SIGTERM, Arc::clone(&term))?;

    let options = args.session_options()?;
    let mut session = Session::open(&args.device, options)?;
    if args.scan {
        session.request_scan();
    }
    info!("{}", session.status());

    let mut snapshot = args.snapshot.as_ref().map(|_| Snapshot {
        data: Vec::new(),
        width: 0,
        height: 0,
    });

    let mut prev = Instant::now();
    let mut history = vec![0; 30];
    let mut index = 0;
    let mut frames = 0u64;

    while !term.load(Ordering::Relaxed) {
        let now = Instant::now();
        let update = match session.poll() {
            Ok(Some(update)) => update,
            Ok(None) => {
                thread::sleep(IDLE_WAIT);
                continue;
            }
            Err(err) => {
                warn!("capture failed: {}", err);
                break;
            }
        };
        let poll_time = now.elapsed();
        let fps = update_fps(&mut prev, &mut history, &mut index);

        let _span = info_span!("frame", sequence = update.sequence).entered();
        if let Some(change) = update.crop_change {
            if change.resized {
                info!(
                    "output resized {}x{} -> {}x{}",
                    change.previous.width,
                    change.previous.height,
                    change.region.width,
                    change.region.height
                );
            }
        }
        if let Some(snapshot) = snapshot.as_mut() {
            snapshot.store(&update.image);
        }

        if args.verbose {
            tracing::debug!(
                "frame {} {} crop {} poll: {:?} fps: {}",
                update.sequence,
                update.image,
                update.crop,
                poll_time,
                fps
            );
        }

        frames += 1;
        if args.frames > 0 && frames >= args.frames {
            break;
        }
    }

    info!("{} frames, {}", frames, session.status());
    session.close();

    if let (Some(path), Some(snapshot)) = (&args.snapshot, &snapshot) {
        if snapshot.data.is_empty() {
            warn!("no frame captured, {} not written", path.display());
        } else {
            let image = RgbaImage::new(&snapshot.data, snapshot.width, snapshot.height);
            let jpeg = encode_jpeg(&image, 90)?;
            fs::write(path, &jpeg[..])?;
            info!("snapshot written to {}", path.display());
        }
    }

    Ok(())
}
