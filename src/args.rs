// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use capturedisp::{
    capture::CaptureConfig,
    detect::DetectorConfig,
    image::CropRegion,
    session::SessionOptions,
    Error,
};
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the capture display runner.
///
/// Every option can also be given through the environment variable shown in
/// `--help`.
///
/// # Example
///
/// ```bash
/// capturedisp --device /dev/video0 --buffers 1 --auto-detect
///
/// export DEVICE=/dev/video2
/// export CROP="448 83 1024 912"
/// capturedisp --frames 600 --snapshot last.jpg
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture device path (e.g., /dev/video0)
    #[arg(short, long, env = "DEVICE", default_value = "/dev/video0")]
    pub device: String,

    /// Requested capture resolution in pixels (width height)
    #[arg(
        long,
        env = "CAPTURE_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub capture_size: Vec<u32>,

    /// Number of driver buffers; fewer buffers lower latency but may drop
    /// frames under load
    #[arg(
        short,
        long,
        env = "BUFFERS",
        default_value = "2",
        value_parser = clap::value_parser!(u32).range(1..=4)
    )]
    pub buffers: u32,

    /// Requested frame rate, best effort
    #[arg(long, env = "FRAME_RATE", default_value = "60")]
    pub frame_rate: u32,

    /// Continuously classify the content layout and crop to it
    #[arg(short, long, env = "AUTO_DETECT")]
    pub auto_detect: bool,

    /// Scan the first frame for content borders and crop to them
    #[arg(long, env = "SCAN")]
    pub scan: bool,

    /// Initial crop region in source pixels (x y width height)
    #[arg(long, env = "CROP", value_delimiter = ' ', num_args = 4)]
    pub crop: Option<Vec<u32>>,

    /// JSON file overriding detector probes and thresholds
    #[arg(long, env = "DETECTOR_CONFIG")]
    pub detector_config: Option<PathBuf>,

    /// Stop after this many converted frames, 0 runs until interrupted
    #[arg(long, env = "FRAMES", default_value = "0")]
    pub frames: u64,

    /// Write the last converted frame to this JPEG file on exit
    #[arg(long, env = "SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn crop_region(&self) -> Option<CropRegion> {
        match self.crop.as_deref() {
            Some(&[x, y, width, height]) => Some(CropRegion::new(x, y, width, height)),
            _ => None,
        }
    }

    pub fn session_options(&self) -> Result<SessionOptions, Error> {
        let detector = match &self.detector_config {
            Some(path) => DetectorConfig::load(path)?,
            None => DetectorConfig::default(),
        };

        Ok(SessionOptions {
            capture: CaptureConfig {
                width: self.capture_size[0],
                height: self.capture_size[1],
                buffers: self.buffers,
                frame_rate: self.frame_rate,
            },
            detector,
            crop: self.crop_region(),
            auto_detect: self.auto_detect,
        })
    }
}
