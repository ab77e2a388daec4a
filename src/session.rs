// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-frame control loop.
//!
//! A [`Session`] acquires a frame, lets the border detector update the crop,
//! converts the cropped region and releases the frame, in that order. It also
//! takes the inputs a display front end produces: a preset crop, a manual
//! scan request, the auto-detect toggle and a new buffer count.

use crate::{
    capture::{CaptureConfig, CaptureContext, Driver, MAX_BUFFERS, MIN_BUFFERS},
    detect::{BorderDetector, DetectorConfig, Layout},
    image::{CropRegion, PixelEncoding, RgbaImage},
    v4l2::V4l2Device,
    Error,
};
use std::{fmt, mem};
use tracing::{debug, info, instrument, warn};
use unix_ts::Timestamp;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub capture: CaptureConfig,
    pub detector: DetectorConfig,
    /// Initial crop, ignored if it does not fit the negotiated frame
    pub crop: Option<CropRegion>,
    pub auto_detect: bool,
}

/// Who changed the crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropSource {
    Auto(Layout),
    Scan,
    Preset,
    /// The stream was reopened with dimensions the old crop no longer fits
    Reset,
}

/// Published whenever the active crop changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropChange {
    pub region: CropRegion,
    pub previous: CropRegion,
    /// Output dimensions differ from `previous`; the consumer must resize
    /// its surface before displaying the accompanying image.
    pub resized: bool,
    pub source: CropSource,
}

/// One converted frame.
#[derive(Debug)]
pub struct Update<'a> {
    pub image: RgbaImage<'a>,
    pub crop: CropRegion,
    pub crop_change: Option<CropChange>,
    pub sequence: u32,
    pub timestamp: Timestamp,
}

/// Snapshot for an on-screen status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub auto_detect: bool,
    pub layout: Layout,
    pub crop: CropRegion,
    pub buffers: usize,
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.auto_detect {
            write!(f, "auto ({})", self.layout)?;
        } else {
            write!(f, "manual")?;
        }
        write!(
            f,
            " | crop {} | {} buffers | {}x{} {}",
            self.crop, self.buffers, self.width, self.height, self.encoding
        )
    }
}

pub struct Session<D: Driver = V4l2Device> {
    capture: CaptureContext<D>,
    detector: BorderDetector,
    crop: CropRegion,
    pending_scan: bool,
    pending_change: Option<CropChange>,
}

impl Session<V4l2Device> {
    /// Opens `device` and builds a session around it.
    pub fn open(device: &str, options: SessionOptions) -> Result<Self, Error> {
        let capture = CaptureContext::open(device, options.capture.clone())?;
        Ok(Self::new(capture, options))
    }
}

impl<D: Driver> Session<D> {
    pub fn new(capture: CaptureContext<D>, options: SessionOptions) -> Self {
        let full = CropRegion::full(capture.width(), capture.height());
        let crop = match options.crop {
            Some(crop) if crop.fits(capture.width(), capture.height()) => crop,
            Some(crop) => {
                warn!("initial crop {} does not fit, using full frame", crop);
                full
            }
            None => full,
        };

        let mut detector = BorderDetector::new(options.detector);
        detector.set_enabled(options.auto_detect);

        Self {
            capture,
            detector,
            crop,
            pending_scan: false,
            pending_change: None,
        }
    }

    /// Runs one loop iteration.
    ///
    /// Returns `Ok(None)` when no frame was ready or the frame was skipped.
    /// A crop change made by the detector, a scan or [`Session::set_crop`]
    /// is reported with the first image converted using the new crop.
    #[instrument(skip_all)]
    pub fn poll(&mut self) -> Result<Option<Update<'_>>, Error> {
        let Some(mut frame) = self.capture.acquire()? else {
            return Ok(None);
        };
        let (width, height) = (frame.width(), frame.height());
        let sequence = frame.sequence();
        let timestamp = frame.timestamp();

        if mem::take(&mut self.pending_scan) {
            match self.detector.scan(&frame.luma()) {
                Ok(region) => publish(
                    &mut self.crop,
                    &mut self.pending_change,
                    region,
                    CropSource::Scan,
                ),
                Err(err) => info!("{}, keeping crop {}", err, self.crop),
            }
        }

        if self.detector.tick() {
            if let Some(detection) = self.detector.sample(&frame.luma()) {
                if detection.region.fits(width, height) {
                    publish(
                        &mut self.crop,
                        &mut self.pending_change,
                        detection.region,
                        CropSource::Auto(detection.layout),
                    );
                } else {
                    warn!(
                        "{} region {} does not fit {}x{} source",
                        detection.layout, detection.region, width, height
                    );
                }
            }
        }

        let converted = frame.convert(Some(self.crop)).map(|_| ());
        frame.release()?;

        match converted {
            Ok(()) => {}
            Err(Error::TruncatedFrame { expected, actual }) => {
                warn!(
                    "skipping frame {}: {} of {} bytes",
                    sequence, actual, expected
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let Some(image) = self.capture.converted() else {
            return Ok(None);
        };
        Ok(Some(Update {
            image,
            crop: self.crop,
            crop_change: self.pending_change.take(),
            sequence,
            timestamp,
        }))
    }

    /// Replaces the active crop, e.g. with a saved preset.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCrop`] if `region` does not fit the negotiated frame.
    pub fn set_crop(&mut self, region: CropRegion) -> Result<(), Error> {
        region.check(self.capture.width(), self.capture.height())?;
        publish(
            &mut self.crop,
            &mut self.pending_change,
            region,
            CropSource::Preset,
        );
        Ok(())
    }

    /// Runs the one-shot border scan on the next frame.
    pub fn request_scan(&mut self) {
        self.pending_scan = true;
    }

    pub fn set_auto_detect(&mut self, enabled: bool) {
        self.detector.set_enabled(enabled);
        info!(
            "auto detection {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Reopens the device with `count` buffers, clamped to 1-4.
    ///
    /// If the renegotiated frame no longer contains the crop, it falls back
    /// to the full frame.
    pub fn set_buffer_count(&mut self, count: u32) -> Result<(), Error> {
        self.capture
            .reinitialize(count.clamp(MIN_BUFFERS, MAX_BUFFERS))?;

        let (width, height) = (self.capture.width(), self.capture.height());
        if !self.crop.fits(width, height) {
            publish(
                &mut self.crop,
                &mut self.pending_change,
                CropRegion::full(width, height),
                CropSource::Reset,
            );
        }
        Ok(())
    }

    pub fn crop(&self) -> CropRegion {
        self.crop
    }

    pub fn capture(&self) -> &CaptureContext<D> {
        &self.capture
    }

    pub fn detector(&self) -> &BorderDetector {
        &self.detector
    }

    pub fn status(&self) -> Status {
        Status {
            auto_detect: self.detector.enabled(),
            layout: self.detector.layout(),
            crop: self.crop,
            buffers: self.capture.buffer_count(),
            width: self.capture.width(),
            height: self.capture.height(),
            encoding: self.capture.encoding(),
        }
    }

    pub fn close(&mut self) {
        self.capture.close();
    }
}

/// Makes `region` the active crop and records the change for the next
/// update. Changes that have not been delivered yet are merged.
fn publish(
    crop: &mut CropRegion,
    pending: &mut Option<CropChange>,
    region: CropRegion,
    source: CropSource,
) {
    if region == *crop {
        return;
    }
    let previous = pending.map_or(*crop, |change| change.previous);
    *crop = region;
    if region == previous {
        debug!("crop returned to {} before delivery", region);
        *pending = None;
        return;
    }
    let resized = !region.same_size(&previous);
    if resized {
        info!("crop resized to {} ({:?})", region, source);
    } else {
        info!("crop moved to {} ({:?})", region, source);
    }
    *pending = Some(CropChange {
        region,
        previous,
        resized,
        source,
    });
}
