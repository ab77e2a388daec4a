// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # capturedisp
//!
//! Low-latency frame acquisition for capture-card display. The library owns
//! the V4L2 memory-mapped buffer lifecycle, converts driver frames (packed
//! YUYV or MJPEG) into RGBA, and infers a crop rectangle from frame content so
//! only the interesting part of a 1080p capture is converted and shown.
//!
//! ## Components
//!
//! - [`capture`]: device negotiation and the buffer-slot ownership state
//!   machine. A [`capture::Frame`] can only be read while its slot is
//!   dequeued, and releasing it consumes the handle.
//! - [`convert`]: fixed-point BT.601 YUYV conversion and JPEG decoding, whole
//!   frame or a cropped sub-rectangle.
//! - [`detect`]: continuous layout classification with debounce plus a
//!   one-shot edge scan.
//! - [`session`]: the per-frame control loop tying the three together.
//!
//! ## Example
//!
//! ```no_run
//! use capturedisp::session::{Session, SessionOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::open("/dev/video0", SessionOptions::default())?;
//! session.set_auto_detect(true);
//!
//! loop {
//!     let Some(update) = session.poll()? else {
//!         continue;
//!     };
//!     if let Some(change) = update.crop_change {
//!         println!("crop is now {}", change.region);
//!     }
//!     println!("{}x{} frame", update.image.width(), update.image.height());
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! `unsafe` is confined to [`v4l2`], which issues the ioctls and owns the
//! `mmap` regions shared with the driver.

pub mod capture;
pub mod convert;
pub mod detect;
pub mod image;
pub mod session;
pub mod v4l2;

use crate::image::CropRegion;
use std::{error, fmt, io};

/// Error type for capture, conversion and configuration failures.
#[derive(Debug)]
pub enum Error {
    /// The device node could not be opened or is not a character device.
    DeviceUnavailable(String, io::Error),

    /// The device does not offer streaming video capture.
    CapabilityMismatch(String),

    /// Neither MJPEG nor YUYV could be negotiated.
    FormatNegotiationFailed(io::Error),

    /// The kernel buffers could not be set up or streaming could not start.
    BufferAllocationFailed(io::Error),

    /// A frame is still acquired from the given slot and has not been
    /// released.
    FrameOutstanding(u32),

    /// The capture context was already closed.
    Closed,

    /// The crop region does not fit inside the source frame.
    InvalidCrop(CropRegion, u32, u32),

    /// A packed frame is shorter than the region being converted requires.
    TruncatedFrame { expected: usize, actual: usize },

    /// I/O error from a runtime ioctl.
    Io(io::Error),

    /// JPEG encoder or decoder setup failed.
    Jpeg(turbojpeg::Error),

    /// Detector configuration could not be parsed.
    Config(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::DeviceUnavailable(device, err) => {
                write!(f, "cannot open capture device {}: {}", device, err)
            }
            Error::CapabilityMismatch(device) => {
                write!(f, "{} does not support streaming video capture", device)
            }
            Error::FormatNegotiationFailed(err) => {
                write!(f, "failed to negotiate MJPG or YUYV format: {}", err)
            }
            Error::BufferAllocationFailed(err) => {
                write!(f, "failed to allocate capture buffers: {}", err)
            }
            Error::FrameOutstanding(index) => {
                write!(f, "frame from buffer {} has not been released", index)
            }
            Error::Closed => write!(f, "capture context is closed"),
            Error::InvalidCrop(crop, width, height) => {
                write!(f, "crop {} does not fit in {}x{} frame", crop, width, height)
            }
            Error::TruncatedFrame { expected, actual } => write!(
                f,
                "frame payload is {} bytes but {} are required",
                actual, expected
            ),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Jpeg(err) => write!(f, "JPEG error: {}", err),
            Error::Config(err) => write!(f, "invalid detector configuration: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::DeviceUnavailable(_, err) => Some(err),
            Error::FormatNegotiationFailed(err) => Some(err),
            Error::BufferAllocationFailed(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Jpeg(err) => Some(err),
            Error::Config(err) => Some(err),
            Error::CapabilityMismatch(_)
            | Error::FrameOutstanding(_)
            | Error::Closed
            | Error::InvalidCrop(..)
            | Error::TruncatedFrame { .. } => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<turbojpeg::Error> for Error {
    fn from(err: turbojpeg::Error) -> Self {
        Error::Jpeg(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err)
    }
}
