// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! In-memory capture driver and synthetic frames shared by the integration
//! tests.

#![allow(dead_code)]

use capturedisp::{
    capture::{Capabilities, CaptureConfig, CaptureContext, Dequeued, Driver, FormatInfo},
    image::{encode_jpeg, CropRegion, FourCC, RgbaImage, MJPG, YUYV},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    ops::Deref,
    rc::Rc,
};
use unix_ts::Timestamp;

/// What the simulated device supports.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub capabilities: Capabilities,
    pub formats: Vec<FourCC>,
    /// Size the device snaps every format request to
    pub size: (u32, u32),
    /// Upper bound on granted buffers
    pub max_buffers: u32,
    pub fail_map_at: Option<u32>,
    pub fail_stream_on: bool,
    /// Payload copied into every buffer when it is mapped
    pub frame: Vec<u8>,
}

impl MockDevice {
    pub fn yuyv(width: u32, height: u32, frame: Vec<u8>) -> Self {
        Self {
            capabilities: Capabilities {
                video_capture: true,
                streaming: true,
            },
            formats: vec![YUYV],
            size: (width, height),
            max_buffers: 8,
            fail_map_at: None,
            fail_stream_on: false,
            frame,
        }
    }

    pub fn mjpeg(width: u32, height: u32, frame: Vec<u8>) -> Self {
        Self {
            formats: vec![MJPG, YUYV],
            ..Self::yuyv(width, height, frame)
        }
    }
}

/// Observable driver-side bookkeeping.
#[derive(Debug, Default)]
pub struct MockStats {
    pub handles: i32,
    pub opens: u32,
    pub mapped: i32,
    pub granted: u32,
    pub streaming: bool,
    /// When set, dequeue reports "no frame yet"
    pub starved: bool,
    /// When set, dequeue reports this many bytes used
    pub short_payload: Option<usize>,
    pub queued: VecDeque<u32>,
    pub frame_rate: Option<u32>,
    pub formats_requested: Vec<FourCC>,
    pub sequence: u32,
}

pub struct MockMapping {
    data: Vec<u8>,
    stats: Rc<RefCell<MockStats>>,
}

impl Deref for MockMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.stats.borrow_mut().mapped -= 1;
    }
}

pub struct MockDriver {
    device: Rc<MockDevice>,
    stats: Rc<RefCell<MockStats>>,
    format: Option<FourCC>,
}

impl MockDriver {
    pub fn new(device: Rc<MockDevice>, stats: Rc<RefCell<MockStats>>) -> Self {
        {
            let mut stats = stats.borrow_mut();
            stats.handles += 1;
            stats.opens += 1;
        }
        Self {
            device,
            stats,
            format: None,
        }
    }

    fn buffer_len(&self) -> usize {
        let (w, h) = self.device.size;
        match self.format {
            Some(MJPG) => (w * h) as usize,
            _ => (w * h * 2) as usize,
        }
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        self.stats.borrow_mut().handles -= 1;
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl Driver for MockDriver {
    type Mapping = MockMapping;

    fn capabilities(&mut self) -> io::Result<Capabilities> {
        Ok(self.device.capabilities)
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()> {
        self.stats.borrow_mut().frame_rate = Some(fps);
        Ok(())
    }

    fn set_format(&mut self, _width: u32, _height: u32, fourcc: FourCC) -> io::Result<FormatInfo> {
        self.stats.borrow_mut().formats_requested.push(fourcc);
        // Like most drivers, answer an unsupported request with the default
        // format instead of failing.
        let fourcc = if self.device.formats.contains(&fourcc) {
            fourcc
        } else {
            *self.device.formats.first().ok_or_else(einval)?
        };
        self.format = Some(fourcc);
        Ok(FormatInfo {
            width: self.device.size.0,
            height: self.device.size.1,
            fourcc,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut stats = self.stats.borrow_mut();
        if stats.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        stats.granted = count.min(self.device.max_buffers);
        stats.queued.clear();
        Ok(stats.granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MockMapping> {
        if self.device.fail_map_at == Some(index) || index >= self.stats.borrow().granted {
            return Err(einval());
        }
        let mut data = vec![0u8; self.buffer_len().max(self.device.frame.len())];
        data[..self.device.frame.len()].copy_from_slice(&self.device.frame);
        self.stats.borrow_mut().mapped += 1;
        Ok(MockMapping {
            data,
            stats: Rc::clone(&self.stats),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut stats = self.stats.borrow_mut();
        if index >= stats.granted || stats.queued.contains(&index) {
            return Err(einval());
        }
        stats.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>> {
        let mut stats = self.stats.borrow_mut();
        if !stats.streaming {
            return Err(einval());
        }
        if stats.starved {
            return Ok(None);
        }
        let Some(index) = stats.queued.pop_front() else {
            return Ok(None);
        };
        stats.sequence += 1;
        let bytes_used = match (stats.short_payload, self.format) {
            (Some(len), _) => len,
            (None, Some(MJPG)) => self.device.frame.len(),
            (None, _) => 0,
        };
        Ok(Some(Dequeued {
            index,
            bytes_used,
            sequence: stats.sequence,
            timestamp: Timestamp::new(stats.sequence as i64, 0),
        }))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.device.fail_stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.stats.borrow_mut().streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut stats = self.stats.borrow_mut();
        stats.streaming = false;
        stats.queued.clear();
        Ok(())
    }
}

/// Opens a context on a mock device. The returned stats stay valid after the
/// context is dropped.
pub fn open_mock(
    device: MockDevice,
    config: CaptureConfig,
) -> (
    Result<CaptureContext<MockDriver>, capturedisp::Error>,
    Rc<RefCell<MockStats>>,
) {
    let device = Rc::new(device);
    let stats = Rc::new(RefCell::new(MockStats::default()));
    let source_stats = Rc::clone(&stats);
    let ctx = CaptureContext::with_source("mock0", config, move || {
        Ok(MockDriver::new(Rc::clone(&device), Rc::clone(&source_stats)))
    });
    (ctx, stats)
}

pub fn config(buffers: u32) -> CaptureConfig {
    CaptureConfig {
        buffers,
        ..Default::default()
    }
}

/// Luma-only scene: `border` everywhere, `interior` inside `region`.
pub struct Scene {
    pub width: u32,
    pub height: u32,
    pub border: u8,
    pub interior: u8,
    pub region: Option<CropRegion>,
}

impl Scene {
    pub fn framed(width: u32, height: u32, region: CropRegion) -> Self {
        Self {
            width,
            height,
            border: 8,
            interior: 220,
            region: Some(region),
        }
    }

    pub fn uniform(width: u32, height: u32, luma: u8) -> Self {
        Self {
            width,
            height,
            border: luma,
            interior: luma,
            region: None,
        }
    }

    pub fn luma(&self, x: u32, y: u32) -> u8 {
        match self.region {
            Some(r) if x >= r.x && x < r.x + r.width && y >= r.y && y < r.y + r.height => {
                self.interior
            }
            _ => self.border,
        }
    }

    /// Packed YUYV with neutral chroma.
    pub fn yuyv(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width * self.height * 2) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(self.luma(x, y));
                data.push(128);
            }
        }
        data
    }

    pub fn rgba(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let l = self.luma(x, y);
                data.extend_from_slice(&[l, l, l, 255]);
            }
        }
        data
    }

    pub fn jpeg(&self) -> Vec<u8> {
        let rgba = self.rgba();
        let jpeg = encode_jpeg(&RgbaImage::new(&rgba, self.width, self.height), 95)
            .expect("encode synthetic frame");
        jpeg.to_vec()
    }
}
