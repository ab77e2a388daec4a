// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer manager for a memory-mapped streaming capture device.
//!
//! Every buffer slot alternates between two owners. While [`SlotState::Queued`]
//! the driver may write into it at any time and the consumer must not look at
//! it; while [`SlotState::Acquired`] the consumer has exclusive read access.
//! [`CaptureContext::acquire`] hands out a [`Frame`] that mutably borrows the
//! context, so the payload can only be read while the slot is acquired and
//! [`Frame::release`] consumes the handle when returning it to the driver.

use crate::{
    convert::Converter,
    detect::LumaView,
    image::{CropRegion, FourCC, PixelEncoding, RgbaImage, YuyvImage, MJPG, YUYV},
    v4l2::V4l2Device,
    Error,
};
use std::{fmt, io, ops::Deref};
use tracing::{debug, info, instrument, warn};
use unix_ts::Timestamp;

pub const MIN_BUFFERS: u32 = 1;
pub const MAX_BUFFERS: u32 = 4;
pub const DEFAULT_BUFFERS: u32 = 2;
pub const DEFAULT_FRAME_RATE: u32 = 60;

/// Capability bits the buffer manager cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub video_capture: bool,
    pub streaming: bool,
}

/// Format the device actually selected in response to a format request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
}

/// A buffer handed back by the driver.
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Timestamp,
}

/// Device control operations used by [`CaptureContext`].
///
/// [`V4l2Device`] implements this with ioctls. All calls are non-blocking;
/// [`Driver::dequeue_buffer`] returns `Ok(None)` when nothing is ready.
pub trait Driver {
    /// Buffer memory shared with the driver, released when dropped.
    type Mapping: Deref<Target = [u8]>;

    fn capabilities(&mut self) -> io::Result<Capabilities>;
    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()>;
    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> io::Result<FormatInfo>;
    /// Requests `count` buffers and returns how many the driver granted.
    /// A count of zero frees the driver's buffers.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;
    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Mapping>;
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;
    fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>>;
    fn stream_on(&mut self) -> io::Result<()>;
    fn stream_off(&mut self) -> io::Result<()>;
}

/// Requested capture parameters. The device may adjust the size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// Clamped to `MIN_BUFFERS..=MAX_BUFFERS` when opening.
    pub buffers: u32,
    pub frame_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            buffers: DEFAULT_BUFFERS,
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Queued,
    Acquired,
}

/// One driver buffer mapped into the process.
pub struct BufferSlot<M> {
    mapping: M,
    state: SlotState,
}

impl<M: Deref<Target = [u8]>> BufferSlot<M> {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

impl<M: Deref<Target = [u8]>> fmt::Debug for BufferSlot<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferSlot")
            .field("len", &self.len())
            .field("state", &self.state)
            .finish()
    }
}

type Source<D> = Box<dyn FnMut() -> io::Result<D>>;

/// One open device stream and its buffer slots.
pub struct CaptureContext<D: Driver = V4l2Device> {
    device: String,
    source: Source<D>,
    config: CaptureConfig,
    driver: Option<D>,
    width: u32,
    height: u32,
    encoding: PixelEncoding,
    slots: Vec<BufferSlot<D::Mapping>>,
    acquired: Option<usize>,
    converter: Converter,
}

impl CaptureContext<V4l2Device> {
    /// Opens a V4L2 node such as `/dev/video0` and starts streaming.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DeviceUnavailable`], [`Error::CapabilityMismatch`],
    /// [`Error::FormatNegotiationFailed`] or [`Error::BufferAllocationFailed`].
    pub fn open(device: &str, config: CaptureConfig) -> Result<Self, Error> {
        let path = device.to_owned();
        Self::with_source(device, config, move || V4l2Device::open(&path))
    }
}

impl<D: Driver> CaptureContext<D> {
    /// Opens a context whose driver is produced by `source`. The source is
    /// called again on every [`CaptureContext::reinitialize`].
    pub fn with_source<F>(device: &str, config: CaptureConfig, source: F) -> Result<Self, Error>
    where
        F: FnMut() -> io::Result<D> + 'static,
    {
        let mut ctx = Self {
            device: device.to_owned(),
            source: Box::new(source),
            width: config.width,
            height: config.height,
            config,
            driver: None,
            encoding: PixelEncoding::PackedYuv422,
            slots: Vec::new(),
            acquired: None,
            converter: Converter::new(0, 0),
        };
        ctx.start()?;
        Ok(ctx)
    }

    fn start(&mut self) -> Result<(), Error> {
        let count = self.config.buffers.clamp(MIN_BUFFERS, MAX_BUFFERS);

        let mut driver =
            (self.source)().map_err(|err| Error::DeviceUnavailable(self.device.clone(), err))?;

        match driver.capabilities() {
            Ok(caps) if caps.video_capture && caps.streaming => {}
            Ok(caps) => {
                debug!(?caps, "missing capture or streaming capability");
                return Err(Error::CapabilityMismatch(self.device.clone()));
            }
            Err(err) => {
                warn!("{}: capability query failed: {}", self.device, err);
                return Err(Error::CapabilityMismatch(self.device.clone()));
            }
        }

        if let Err(err) = driver.set_frame_rate(self.config.frame_rate) {
            debug!("{}: frame rate request ignored: {}", self.device, err);
        }

        let format = negotiate(&mut driver, self.config.width, self.config.height)?;
        let encoding = PixelEncoding::from_fourcc(format.fourcc).ok_or_else(|| {
            Error::FormatNegotiationFailed(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("device selected unsupported format {}", format.fourcc),
            ))
        })?;
        if format.width != self.config.width || format.height != self.config.height {
            warn!(
                "{}: requested {}x{} but device selected {}x{}",
                self.device, self.config.width, self.config.height, format.width, format.height
            );
        }

        let granted = driver
            .request_buffers(count)
            .map_err(Error::BufferAllocationFailed)?;
        if granted == 0 {
            return Err(Error::BufferAllocationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "driver granted no buffers",
            )));
        }
        if granted != count {
            debug!(requested = count, granted, "driver adjusted buffer count");
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match driver.map_buffer(index) {
                Ok(mapping) => slots.push(BufferSlot {
                    mapping,
                    state: SlotState::Queued,
                }),
                Err(err) => return Err(unwind(&mut driver, slots, err)),
            }
        }
        for index in 0..granted {
            if let Err(err) = driver.queue_buffer(index) {
                return Err(unwind(&mut driver, slots, err));
            }
        }
        if let Err(err) = driver.stream_on() {
            return Err(unwind(&mut driver, slots, err));
        }

        info!(
            "{}: streaming {}x{} {} with {} buffers",
            self.device, format.width, format.height, encoding, granted
        );

        self.width = format.width;
        self.height = format.height;
        self.encoding = encoding;
        self.slots = slots;
        self.acquired = None;
        self.converter = Converter::new(format.width, format.height);
        self.driver = Some(driver);
        Ok(())
    }

    /// Dequeues the next filled buffer without blocking.
    ///
    /// Returns `Ok(None)` when the device has nothing ready.
    ///
    /// # Errors
    ///
    /// [`Error::FrameOutstanding`] if a frame handle was leaked without being
    /// released, [`Error::Closed`] after [`CaptureContext::close`].
    pub fn acquire(&mut self) -> Result<Option<Frame<'_, D>>, Error> {
        if let Some(index) = self.acquired {
            return Err(Error::FrameOutstanding(index as u32));
        }
        let driver = self.driver.as_mut().ok_or(Error::Closed)?;
        let Some(buf) = driver.dequeue_buffer()? else {
            return Ok(None);
        };

        let index = buf.index as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver returned unknown buffer {}", buf.index),
            )));
        };
        slot.state = SlotState::Acquired;
        self.acquired = Some(index);

        // Some drivers leave bytesused at zero for uncompressed formats.
        let bytes_used = match buf.bytes_used {
            0 => slot.len(),
            n => n.min(slot.len()),
        };

        Ok(Some(Frame {
            ctx: self,
            index,
            bytes_used,
            sequence: buf.sequence,
            timestamp: buf.timestamp,
            decoded: false,
            released: false,
        }))
    }

    /// Returns the acquired slot, if any, to the driver.
    ///
    /// [`Frame::release`] and dropping a [`Frame`] both call this. It only
    /// needs to be called directly to recover from a leaked handle.
    pub fn release_frame(&mut self) -> Result<(), Error> {
        let Some(index) = self.acquired else {
            return Ok(());
        };
        let driver = self.driver.as_mut().ok_or(Error::Closed)?;
        driver.queue_buffer(index as u32)?;
        self.slots[index].state = SlotState::Queued;
        self.acquired = None;
        Ok(())
    }

    /// Stops streaming, unmaps every slot and releases the device.
    /// Closing an already closed context does nothing.
    pub fn close(&mut self) {
        let Some(mut driver) = self.driver.take() else {
            return;
        };

        if let Err(err) = driver.stream_off() {
            warn!("{}: stream off failed: {}", self.device, err);
        }
        let count = self.slots.len();
        self.slots.clear();
        self.acquired = None;
        if let Err(err) = driver.request_buffers(0) {
            debug!("{}: buffer release failed: {}", self.device, err);
        }
        self.converter.release();
        drop(driver);

        debug!("{}: closed, {} buffers unmapped", self.device, count);
    }

    /// Tears the stream down and opens it again with a new buffer count.
    ///
    /// On failure the context stays closed.
    pub fn reinitialize(&mut self, buffers: u32) -> Result<(), Error> {
        self.close();
        self.config.buffers = buffers.clamp(MIN_BUFFERS, MAX_BUFFERS);
        info!(
            "{}: reinitializing with {} buffers",
            self.device, self.config.buffers
        );
        self.start()
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_some()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Negotiated width, which may differ from the requested one.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Negotiated height, which may differ from the requested one.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn encoding(&self) -> PixelEncoding {
        self.encoding
    }

    /// Number of buffers granted by the driver, 0 once closed.
    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[BufferSlot<D::Mapping>] {
        &self.slots
    }

    pub fn acquired(&self) -> Option<u32> {
        self.acquired.map(|index| index as u32)
    }

    /// Output of the most recent [`Frame::convert`], still valid after the
    /// frame has been released.
    pub fn converted(&self) -> Option<RgbaImage<'_>> {
        self.converter.output()
    }
}

impl<D: Driver> Drop for CaptureContext<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Driver> fmt::Debug for CaptureContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CaptureContext")
            .field("device", &self.device)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("encoding", &self.encoding)
            .field("slots", &self.slots)
            .field("acquired", &self.acquired)
            .finish()
    }
}

/// Requests MJPEG first and falls back to YUYV.
fn negotiate<D: Driver>(driver: &mut D, width: u32, height: u32) -> Result<FormatInfo, Error> {
    match driver.set_format(width, height, MJPG) {
        Ok(format) if format.fourcc == MJPG => return Ok(format),
        Ok(format) => debug!("MJPG not honored, device answered {}", format.fourcc),
        Err(err) => debug!("MJPG rejected: {}", err),
    }

    let format = driver
        .set_format(width, height, YUYV)
        .map_err(Error::FormatNegotiationFailed)?;
    if format.fourcc != YUYV {
        return Err(Error::FormatNegotiationFailed(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("device selected unsupported format {}", format.fourcc),
        )));
    }
    Ok(format)
}

/// Undoes a partially completed open.
fn unwind<D: Driver>(driver: &mut D, slots: Vec<BufferSlot<D::Mapping>>, err: io::Error) -> Error {
    let mapped = slots.len();
    drop(slots);
    if let Err(err) = driver.request_buffers(0) {
        debug!("buffer release failed: {}", err);
    }
    debug!(mapped, "open aborted, mappings released");
    Error::BufferAllocationFailed(err)
}

/// An acquired buffer slot.
///
/// The payload is readable for as long as the handle lives. Call
/// [`Frame::release`] to requeue it and observe errors; dropping the handle
/// requeues it as well.
pub struct Frame<'a, D: Driver = V4l2Device> {
    ctx: &'a mut CaptureContext<D>,
    index: usize,
    bytes_used: usize,
    sequence: u32,
    timestamp: Timestamp,
    decoded: bool,
    released: bool,
}

impl<D: Driver> Frame<'_, D> {
    pub fn index(&self) -> u32 {
        self.index as u32
    }

    /// Payload bytes as filled by the driver.
    pub fn data(&self) -> &[u8] {
        &self.ctx.slots[self.index].mapping[..self.bytes_used]
    }

    pub fn len(&self) -> usize {
        self.bytes_used
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.ctx.width
    }

    pub fn height(&self) -> u32 {
        self.ctx.height
    }

    pub fn encoding(&self) -> PixelEncoding {
        self.ctx.encoding
    }

    /// Luma samples for the border detector.
    ///
    /// Packed frames are read in place. MJPEG frames are decoded once and the
    /// decoded image is reused by [`Frame::convert`].
    pub fn luma(&mut self) -> LumaView<'_> {
        let ctx = &mut *self.ctx;
        let data = &ctx.slots[self.index].mapping[..self.bytes_used];
        match ctx.encoding {
            PixelEncoding::PackedYuv422 => {
                LumaView::Packed(YuyvImage::new(data, ctx.width, ctx.height))
            }
            PixelEncoding::CompressedJpeg => {
                if !self.decoded {
                    ctx.converter.decode(data);
                    self.decoded = true;
                }
                match ctx.converter.decoded() {
                    Some(rgb) => LumaView::Decoded(rgb),
                    None => LumaView::Blank {
                        width: ctx.width,
                        height: ctx.height,
                    },
                }
            }
        }
    }

    /// Converts the frame, or the `crop` sub-rectangle of it, to RGBA.
    ///
    /// The result lives in the context's scratch buffer and stays available
    /// through [`CaptureContext::converted`] after release.
    #[instrument(skip_all, fields(index = self.index))]
    pub fn convert(&mut self, crop: Option<CropRegion>) -> Result<RgbaImage<'_>, Error> {
        let ctx = &mut *self.ctx;
        let data = &ctx.slots[self.index].mapping[..self.bytes_used];
        let crop = crop.unwrap_or(CropRegion::full(ctx.width, ctx.height));
        match ctx.encoding {
            PixelEncoding::PackedYuv422 => ctx.converter.convert_yuyv(data, crop),
            PixelEncoding::CompressedJpeg => {
                if !self.decoded {
                    ctx.converter.decode(data);
                    self.decoded = true;
                }
                ctx.converter.expand_decoded(crop)
            }
        }
    }

    /// Requeues the slot to the driver, consuming the handle.
    pub fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.ctx.release_frame()
    }
}

impl<D: Driver> Drop for Frame<'_, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.ctx.release_frame() {
            warn!("failed to requeue buffer {}: {}", self.index, err);
        }
    }
}

impl<D: Driver> fmt::Debug for Frame<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("bytes_used", &self.bytes_used)
            .field("sequence", &self.sequence)
            .finish()
    }
}
