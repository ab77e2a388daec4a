// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Minimal V4L2 streaming-capture binding.
//!
//! Only the handful of `videodev2.h` structures and ioctls needed for
//! single-planar MMAP capture are declared here. [`V4l2Device`] implements
//! [`Driver`] on top of them and [`Mapping`] owns one buffer's `mmap` region.

use crate::{
    capture::{Capabilities, Dequeued, Driver, FormatInfo},
    image::FourCC,
};
use nix::errno::Errno;
use std::{
    ffi::c_void,
    fs::{File, OpenOptions},
    io, mem,
    ops::Deref,
    os::{
        fd::{AsRawFd, RawFd},
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::Path,
    ptr::{self, NonNull},
    slice,
};
use tracing::{debug, warn};
use unix_ts::Timestamp;

#[allow(non_camel_case_types)]
mod sys {
    use std::ffi::c_void;

    pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
    pub const V4L2_MEMORY_MMAP: u32 = 1;
    pub const V4L2_FIELD_NONE: u32 = 1;

    pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
    pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
    pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_capability {
        pub driver: [u8; 16],
        pub card: [u8; 32],
        pub bus_info: [u8; 32],
        pub version: u32,
        pub capabilities: u32,
        pub device_caps: u32,
        pub reserved: [u32; 3],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_pix_format {
        pub width: u32,
        pub height: u32,
        pub pixelformat: u32,
        pub field: u32,
        pub bytesperline: u32,
        pub sizeimage: u32,
        pub colorspace: u32,
        pub priv_: u32,
        pub flags: u32,
        pub ycbcr_enc: u32,
        pub quantization: u32,
        pub xfer_func: u32,
    }

    // The kernel union contains pointer-bearing members (v4l2_window), so it
    // is pointer aligned and the ioctl size differs between 32 and 64 bit.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union v4l2_format_fmt {
        pub pix: v4l2_pix_format,
        pub raw_data: [u8; 200],
        _align: [*mut c_void; 25],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_format {
        pub type_: u32,
        pub fmt: v4l2_format_fmt,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_fract {
        pub numerator: u32,
        pub denominator: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_captureparm {
        pub capability: u32,
        pub capturemode: u32,
        pub timeperframe: v4l2_fract,
        pub extendedmode: u32,
        pub readbuffers: u32,
        pub reserved: [u32; 4],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union v4l2_streamparm_parm {
        pub capture: v4l2_captureparm,
        pub raw_data: [u8; 200],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_streamparm {
        pub type_: u32,
        pub parm: v4l2_streamparm_parm,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_requestbuffers {
        pub count: u32,
        pub type_: u32,
        pub memory: u32,
        pub capabilities: u32,
        pub flags: u8,
        pub reserved: [u8; 3],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_timecode {
        pub type_: u32,
        pub flags: u32,
        pub frames: u8,
        pub seconds: u8,
        pub minutes: u8,
        pub hours: u8,
        pub userbits: [u8; 4],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union v4l2_buffer_m {
        pub offset: u32,
        pub userptr: libc::c_ulong,
        pub planes: *mut c_void,
        pub fd: i32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_buffer {
        pub index: u32,
        pub type_: u32,
        pub bytesused: u32,
        pub flags: u32,
        pub field: u32,
        pub timestamp: libc::timeval,
        pub timecode: v4l2_timecode,
        pub sequence: u32,
        pub memory: u32,
        pub m: v4l2_buffer_m,
        pub length: u32,
        pub reserved2: u32,
        pub request_fd: i32,
    }

    nix::ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
    nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
    nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
    nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
    nix::ioctl_readwrite!(vidioc_s_parm, b'V', 22, v4l2_streamparm);
}

use sys::*;

/// Zero-initialised kernel structure.
fn zeroed<T: Copy>() -> T {
    // SAFETY: only used for the plain-data videodev2 structures above, for
    // which all-zero bytes (including null pointers) is a valid value.
    unsafe { mem::zeroed() }
}

/// Runs an ioctl, restarting it when interrupted by a signal.
fn xioctl<F>(mut f: F) -> Result<(), Errno>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
            Ok(_) => return Ok(()),
        }
    }
}

/// A V4L2 video node opened for non-blocking streaming capture.
#[derive(Debug)]
pub struct V4l2Device {
    file: File,
}

impl V4l2Device {
    /// Opens `path` read/write and non-blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be opened or is not a character
    /// device.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path.as_ref())?;

        if !file.metadata()?.file_type().is_char_device() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a character device", path.as_ref().display()),
            ));
        }

        Ok(Self { file })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn buffer_request(index: u32) -> v4l2_buffer {
        let mut buf: v4l2_buffer = zeroed();
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf.index = index;
        buf
    }
}

impl Driver for V4l2Device {
    type Mapping = Mapping;

    fn capabilities(&mut self) -> io::Result<Capabilities> {
        let fd = self.fd();
        let mut cap: v4l2_capability = zeroed();
        xioctl(|| unsafe { vidioc_querycap(fd, &mut cap) })?;

        let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };

        let card = String::from_utf8_lossy(&cap.card);
        debug!(
            "{}: capabilities {:#010x}",
            card.trim_end_matches('\0'),
            caps
        );

        Ok(Capabilities {
            video_capture: caps & V4L2_CAP_VIDEO_CAPTURE != 0,
            streaming: caps & V4L2_CAP_STREAMING != 0,
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()> {
        let fd = self.fd();
        let mut parm: v4l2_streamparm = zeroed();
        parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        parm.parm.capture = v4l2_captureparm {
            timeperframe: v4l2_fract {
                numerator: 1,
                denominator: fps,
            },
            ..zeroed()
        };
        xioctl(|| unsafe { vidioc_s_parm(fd, &mut parm) })?;
        Ok(())
    }

    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> io::Result<FormatInfo> {
        let fd = self.fd();
        let mut fmt: v4l2_format = zeroed();
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix = v4l2_pix_format {
            width,
            height,
            pixelformat: fourcc.to_u32(),
            field: V4L2_FIELD_NONE,
            ..zeroed()
        };
        xioctl(|| unsafe { vidioc_s_fmt(fd, &mut fmt) })?;

        // SAFETY: the driver fills the `pix` member for VIDEO_CAPTURE.
        let pix = unsafe { fmt.fmt.pix };
        Ok(FormatInfo {
            width: pix.width,
            height: pix.height,
            fourcc: FourCC::from(pix.pixelformat),
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let fd = self.fd();
        let mut req: v4l2_requestbuffers = zeroed();
        req.count = count;
        req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = V4L2_MEMORY_MMAP;
        xioctl(|| unsafe { vidioc_reqbufs(fd, &mut req) })?;
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<Mapping> {
        let fd = self.fd();
        let mut buf = Self::buffer_request(index);
        xioctl(|| unsafe { vidioc_querybuf(fd, &mut buf) })?;

        // SAFETY: `offset` is the member the driver fills for MMAP buffers.
        let offset = unsafe { buf.m.offset };
        Mapping::new(fd, buf.length as usize, offset as libc::off_t)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let fd = self.fd();
        let mut buf = Self::buffer_request(index);
        xioctl(|| unsafe { vidioc_qbuf(fd, &mut buf) })?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Option<Dequeued>> {
        let fd = self.fd();
        let mut buf = Self::buffer_request(0);
        match xioctl(|| unsafe { vidioc_dqbuf(fd, &mut buf) }) {
            Ok(()) => Ok(Some(Dequeued {
                index: buf.index,
                bytes_used: buf.bytesused as usize,
                sequence: buf.sequence,
                timestamp: Timestamp::new(
                    buf.timestamp.tv_sec as i64,
                    buf.timestamp.tv_usec as u32 * 1000,
                ),
            })),
            Err(Errno::EAGAIN) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let fd = self.fd();
        let kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        xioctl(|| unsafe { vidioc_streamon(fd, &kind) })?;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let fd = self.fd();
        let kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        xioctl(|| unsafe { vidioc_streamoff(fd, &kind) })?;
        Ok(())
    }
}

/// One driver buffer mapped into the process, unmapped when dropped.
///
/// The memory is shared with the capture hardware. The buffer manager only
/// exposes it while the owning slot is dequeued.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(fd: RawFd, len: usize, offset: libc::off_t) -> io::Result<Self> {
        // SAFETY: mapping a driver-provided offset of an open V4L2 node;
        // failure is reported as MAP_FAILED and checked below.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        debug!(len, offset, "buffer mapped");
        Ok(Self { ptr, len })
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_kernel_abi() {
        assert_eq!(mem::size_of::<v4l2_capability>(), 104);
        assert_eq!(mem::size_of::<v4l2_pix_format>(), 48);
        assert_eq!(mem::size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(mem::size_of::<v4l2_streamparm>(), 204);
        assert_eq!(mem::size_of::<v4l2_timecode>(), 16);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(mem::size_of::<v4l2_format>(), 208);
            assert_eq!(mem::size_of::<v4l2_buffer>(), 88);
        }
    }

    #[test]
    fn open_missing_node() {
        let err = V4l2Device::open("/dev/this-video-node-does-not-exist").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn open_regular_file_is_rejected() {
        let path = std::env::temp_dir().join("capturedisp-not-a-device");
        std::fs::write(&path, b"").unwrap();
        let err = V4l2Device::open(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let _ = std::fs::remove_file(&path);
    }
}
