// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::Error;
use core::fmt;
use serde::{Deserialize, Serialize};
use turbojpeg::OwnedBuf;

/// Four character code identifying a V4L2 pixel format.
///
/// V4L2 packs the characters little-endian regardless of host byte order, so
/// `FourCC(*b"YUYV")` converts to the same `u32` the kernel headers define.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<u32> for FourCC {
    fn from(val: u32) -> FourCC {
        FourCC(val.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> u32 {
        val.to_u32()
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.0 {
            let c = if c.is_ascii_graphic() { c as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// YUYV 4:2:2 packed format, `[Y0, U, Y1, V]` per two pixels
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// Motion-JPEG, one baseline JPEG still per frame
pub const MJPG: FourCC = FourCC(*b"MJPG");

/// RGB 24-bit pixel format (8 bits per channel, no alpha)
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// Pixel encodings the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    /// Packed 4:2:2 luma/chroma, two pixels per 4-byte macropixel
    PackedYuv422,
    /// Self-contained JPEG still per frame
    CompressedJpeg,
}

impl PixelEncoding {
    pub fn fourcc(&self) -> FourCC {
        match self {
            PixelEncoding::PackedYuv422 => YUYV,
            PixelEncoding::CompressedJpeg => MJPG,
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match fourcc {
            YUYV => Some(PixelEncoding::PackedYuv422),
            MJPG => Some(PixelEncoding::CompressedJpeg),
            _ => None,
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

/// Rectangle in source-frame pixel coordinates selecting the area to convert.
///
/// A usable region has a non-zero extent and lies inside the source frame.
/// YUYV groups pixels in pairs, so converters round `x` down to an even
/// column before use, see [`CropRegion::even_aligned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropRegion {
    /// X coordinate of top-left corner
    pub x: u32,
    /// Y coordinate of top-left corner
    pub y: u32,
    /// Width of the rectangle in pixels
    pub width: u32,
    /// Height of the rectangle in pixels
    pub height: u32,
}

impl CropRegion {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering a whole `width`x`height` frame.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Returns true if the region is non-empty and lies inside a
    /// `width`x`height` frame.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    /// Like [`CropRegion::fits`] but as a `Result` carrying the frame size.
    pub fn check(&self, width: u32, height: u32) -> Result<(), Error> {
        if self.fits(width, height) {
            Ok(())
        } else {
            Err(Error::InvalidCrop(*self, width, height))
        }
    }

    /// The same region with `x` rounded down to the macropixel boundary.
    pub fn even_aligned(&self) -> Self {
        Self {
            x: self.x & !1,
            ..*self
        }
    }

    pub fn same_size(&self, other: &CropRegion) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Size in bytes of the region once converted to RGBA.
    pub fn rgba_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl fmt::Display for CropRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({},{})",
            self.width, self.height, self.x, self.y
        )
    }
}

/// Borrowed view of a packed YUYV frame.
#[derive(Debug, Clone, Copy)]
pub struct YuyvImage<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl<'a> YuyvImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Luma of the pixel at (`x`, `y`); 0 outside the frame or payload.
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 2;
        self.data.get(idx).copied().unwrap_or(0)
    }
}

/// Borrowed view of a tightly packed RGB frame, as produced by the JPEG
/// decoder.
#[derive(Debug, Clone, Copy)]
pub struct RgbImage<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl<'a> RgbImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// BT.601 luma of the pixel at (`x`, `y`); 0 outside the frame.
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        match self.data.get(idx..idx + 3) {
            Some(px) => {
                ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8
            }
            None => 0,
        }
    }
}

/// Converted output frame: row-major RGBA, alpha always 255.
#[derive(Debug, Clone, Copy)]
pub struct RgbaImage<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl<'a> RgbaImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_stride(&self) -> usize {
        self.width as usize * 4
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y as usize * self.row_stride() + x as usize * 4;
        self.data
            .get(idx..idx + 4)
            .map(|px| [px[0], px[1], px[2], px[3]])
    }
}

impl fmt::Display for RgbaImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, RGBA)
    }
}

/// Encodes a converted RGBA frame to JPEG using turbojpeg.
///
/// # Example
///
/// ```
/// use capturedisp::image::{encode_jpeg, RgbaImage};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pixels = vec![255u8; 64 * 48 * 4];
/// let jpeg = encode_jpeg(&RgbaImage::new(&pixels, 64, 48), 90)?;
/// assert!(jpeg.len() > 0);
/// # Ok(())
/// # }
/// ```
pub fn encode_jpeg(img: &RgbaImage, quality: i32) -> Result<OwnedBuf, Error> {
    let image = turbojpeg::Image {
        width: img.width() as usize,
        height: img.height() as usize,
        format: turbojpeg::PixelFormat::RGBA,
        pixels: img.data(),
        pitch: img.row_stride(),
    };

    Ok(turbojpeg::compress(image, quality, turbojpeg::Subsamp::Sub2x2)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_matches_kernel_values() {
        // v4l2_fourcc('Y','U','Y','V') and v4l2_fourcc('M','J','P','G')
        assert_eq!(YUYV.to_u32(), 0x5659_5559);
        assert_eq!(MJPG.to_u32(), 0x4750_4a4d);
        assert_eq!(FourCC::from(0x5659_5559), YUYV);
        assert_eq!(YUYV.to_string(), "YUYV");
    }

    #[test]
    fn crop_fits() {
        let crop = CropRegion::new(448, 83, 1024, 912);
        assert!(crop.fits(1920, 1080));
        assert!(!crop.fits(1024, 912));
        assert!(!CropRegion::new(0, 0, 0, 10).fits(1920, 1080));
        assert!(!CropRegion::new(u32::MAX, 0, 2, 2).fits(1920, 1080));
        assert!(CropRegion::full(1920, 1080).check(1920, 1080).is_ok());
        assert!(matches!(
            CropRegion::new(1900, 0, 100, 10).check(1920, 1080),
            Err(Error::InvalidCrop(_, 1920, 1080))
        ));
    }

    #[test]
    fn crop_even_alignment() {
        let crop = CropRegion::new(449, 83, 1024, 912).even_aligned();
        assert_eq!(crop, CropRegion::new(448, 83, 1024, 912));
        assert_eq!(crop.rgba_len(), 1024 * 912 * 4);
    }

    #[test]
    fn yuyv_luma_sampling() {
        // 4x2 frame, luma = column + 10 * row
        let mut data = vec![0u8; 4 * 2 * 2];
        for y in 0..2 {
            for x in 0..4 {
                data[(y * 4 + x) * 2] = (x + 10 * y) as u8;
                data[(y * 4 + x) * 2 + 1] = 128;
            }
        }
        let img = YuyvImage::new(&data, 4, 2);
        assert_eq!(img.luma(0, 0), 0);
        assert_eq!(img.luma(3, 0), 3);
        assert_eq!(img.luma(1, 1), 11);
        assert_eq!(img.luma(4, 0), 0);
        assert_eq!(img.luma(0, 2), 0);
    }

    #[test]
    fn rgb_luma_sampling() {
        let data = [255, 255, 255, 0, 0, 0];
        let img = RgbImage::new(&data, 2, 1);
        assert_eq!(img.luma(0, 0), 255);
        assert_eq!(img.luma(1, 0), 0);
    }
}
