// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pixel format conversion to RGBA.
//!
//! Packed YUYV is converted with fixed-point BT.601 coefficients scaled by 256:
//!
//! ```text
//! R = Y + (359 * V') >> 8
//! G = Y - (88 * U' + 183 * V') >> 8
//! B = Y + (454 * U') >> 8        where U' = U - 128, V' = V - 128
//! ```
//!
//! MJPEG frames are decoded with turbojpeg into an RGB intermediate and then
//! expanded. A frame that fails to decode produces opaque black output so the
//! display loop never stalls on a bad frame.

use crate::{
    image::{CropRegion, RgbImage, RgbaImage},
    Error,
};
use tracing::{instrument, warn};
use turbojpeg::{Decompressor, PixelFormat};

const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Scratch buffers and decoder state reused across frames.
pub struct Converter {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
    rgb: Vec<u8>,
    decoded: Option<(u32, u32)>,
    output: Option<(u32, u32)>,
    decompressor: Option<Decompressor>,
}

impl Converter {
    /// Converter for `width`x`height` source frames. The RGBA scratch buffer
    /// is sized for a full frame.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgba: vec![0; width as usize * height as usize * 4],
            rgb: Vec::new(),
            decoded: None,
            output: None,
            decompressor: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Frees the scratch buffers and the decompressor.
    pub fn release(&mut self) {
        self.rgba = Vec::new();
        self.rgb = Vec::new();
        self.decoded = None;
        self.output = None;
        self.decompressor = None;
    }

    fn scratch(&mut self, crop: &CropRegion) -> &mut [u8] {
        let len = crop.rgba_len();
        if self.rgba.len() < len {
            self.rgba.resize(len, 0);
        }
        &mut self.rgba[..len]
    }

    fn finish(&mut self, crop: &CropRegion) -> RgbaImage<'_> {
        self.output = Some((crop.width, crop.height));
        RgbaImage::new(&self.rgba[..crop.rgba_len()], crop.width, crop.height)
    }

    /// Converts the `crop` region of a packed YUYV frame.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCrop`] if the region leaves the frame and
    /// [`Error::TruncatedFrame`] if `src` is too short for it.
    pub fn convert_yuyv(&mut self, src: &[u8], crop: CropRegion) -> Result<RgbaImage<'_>, Error> {
        crop.check(self.width, self.height)?;
        let crop = crop.even_aligned();
        let width = self.width;
        yuyv_to_rgba(src, width, &crop, self.scratch(&crop))?;
        Ok(self.finish(&crop))
    }

    /// Decodes a JPEG frame into the RGB intermediate.
    ///
    /// Returns false and clears the intermediate if decoding fails or the
    /// frame is larger than the stream; the failure is logged rather than
    /// returned.
    #[instrument(skip_all, fields(len = src.len()))]
    pub fn decode(&mut self, src: &[u8]) -> bool {
        let mut decompressor = match self.decompressor.take() {
            Some(decompressor) => decompressor,
            None => match Decompressor::new() {
                Ok(decompressor) => decompressor,
                Err(err) => {
                    warn!("cannot create JPEG decompressor: {}", err);
                    self.decoded = None;
                    return false;
                }
            },
        };

        let limit = (self.width, self.height);
        let result = decompress(&mut decompressor, src, limit, &mut self.rgb);
        self.decompressor = Some(decompressor);

        match result {
            Ok(None) => {
                self.decoded = None;
                false
            }
            Ok(Some((width, height))) => {
                if width != self.width || height != self.height {
                    warn!(
                        "decoded {}x{} JPEG for a {}x{} stream",
                        width, height, self.width, self.height
                    );
                }
                self.decoded = Some((width, height));
                true
            }
            Err(err) => {
                warn!("dropping undecodable JPEG frame: {}", err);
                self.decoded = None;
                false
            }
        }
    }

    /// The last successfully decoded JPEG frame.
    pub fn decoded(&self) -> Option<RgbImage<'_>> {
        self.decoded.map(|(width, height)| {
            RgbImage::new(
                &self.rgb[..width as usize * height as usize * 3],
                width,
                height,
            )
        })
    }

    /// Expands the `crop` region of the decoded frame to RGBA, or fills it
    /// with black if the last decode failed.
    pub fn expand_decoded(&mut self, crop: CropRegion) -> Result<RgbaImage<'_>, Error> {
        crop.check(self.width, self.height)?;
        let crop = crop.even_aligned();

        let len = crop.rgba_len();
        if self.rgba.len() < len {
            self.rgba.resize(len, 0);
        }
        let dst = &mut self.rgba[..len];
        match self.decoded {
            Some((width, height)) => {
                let rgb = &self.rgb[..width as usize * height as usize * 3];
                rgb_to_rgba(&RgbImage::new(rgb, width, height), &crop, dst);
            }
            None => fill_black(dst),
        }
        Ok(self.finish(&crop))
    }

    /// Decodes and expands a JPEG frame in one step.
    pub fn convert_jpeg(&mut self, src: &[u8], crop: CropRegion) -> Result<RgbaImage<'_>, Error> {
        self.decode(src);
        self.expand_decoded(crop)
    }

    /// Output of the last conversion.
    pub fn output(&self) -> Option<RgbaImage<'_>> {
        let (width, height) = self.output?;
        let len = width as usize * height as usize * 4;
        self.rgba
            .get(..len)
            .map(|data| RgbaImage::new(data, width, height))
    }
}

/// Decodes `src` into `rgb`. Frames whose header claims more than `limit`
/// pixels in either direction are dropped before anything is allocated.
fn decompress(
    decompressor: &mut Decompressor,
    src: &[u8],
    limit: (u32, u32),
    rgb: &mut Vec<u8>,
) -> Result<Option<(u32, u32)>, turbojpeg::Error> {
    let header = decompressor.read_header(src)?;
    if header.width > limit.0 as usize || header.height > limit.1 as usize {
        warn!(
            "dropping {}x{} JPEG frame larger than the {}x{} stream",
            header.width, header.height, limit.0, limit.1
        );
        return Ok(None);
    }
    let pitch = header.width * 3;
    rgb.resize(pitch * header.height, 0);

    let image = turbojpeg::Image {
        pixels: &mut rgb[..],
        width: header.width,
        pitch,
        height: header.height,
        format: PixelFormat::RGB,
    };
    decompressor.decompress(src, image)?;
    Ok(Some((header.width as u32, header.height as u32)))
}

#[inline(always)]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Converts the `crop` region of a packed YUYV frame `src_width` pixels wide
/// into tightly packed RGBA in `dst`.
///
/// `crop.x` must already be even and `dst` must hold `crop.rgba_len()` bytes.
/// An odd crop width is handled by writing only the first pixel of the last
/// macropixel.
pub fn yuyv_to_rgba(
    src: &[u8],
    src_width: u32,
    crop: &CropRegion,
    dst: &mut [u8],
) -> Result<(), Error> {
    debug_assert_eq!(crop.x & 1, 0);
    let stride = src_width as usize * 2;
    let pairs = (crop.width as usize + 1) / 2;
    let row_bytes = pairs * 4;
    let x_offset = crop.x as usize * 2;

    if crop.width == 0 || crop.height == 0 {
        return Ok(());
    }
    let expected = (crop.y + crop.height - 1) as usize * stride + x_offset + row_bytes;
    if src.len() < expected {
        return Err(Error::TruncatedFrame {
            expected,
            actual: src.len(),
        });
    }

    let out_stride = crop.width as usize * 4;
    for (row, out) in dst[..crop.rgba_len()]
        .chunks_exact_mut(out_stride)
        .enumerate()
    {
        let start = (crop.y as usize + row) * stride + x_offset;
        let line = &src[start..start + row_bytes];

        for (mp, px) in line.chunks_exact(4).zip(out.chunks_mut(8)) {
            let y0 = mp[0] as i32;
            let u = mp[1] as i32 - 128;
            let y1 = mp[2] as i32;
            let v = mp[3] as i32 - 128;

            let ruv = (359 * v) >> 8;
            let guv = (88 * u + 183 * v) >> 8;
            let buv = (454 * u) >> 8;

            px[0] = clamp(y0 + ruv);
            px[1] = clamp(y0 - guv);
            px[2] = clamp(y0 + buv);
            px[3] = 255;
            if px.len() == 8 {
                px[4] = clamp(y1 + ruv);
                px[5] = clamp(y1 - guv);
                px[6] = clamp(y1 + buv);
                px[7] = 255;
            }
        }
    }
    Ok(())
}

/// Copies the `crop` region of an RGB image into RGBA. Pixels of the region
/// that fall outside `src` are black.
pub fn rgb_to_rgba(src: &RgbImage, crop: &CropRegion, dst: &mut [u8]) {
    let src_stride = src.width() as usize * 3;
    let out_stride = crop.width as usize * 4;
    let data = src.data();

    let cols = src.width().saturating_sub(crop.x).min(crop.width) as usize;
    for (row, out) in dst[..crop.rgba_len()]
        .chunks_exact_mut(out_stride)
        .enumerate()
    {
        let y = crop.y as usize + row;
        let (covered, rest) = out.split_at_mut(if y < src.height() as usize {
            cols * 4
        } else {
            0
        });

        if !covered.is_empty() {
            let start = y * src_stride + crop.x as usize * 3;
            match data.get(start..start + cols * 3) {
                Some(line) => {
                    for (rgb, px) in line.chunks_exact(3).zip(covered.chunks_exact_mut(4)) {
                        px.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
                    }
                }
                None => fill_black(covered),
            }
        }
        fill_black(rest);
    }
}

fn fill_black(dst: &mut [u8]) {
    for px in dst.chunks_exact_mut(4) {
        px.copy_from_slice(&BLACK);
    }
}
