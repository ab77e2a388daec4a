// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Border detection.
//!
//! Two independent heuristics propose crop regions from raw luma:
//!
//! - [`BorderDetector::sample`] classifies the frame into a known [`Layout`]
//!   on a fixed cadence. Classification only re-runs when the probe luma moved
//!   by more than a debounce threshold, or while the current label is
//!   [`Layout::Unframed`].
//! - [`scan_borders`] walks inward from each edge looking for the first
//!   column or row that is clearly brighter than the border.
//!
//! All coordinates and thresholds come from [`DetectorConfig`]; the defaults
//! are calibrated for 1920x1080 captures.

use crate::{
    image::{CropRegion, RgbImage, YuyvImage},
    Error,
};
use serde::{Deserialize, Serialize};
use std::{fmt, fs::File, io::BufReader, path::Path};
use tracing::{debug, info, instrument, trace};

/// Random access to 8-bit luma.
///
/// Coordinates outside the frame read as 0.
pub trait LumaSource {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn luma(&self, x: u32, y: u32) -> u8;
}

impl LumaSource for YuyvImage<'_> {
    fn width(&self) -> u32 {
        YuyvImage::width(self)
    }

    fn height(&self) -> u32 {
        YuyvImage::height(self)
    }

    fn luma(&self, x: u32, y: u32) -> u8 {
        YuyvImage::luma(self, x, y)
    }
}

impl LumaSource for RgbImage<'_> {
    fn width(&self) -> u32 {
        RgbImage::width(self)
    }

    fn height(&self) -> u32 {
        RgbImage::height(self)
    }

    fn luma(&self, x: u32, y: u32) -> u8 {
        RgbImage::luma(self, x, y)
    }
}

/// Luma of an acquired frame, whatever its encoding.
#[derive(Debug, Clone, Copy)]
pub enum LumaView<'a> {
    /// Y bytes read in place from a packed frame
    Packed(YuyvImage<'a>),
    /// Decoded MJPEG frame
    Decoded(RgbImage<'a>),
    /// MJPEG frame that failed to decode, reads as black
    Blank { width: u32, height: u32 },
}

impl LumaSource for LumaView<'_> {
    fn width(&self) -> u32 {
        match self {
            LumaView::Packed(img) => img.width(),
            LumaView::Decoded(img) => img.width(),
            LumaView::Blank { width, .. } => *width,
        }
    }

    fn height(&self) -> u32 {
        match self {
            LumaView::Packed(img) => img.height(),
            LumaView::Decoded(img) => img.height(),
            LumaView::Blank { height, .. } => *height,
        }
    }

    fn luma(&self, x: u32, y: u32) -> u8 {
        match self {
            LumaView::Packed(img) => img.luma(x, y),
            LumaView::Decoded(img) => img.luma(x, y),
            LumaView::Blank { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Content layouts the classifier recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// No recognized border, the whole frame is content
    Unframed,
    LayoutA,
    LayoutB,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Layout::Unframed => write!(f, "unframed"),
            Layout::LayoutA => write!(f, "layout A"),
            Layout::LayoutB => write!(f, "layout B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Disabled, or waiting for the cooldown to elapse
    Idle,
    /// Probes taken, classification unchanged
    Sampling,
    /// A new crop region was published
    Applying,
}

/// Parameters of the edge scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Minimum luma counted as content
    pub content_min_luma: u8,
    /// Content must also exceed the sampled border luma by this much
    pub border_margin: u8,
    /// Column sampled on the middle row to estimate border luma
    pub baseline_x: u32,
    pub step: u32,
    /// First column of the left edge scan
    pub left_start: u32,
    /// Distance from the right edge where the right scan starts
    pub right_inset: u32,
    /// First row of the top edge scan
    pub top_start: u32,
    /// Distance from the bottom edge where the bottom scan starts
    pub bottom_inset: u32,
    /// The bottom scan runs this far right of the detected left edge
    pub bottom_column_offset: u32,
    /// Below this the detected center column is replaced by the frame center
    pub min_center_x: u32,
    pub min_left: u32,
    pub min_extent: u32,
    pub snap: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            content_min_luma: 40,
            border_margin: 15,
            baseline_x: 200,
            step: 2,
            left_start: 150,
            right_inset: 150,
            top_start: 120,
            bottom_inset: 100,
            bottom_column_offset: 50,
            min_center_x: 200,
            min_left: 50,
            min_extent: 200,
            snap: 4,
        }
    }
}

/// Probe coordinates, thresholds and per-layout regions of the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Frames between evaluations
    pub cooldown_frames: u32,
    /// Points whose summed luma change gates reclassification
    pub change_probes: Vec<Point>,
    pub change_threshold: u32,
    /// Points that lie in the border of every recognized layout
    pub border_probes: Vec<Point>,
    pub border_max_luma: u8,
    pub layout_a_probe: Point,
    pub layout_b_probe: Point,
    pub layout_min_luma: u8,
    pub center_probe: Point,
    pub center_min_luma: u8,
    /// Tie-break between the layouts when neither edge probe is lit
    pub fallback_probe: Point,
    pub fallback_min_luma: u8,
    pub layout_a: CropRegion,
    pub layout_b: CropRegion,
    pub scan: ScanConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cooldown_frames: 30,
            change_probes: vec![
                Point::new(400, 200),
                Point::new(400, 400),
                Point::new(400, 600),
                Point::new(400, 800),
            ],
            change_threshold: 60,
            border_probes: vec![
                Point::new(400, 300),
                Point::new(400, 500),
                Point::new(400, 700),
            ],
            border_max_luma: 30,
            layout_a_probe: Point::new(700, 85),
            layout_b_probe: Point::new(700, 95),
            layout_min_luma: 20,
            center_probe: Point::new(960, 540),
            center_min_luma: 10,
            fallback_probe: Point::new(700, 83),
            fallback_min_luma: 15,
            layout_a: CropRegion::new(448, 83, 1024, 912),
            layout_b: CropRegion::new(448, 92, 1024, 896),
            scan: ScanConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Crop region for `layout` on a `width`x`height` source.
    pub fn region(&self, layout: Layout, width: u32, height: u32) -> CropRegion {
        match layout {
            Layout::Unframed => CropRegion::full(width, height),
            Layout::LayoutA => self.layout_a,
            Layout::LayoutB => self.layout_b,
        }
    }
}

/// The manual scan found no plausible content rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound;

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no content border found")
    }
}

/// A classification change published by [`BorderDetector::sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub layout: Layout,
    pub region: CropRegion,
}

/// Continuous layout classifier with cooldown and debounce.
#[derive(Debug, Clone)]
pub struct BorderDetector {
    config: DetectorConfig,
    enabled: bool,
    cooldown: u32,
    samples: Vec<u8>,
    layout: Layout,
    state: DetectorState,
}

impl BorderDetector {
    /// A disabled detector.
    pub fn new(config: DetectorConfig) -> Self {
        let samples = vec![0; config.change_probes.len()];
        Self {
            config,
            enabled: false,
            cooldown: 0,
            samples,
            layout: Layout::Unframed,
            state: DetectorState::Idle,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Enables or disables continuous classification. Enabling resets the
    /// cooldown, stored samples and label so the next frame is evaluated.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.cooldown = 0;
            self.samples.iter_mut().for_each(|s| *s = 0);
            self.layout = Layout::Unframed;
        }
        self.enabled = enabled;
        self.state = DetectorState::Idle;
    }

    /// Advances the cadence by one frame. Returns true when this frame
    /// should be sampled.
    pub fn tick(&mut self) -> bool {
        if !self.enabled || self.cooldown > 0 {
            self.cooldown = self.cooldown.saturating_sub(1);
            self.state = DetectorState::Idle;
            return false;
        }
        self.cooldown = self.config.cooldown_frames.saturating_sub(1);
        true
    }

    /// Takes the debounce probes and reclassifies if needed. Returns the new
    /// layout and its region when the label changed.
    #[instrument(skip_all)]
    pub fn sample<L: LumaSource>(&mut self, luma: &L) -> Option<Detection> {
        if !self.enabled {
            self.state = DetectorState::Idle;
            return None;
        }
        self.state = DetectorState::Sampling;

        let mut diff = 0u32;
        for (probe, last) in self.config.change_probes.iter().zip(self.samples.iter_mut()) {
            let value = luma.luma(probe.x, probe.y);
            diff += value.abs_diff(*last) as u32;
            *last = value;
        }

        if diff <= self.config.change_threshold && self.layout != Layout::Unframed {
            trace!(diff, "content unchanged");
            return None;
        }

        let layout = self.classify(luma);
        if layout == self.layout {
            return None;
        }

        info!("layout changed from {} to {}", self.layout, layout);
        self.layout = layout;
        self.state = DetectorState::Applying;
        Some(Detection {
            layout,
            region: self.config.region(layout, luma.width(), luma.height()),
        })
    }

    /// [`BorderDetector::tick`] followed by [`BorderDetector::sample`] when
    /// the frame is due.
    pub fn update<L: LumaSource>(&mut self, luma: &L) -> Option<Detection> {
        if self.tick() {
            self.sample(luma)
        } else {
            None
        }
    }

    /// Decision tree over the classification probes.
    pub fn classify<L: LumaSource>(&self, luma: &L) -> Layout {
        let c = &self.config;
        let at = |p: &Point| luma.luma(p.x, p.y);

        if c.border_probes.iter().any(|p| at(p) > c.border_max_luma) {
            return Layout::Unframed;
        }
        if at(&c.layout_a_probe) > c.layout_min_luma {
            return Layout::LayoutA;
        }
        if at(&c.layout_b_probe) > c.layout_min_luma {
            return Layout::LayoutB;
        }
        if at(&c.center_probe) > c.center_min_luma {
            if at(&c.fallback_probe) > c.fallback_min_luma {
                return Layout::LayoutA;
            }
            return Layout::LayoutB;
        }
        Layout::Unframed
    }

    /// One-shot edge scan. A successful scan disables continuous
    /// classification and resets the label to [`Layout::Unframed`]; a
    /// failed one leaves the detector untouched.
    pub fn scan<L: LumaSource>(&mut self, luma: &L) -> Result<CropRegion, NotFound> {
        let region = scan_borders(luma, &self.config.scan)?;
        self.enabled = false;
        self.layout = Layout::Unframed;
        self.state = DetectorState::Applying;
        Ok(region)
    }
}

/// Scans inward from the four edges for the dark-to-bright transition and
/// returns the enclosed rectangle snapped to `config.snap` pixels.
#[instrument(skip_all)]
pub fn scan_borders<L: LumaSource>(luma: &L, config: &ScanConfig) -> Result<CropRegion, NotFound> {
    let (width, height) = (luma.width(), luma.height());
    let step = config.step.max(1) as usize;
    let mid_y = height / 2;

    let baseline = luma.luma(config.baseline_x, mid_y) as u32;
    let is_content = |x: u32, y: u32| {
        let value = luma.luma(x, y) as u32;
        value > config.content_min_luma as u32 && value > baseline + config.border_margin as u32
    };

    let left = (config.left_start..width / 2)
        .step_by(step)
        .find(|&x| is_content(x, mid_y));
    let right = (width / 2 + 1..=width.saturating_sub(config.right_inset))
        .rev()
        .step_by(step)
        .find(|&x| is_content(x, mid_y))
        .map(|x| x + 1);
    debug!(baseline, ?left, ?right, "horizontal scan");
    let (left, right) = (left.ok_or(NotFound)?, right.ok_or(NotFound)?);

    let mut center_x = (left + right) / 2;
    if center_x < config.min_center_x {
        center_x = width / 2;
    }
    let top = (config.top_start..height / 2)
        .step_by(step)
        .find(|&y| is_content(center_x, y));

    let bottom_x = if left > 0 {
        left.saturating_add(config.bottom_column_offset)
    } else {
        width / 3
    };
    let bottom = (height / 2 + 1..=height.saturating_sub(config.bottom_inset))
        .rev()
        .step_by(step)
        .find(|&y| is_content(bottom_x, y))
        .map(|y| y + 1);
    debug!(?top, ?bottom, "vertical scan");
    let (top, bottom) = (top.ok_or(NotFound)?, bottom.ok_or(NotFound)?);

    if left < config.min_left
        || right - left < config.min_extent
        || bottom - top < config.min_extent
    {
        debug!(left, top, right, bottom, "rectangle rejected");
        return Err(NotFound);
    }

    let snap = config.snap.max(1);
    let x = left - left % snap;
    let y = top - top % snap;
    let w = (right - x).div_ceil(snap) * snap;
    let h = (bottom - y).div_ceil(snap) * snap;
    let w = w.min((width - x) / snap * snap);
    let h = h.min((height - y) / snap * snap);
    let region = CropRegion::new(x, y, w, h);
    info!("border scan found {}", region);
    Ok(region)
}
