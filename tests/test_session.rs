// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use capturedisp::{
    capture::CaptureConfig,
    detect::{DetectorConfig, Layout},
    image::{CropRegion, PixelEncoding},
    session::{CropChange, CropSource, Session, SessionOptions},
    Error,
};
use common::{open_mock, MockDevice, MockDriver, Scene};
use std::{cell::RefCell, rc::Rc};

const W: u32 = 1920;
const H: u32 = 1080;

fn session(
    device: MockDevice,
    auto_detect: bool,
) -> (Session<MockDriver>, Rc<RefCell<common::MockStats>>) {
    let options = SessionOptions {
        capture: CaptureConfig::default(),
        auto_detect,
        ..Default::default()
    };
    let (ctx, stats) = open_mock(device, options.capture.clone());
    (Session::new(ctx.unwrap(), options), stats)
}

/// Polls `frames` times, collecting crop changes and output sizes.
fn drive(session: &mut Session<MockDriver>, frames: usize) -> (Vec<CropChange>, Vec<(u32, u32)>) {
    let mut changes = Vec::new();
    let mut sizes = Vec::new();
    for _ in 0..frames {
        let update = session.poll().unwrap().unwrap();
        if let Some(change) = update.crop_change {
            changes.push(change);
        }
        sizes.push((update.image.width(), update.image.height()));
        assert_eq!(
            (update.crop.width, update.crop.height),
            (update.image.width(), update.image.height())
        );
    }
    (changes, sizes)
}

#[test]
fn test_auto_detect_publishes_layout_once() {
    let layout_a = DetectorConfig::default().layout_a;
    let device = MockDevice::yuyv(W, H, Scene::framed(W, H, layout_a).yuyv());
    let (mut session, _) = session(device, true);
    assert_eq!(session.crop(), CropRegion::full(W, H));

    let (changes, sizes) = drive(&mut session, 120);
    assert_eq!(changes.len(), 1);
    let change = changes[0];
    assert_eq!(change.region, layout_a);
    assert_eq!(change.previous, CropRegion::full(W, H));
    assert!(change.resized);
    assert_eq!(change.source, CropSource::Auto(Layout::LayoutA));

    // The change is applied before the frame is converted.
    assert!(sizes.iter().all(|&size| size == (1024, 912)));

    let status = session.status();
    assert!(status.auto_detect);
    assert_eq!(status.layout, Layout::LayoutA);
    assert_eq!(status.crop, layout_a);
    assert_eq!(status.buffers, 2);
    println!("{}", status);
}

#[test]
fn test_auto_detect_disabled_keeps_full_frame() {
    let layout_a = DetectorConfig::default().layout_a;
    let device = MockDevice::yuyv(W, H, Scene::framed(W, H, layout_a).yuyv());
    let (mut session, _) = session(device, false);

    let (changes, sizes) = drive(&mut session, 40);
    assert!(changes.is_empty());
    assert!(sizes.iter().all(|&size| size == (W, H)));
    assert_eq!(session.status().layout, Layout::Unframed);
}

#[test]
fn test_mjpeg_session() {
    let layout_b = DetectorConfig::default().layout_b;
    let device = MockDevice::mjpeg(W, H, Scene::framed(W, H, layout_b).jpeg());
    let (mut session, _) = session(device, true);
    assert_eq!(session.status().encoding, PixelEncoding::CompressedJpeg);

    let update = session.poll().unwrap().unwrap();
    let change = update.crop_change.unwrap();
    assert_eq!(change.region, layout_b);
    assert_eq!((update.image.width(), update.image.height()), (1024, 896));
    let px = update.image.pixel(512, 448).unwrap();
    assert!(px[0].abs_diff(220) <= 4);
}

#[test]
fn test_bad_mjpeg_frames_are_black() {
    let device = MockDevice::mjpeg(W, H, b"not a jpeg at all".to_vec());
    let (mut session, _) = session(device, true);

    for _ in 0..3 {
        let update = session.poll().unwrap().unwrap();
        assert!(update.crop_change.is_none());
        assert_eq!((update.image.width(), update.image.height()), (W, H));
        assert!(update
            .image
            .data()
            .chunks_exact(4)
            .all(|px| px == [0, 0, 0, 255]));
    }
    assert_eq!(session.status().layout, Layout::Unframed);
}

#[test]
fn test_no_frame_ready() {
    let device = MockDevice::yuyv(W, H, Scene::uniform(W, H, 128).yuyv());
    let (mut session, stats) = session(device, false);
    stats.borrow_mut().starved = true;
    assert!(session.poll().unwrap().is_none());
    stats.borrow_mut().starved = false;
    assert!(session.poll().unwrap().is_some());
}

#[test]
fn test_short_packed_frame_is_skipped() {
    let device = MockDevice::yuyv(W, H, Scene::uniform(W, H, 128).yuyv());
    let (mut session, stats) = session(device, false);

    stats.borrow_mut().short_payload = Some((W * H) as usize);
    assert!(session.poll().unwrap().is_none());
    assert_eq!(session.capture().acquired(), None);
    assert_eq!(stats.borrow().queued.len(), 2);

    stats.borrow_mut().short_payload = None;
    let update = session.poll().unwrap().unwrap();
    assert_eq!((update.image.width(), update.image.height()), (W, H));
    assert_eq!(update.image.pixel(0, 0), Some([128, 128, 128, 255]));
}

#[test]
fn test_preset_crop() {
    let device = MockDevice::yuyv(W, H, Scene::uniform(W, H, 128).yuyv());
    let (mut session, _) = session(device, false);

    let preset = CropRegion::new(320, 180, 1280, 720);
    session.set_crop(preset).unwrap();
    session.set_crop(CropRegion::new(0, 0, 1280, 720)).unwrap();

    // Both changes are merged into one notification.
    let update = session.poll().unwrap().unwrap();
    let change = update.crop_change.unwrap();
    assert_eq!(change.region, CropRegion::new(0, 0, 1280, 720));
    assert_eq!(change.previous, CropRegion::full(W, H));
    assert!(change.resized);
    assert_eq!(change.source, CropSource::Preset);
    assert_eq!((update.image.width(), update.image.height()), (1280, 720));

    let update = session.poll().unwrap().unwrap();
    assert!(update.crop_change.is_none());

    assert!(matches!(
        session.set_crop(CropRegion::new(1000, 0, 1280, 720)),
        Err(Error::InvalidCrop(..))
    ));
    assert_eq!(session.crop(), CropRegion::new(0, 0, 1280, 720));
}

#[test]
fn test_crop_restored_before_delivery() {
    let device = MockDevice::yuyv(W, H, Scene::uniform(W, H, 128).yuyv());
    let (mut session, _) = session(device, false);

    session.set_crop(CropRegion::new(320, 180, 1280, 720)).unwrap();
    session.set_crop(CropRegion::full(W, H)).unwrap();

    let update = session.poll().unwrap().unwrap();
    assert!(update.crop_change.is_none());
    assert_eq!(update.crop, CropRegion::full(W, H));
    assert_eq!((update.image.width(), update.image.height()), (W, H));
}

#[test]
fn test_manual_scan() {
    let interior = CropRegion::new(400, 200, 1100, 700);
    let device = MockDevice::yuyv(W, H, Scene::framed(W, H, interior).yuyv());
    let (mut session, _) = session(device, true);
    session.request_scan();

    let update = session.poll().unwrap().unwrap();
    let change = update.crop_change.unwrap();
    assert_eq!(change.region, interior);
    assert_eq!(change.source, CropSource::Scan);
    assert_eq!((update.image.width(), update.image.height()), (1100, 700));

    let status = session.status();
    assert!(!status.auto_detect);
    assert_eq!(status.layout, Layout::Unframed);

    // Auto detection stays off afterwards.
    let (changes, _) = drive(&mut session, 60);
    assert!(changes.is_empty());
}

#[test]
fn test_manual_scan_not_found_keeps_crop() {
    let device = MockDevice::yuyv(W, H, Scene::uniform(W, H, 8).yuyv());
    let (mut session, _) = session(device, true);
    session.request_scan();

    let update = session.poll().unwrap().unwrap();
    assert!(update.crop_change.is_none());
    assert_eq!(update.crop, CropRegion::full(W, H));
    assert!(session.status().auto_detect);
}

#[test]
fn test_set_buffer_count() {
    let device = MockDevice::yuyv(W, H, Scene::uniform(W, H, 128).yuyv());
    let (mut session, stats) = session(device, false);
    session.set_crop(CropRegion::new(0, 0, 640, 480)).unwrap();

    session.set_buffer_count(4).unwrap();
    assert_eq!(session.status().buffers, 4);
    assert_eq!(stats.borrow().mapped, 4);
    assert_eq!(stats.borrow().handles, 1);
    assert_eq!(session.crop(), CropRegion::new(0, 0, 640, 480));

    session.set_buffer_count(0).unwrap();
    assert_eq!(session.status().buffers, 1);
    session.set_buffer_count(7).unwrap();
    assert_eq!(session.status().buffers, 4);

    assert!(session.poll().unwrap().is_some());
}

#[test]
fn test_initial_crop_must_fit() {
    let device = MockDevice::yuyv(640, 480, Scene::uniform(640, 480, 128).yuyv());
    let options = SessionOptions {
        crop: Some(CropRegion::new(448, 83, 1024, 912)),
        ..Default::default()
    };
    let (ctx, _) = open_mock(device, options.capture.clone());
    let session = Session::new(ctx.unwrap(), options);
    assert_eq!(session.crop(), CropRegion::full(640, 480));
}
