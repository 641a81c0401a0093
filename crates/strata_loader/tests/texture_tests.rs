//! Integration tests for texture admission and throttling

mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use image::{DynamicImage, Rgba, RgbaImage};
use strata_loader::{
    LoadEvent, LoadOptions, LoadSession, MemorySource, PipelineConfig, TextureConfig,
    TextureOptions, TextureThrottler,
};
use strata_scene::{MaterialTransfer, PackTransfer};

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([200, 100, 50, 255]),
    ));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Ceiling 2, five simultaneous requests with one engineered to fail:
/// at most two run at once, all five resolve.
#[test]
fn five_requests_through_a_ceiling_of_two() {
    let throttler = TextureThrottler::new(TextureConfig {
        ceiling: 2,
        memory_budget_bytes: 64 * 1024 * 1024,
    });
    let mut source = MemorySource::new();
    for i in 0..4 {
        source.insert(format!("tex{i}.png"), png_bytes(8, 8));
    }
    let source = Arc::new(source);

    let mut tickets: Vec<_> = (0..4)
        .map(|i| {
            throttler.request(
                format!("tex{i}.png"),
                TextureOptions::default(),
                source.clone(),
            )
        })
        .collect();
    tickets.push(throttler.request(
        "broken.png",
        TextureOptions::default(),
        source.clone(),
    ));

    let mut resolved = 0;
    let mut failed = 0;
    for ticket in &mut tickets {
        match ticket.wait_timeout(Duration::from_secs(10)).unwrap() {
            Some(_) => resolved += 1,
            None => failed += 1,
        }
    }
    assert_eq!((resolved, failed), (4, 1));
    assert!(throttler.high_water() <= 2, "ceiling exceeded");
    assert_eq!(throttler.in_flight(), 0);
    assert_eq!(throttler.pending(), 0);
}

/// Soak: far more requests than slots; the ceiling holds and nothing
/// starves.
#[test]
fn soak_never_exceeds_ceiling() {
    let throttler = TextureThrottler::new(TextureConfig {
        ceiling: 3,
        memory_budget_bytes: 64 * 1024 * 1024,
    });
    let mut source = MemorySource::new();
    for i in 0..40 {
        source.insert(format!("tex{i}.png"), png_bytes(4, 4));
    }
    let source = Arc::new(source);

    let mut tickets: Vec<_> = (0..40)
        .map(|i| {
            throttler.request(
                format!("tex{i}.png"),
                TextureOptions::default(),
                source.clone(),
            )
        })
        .collect();

    for ticket in &mut tickets {
        assert!(ticket
            .wait_timeout(Duration::from_secs(10))
            .unwrap()
            .is_some());
    }
    assert!(throttler.high_water() <= 3, "ceiling exceeded under soak");
    assert_eq!(throttler.resolved_count(), 40);
}

/// Oversized images are downsampled to the power-of-two size that fits
/// the derived per-texture budget.
#[test]
fn oversized_texture_is_downsampled_to_budget() {
    // 1024-pixel budget per texture: 4096 bytes / (1 texture * 4).
    let throttler = TextureThrottler::new(TextureConfig {
        ceiling: 2,
        memory_budget_bytes: 4096,
    });
    throttler.add_estimated(1);
    let mut source = MemorySource::new();
    source.insert("big.png", png_bytes(64, 64));
    let source = Arc::new(source);

    let mut ticket = throttler.request("big.png", TextureOptions::default(), source);
    let texture = ticket
        .wait_timeout(Duration::from_secs(10))
        .unwrap()
        .unwrap();
    assert!(texture.width.is_power_of_two());
    assert!(texture.height.is_power_of_two());
    assert!(u64::from(texture.width) * u64::from(texture.height) <= 1024);
    assert_eq!(
        texture.data.len(),
        (texture.width * texture.height * 4) as usize
    );
}

/// Full pipeline: a model with textured materials fires one
/// textures-complete signal after geometry is done, with failures
/// resolving null rather than blocking.
#[test]
fn session_signals_texture_completion_once() {
    let mut base = manifest(
        vec![PackTransfer { id: 0, uri: "pack0.bin".into() }],
        vec![fragment(1, 10)],
    );
    base.materials = vec![
        MaterialTransfer {
            id: 0,
            name: "brick".into(),
            base_color: [1.0; 4],
            transparent: false,
            texture_uri: Some("brick.png".into()),
        },
        MaterialTransfer {
            id: 1,
            name: "steel".into(),
            base_color: [1.0; 4],
            transparent: false,
            texture_uri: Some("steel.png".into()),
        },
        MaterialTransfer {
            id: 2,
            name: "broken".into(),
            base_color: [1.0; 4],
            transparent: false,
            texture_uri: Some("missing.png".into()),
        },
    ];
    let mut source = MemorySource::new();
    source.insert("scene.json", manifest_bytes(&base));
    source.insert("pack0.bin", pack_bytes(vec![triangle_mesh(10, 0.0)]));
    source.insert("brick.png", png_bytes(8, 8));
    source.insert("steel.png", png_bytes(8, 8));

    let throttler = TextureThrottler::new(TextureConfig {
        ceiling: 2,
        memory_budget_bytes: 64 * 1024 * 1024,
    });
    let (collab, _) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        PipelineConfig {
            pool_capacity: 2,
            ..PipelineConfig::default()
        },
        Arc::new(source),
        throttler.clone(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::TextureLoadComplete { .. })
    });

    let completions: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LoadEvent::TextureLoadComplete { resolved, failed } => Some((*resolved, *failed)),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![(2, 1)]);
    assert!(throttler.high_water() <= 2);

    // Pumping further never re-fires the signal.
    session.pump().unwrap();
    assert!(session
        .poll_events()
        .iter()
        .all(|e| !matches!(e, LoadEvent::TextureLoadComplete { .. })));
}
