use proptest::prelude::*;

use crate::config::VramConfig;
use crate::context::{BufferPos, DepthDescriptor, DrawRequest, LocalCopy, ScanoutSource, TextureSource, VideoMemoryContext};
use crate::format::psm;
use crate::gpu::{GpuBackend, SoftwareBackend, TexRect};
use crate::memory::ByteRange;
use crate::target::{DrawBinding, FrameDescriptor, SurfaceId, TargetStatus, TextureDescriptor};

fn context(config: VramConfig) -> VideoMemoryContext {
    // RUST_LOG=librustgs=debug shows the engine's decisions
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    VideoMemoryContext::new(config, Box::new(SoftwareBackend::new())).unwrap()
}

fn frame(base: u32, stride: u32, height: u32) -> FrameDescriptor {
    FrameDescriptor { psm: psm::CT32, base, stride, height, write_mask: 0 }
}

fn draw(ctx: &mut VideoMemoryContext, frame: FrameDescriptor, texture: Option<TextureDescriptor>) -> SurfaceId {
    let request = DrawRequest { context: 0, frame, depth: None, texture };
    ctx.begin_draw(&request).color.unwrap()
}

fn status(ctx: &VideoMemoryContext, id: SurfaceId) -> TargetStatus {
    ctx.targets().get(id).unwrap().status
}

fn word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[test]
fn host_write_merges_with_drawn_content() {
    let mut ctx = context(VramConfig::reference());
    let id = draw(&mut ctx, frame(0, 64, 64), None);
    assert!(ctx.fill(0, 0xAAAA_AAAA));

    let written = [1, 2, 3, 4, 5, 6, 7, 8];
    ctx.write_local(0x100, &written).unwrap();
    assert!(!ctx.dirty().is_empty());

    let bytes = ctx.read_back(ByteRange::new(0, 0x4000));
    assert!(ctx.dirty().is_empty());
    assert_eq!(&bytes[0x100..0x108], &written);
    assert!(bytes[..0x100].iter().all(|&b| b == 0xAA));
    assert!(bytes[0x108..].iter().all(|&b| b == 0xAA));
    assert!(status(&ctx, id).contains(TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE));
}

#[test]
fn raw_writes_survive_reconciliation() {
    let mut ctx = context(VramConfig::reference());
    let id = draw(&mut ctx, frame(0, 64, 64), None);
    ctx.fill(0, 0xAAAA_AAAA);

    ctx.store_mut().write(0x2000, &[9; 8]).unwrap();
    ctx.mark_dirty(ByteRange::new(0x2000, 0x2008));
    ctx.reconcile(None);

    assert!(status(&ctx, id).contains(TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE));
    assert_eq!(ctx.stats().reconcile.preserved, 1);

    let bytes = ctx.read_back(ByteRange::new(0, 0x4000));
    assert_eq!(&bytes[0x2000..0x2008], &[9; 8]);
    assert_eq!(word(&bytes, 0x1FFC), 0xAAAA_AAAA);
    assert_eq!(word(&bytes, 0x2008), 0xAAAA_AAAA);
}

#[test]
fn unwritten_memory_samples_as_zero() {
    let mut ctx = context(VramConfig::default());
    let desc = TextureDescriptor { psm: psm::CT32, base: 0x300000, stride: 64, y: 0, height: 32, clut: None };
    let id = ctx.get_or_build(&desc, false).unwrap();

    let texture = ctx.memory_targets().get(id).unwrap().texture;
    let texels = ctx.gpu_mut().download(texture, TexRect::new(0, 0, 64, 32));
    assert!(texels.iter().all(|&t| t == 0));
}

#[test]
fn stride_is_part_of_target_identity() {
    let mut ctx = context(VramConfig::default());
    let narrow = draw(&mut ctx, frame(0, 64, 32), None);
    let wide = draw(&mut ctx, frame(0, 128, 32), None);

    assert_ne!(narrow, wide);
    assert_eq!(ctx.targets().get(wide).unwrap().key.stride, 128);
}

#[test]
fn large_write_drops_idle_target_without_copy() {
    let mut ctx = context(VramConfig::default());
    let big = draw(&mut ctx, frame(0, 640, 256), None);
    ctx.fill(0, 0x5555_5555);
    draw(&mut ctx, frame(0x200000, 64, 32), None);

    ctx.mark_dirty(ByteRange::new(0, 0x60000));
    ctx.reconcile(None);

    let stats = ctx.stats();
    assert_eq!(stats.reconcile.quick, 1);
    assert_eq!(stats.targets.full_resolves + stats.targets.partial_resolves, 0);
    assert!(status(&ctx, big).contains(TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE));

    let bytes = ctx.read_back(ByteRange::new(0x64000, 0x64004));
    assert_eq!(word(&bytes, 0), 0);
    assert_eq!(ctx.stats().gpu.downloads, 0);
}

#[test]
fn bound_target_keeps_rows_outside_the_write() {
    let mut ctx = context(VramConfig::default());
    let big = draw(&mut ctx, frame(0, 640, 256), None);
    ctx.fill(0, 0x5555_5555);

    ctx.mark_dirty(ByteRange::new(0, 0x60000));
    ctx.reconcile(None);

    assert_eq!(ctx.stats().reconcile.quick, 0);
    assert_eq!(ctx.stats().targets.partial_resolves, 1);
    assert!(status(&ctx, big).contains(TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE));

    // Page row 4 straddles the end of the write and is left to local memory
    let vram = ctx.store().vram();
    assert_eq!(word(vram, 0x60000), 0);
    assert_eq!(word(vram, 0x64000), 0x5555_5555);
    assert_eq!(word(vram, 0x9FFFC), 0x5555_5555);
}

#[test]
fn sampled_target_is_never_dropped() {
    let mut ctx = context(VramConfig::default());
    draw(&mut ctx, frame(0, 640, 256), None);
    ctx.fill(0, 0x5555_5555);

    ctx.mark_dirty(ByteRange::new(0, 0x60000));
    let texture = TextureDescriptor { psm: psm::CT32, base: 0, stride: 640, y: 0, height: 256, clut: None };
    draw(&mut ctx, frame(0x200000, 64, 32), Some(texture));

    assert_eq!(ctx.stats().reconcile.quick, 0);
    assert_eq!(ctx.stats().reconcile.preserved, 1);
    assert_eq!(word(ctx.store().vram(), 0x64000), 0x5555_5555);
}

#[test]
fn write_below_last_partial_row_is_ignored() {
    let mut ctx = context(VramConfig::default());
    let id = draw(&mut ctx, frame(0, 64, 48), None);
    ctx.fill(0, 1);

    ctx.mark_dirty(ByteRange::new(0x3000, 0x3010));
    ctx.reconcile(None);

    assert_eq!(ctx.stats().reconcile.false_positives, 1);
    assert!(!status(&ctx, id).intersects(TargetStatus::NEEDS_UPDATE | TargetStatus::RESOLVED));

    ctx.mark_dirty(ByteRange::new(0x2000, 0x2010));
    ctx.reconcile(None);
    assert!(status(&ctx, id).contains(TargetStatus::NEEDS_UPDATE));
}

#[test]
fn local_copy_refreshes_spanning_target() {
    let mut ctx = context(VramConfig::reference());
    let dst = draw(&mut ctx, frame(0x200000, 64, 32), None);
    ctx.fill(0, 5);

    let data: Vec<u8> = (0..0x2000).map(|i| i as u8).collect();
    ctx.write_local(0x100000, &data).unwrap();

    let copy = LocalCopy {
        psm: psm::CT32,
        src: BufferPos { base: 0x100000, stride: 64, x: 0, y: 0 },
        dst: BufferPos { base: 0x200000, stride: 64, x: 0, y: 0 },
        width: 64,
        height: 32,
    };
    ctx.copy_local(&copy).unwrap();

    let s = ctx.targets().get(dst).unwrap();
    assert!(!s.status.contains(TargetStatus::NEEDS_UPDATE));
    let texture = s.texture.unwrap();
    assert_eq!(ctx.gpu_mut().download(texture, TexRect::new(0, 0, 1, 1)), vec![0x0302_0100]);

    assert_eq!(ctx.read_back(ByteRange::new(0x200000, 0x202000)), data);
}

#[test]
fn scanout_falls_back_to_local_memory() {
    let mut ctx = context(VramConfig::default());
    let display = frame(0, 64, 32);
    assert_eq!(ctx.scanout(&display), ScanoutSource::BackingStore(ByteRange::new(0, 0x2000)));

    let id = draw(&mut ctx, display, None);
    match ctx.scanout(&display) {
        ScanoutSource::Surface { surface, row_offset, .. } => {
            assert_eq!(surface, id);
            assert_eq!(row_offset, 0);
        }
        other => panic!("expected a surface, got {:?}", other),
    }
}

#[test]
fn texture_sources() {
    let mut ctx = context(VramConfig::default());
    let a = draw(&mut ctx, frame(0, 64, 32), None);
    ctx.fill(0, 3);

    let tex_a = TextureDescriptor { psm: psm::CT32, base: 0, stride: 64, y: 0, height: 32, clut: None };
    let request = DrawRequest { context: 0, frame: frame(0x100000, 64, 32), depth: None, texture: Some(tex_a) };
    let targets = ctx.begin_draw(&request);
    assert!(matches!(targets.texture, Some(TextureSource::Target { surface, .. }) if surface == a));

    let request = DrawRequest { context: 0, frame: frame(0, 64, 32), depth: None, texture: Some(tex_a) };
    let targets = ctx.begin_draw(&request);
    assert!(matches!(targets.texture, Some(TextureSource::Feedback { surface, .. }) if surface == a));

    let indexed = TextureDescriptor { psm: psm::T8, base: 0x300000, stride: 128, y: 0, height: 64, clut: None };
    let request = DrawRequest { context: 0, frame: frame(0, 64, 32), depth: None, texture: Some(indexed) };
    assert!(matches!(ctx.begin_draw(&request).texture, Some(TextureSource::Mirror(_))));
}

#[test]
fn depth_stays_clean_without_depth_writes() {
    let mut ctx = context(VramConfig::default());
    let request = DrawRequest {
        context: 1,
        frame: frame(0, 64, 32),
        depth: Some(DepthDescriptor { psm: psm::Z32, base: 0x100000 }),
        texture: None,
    };
    let targets = ctx.begin_draw(&request);
    let (color, depth) = (targets.color.unwrap(), targets.depth.unwrap());

    ctx.set_depth_usage(false, true);
    ctx.mark_drawn(1);

    assert!(!status(&ctx, color).contains(TargetStatus::RESOLVED));
    assert!(status(&ctx, depth).contains(TargetStatus::RESOLVED));
}

#[test]
fn write_past_local_memory_fails() {
    let mut ctx = context(VramConfig::default());
    assert!(ctx.write_local(0x3FFFFC, &[0; 8]).is_err());
    assert!(ctx.dirty().is_empty());
}

#[test]
fn save_state_includes_drawn_content() {
    let mut ctx = context(VramConfig::default());
    draw(&mut ctx, frame(0, 64, 32), None);
    ctx.fill(0, 0x33);

    let snapshot = ctx.save_state();
    assert_eq!(word(&snapshot.vram, 0), 0x33);

    ctx.write_local(0, &[9; 4]).unwrap();
    ctx.restore_state(&snapshot).unwrap();

    assert_eq!(word(ctx.store().vram(), 0), 0x33);
    assert_eq!(ctx.targets().live_count(), 0);
    assert!(ctx.memory_targets().is_empty());
    assert!(ctx.dirty().is_empty());
}

#[test]
fn depth_creation_keeps_the_draws_colour_target() {
    let mut ctx = context(VramConfig { render_target_cap: 2, ..VramConfig::reference() });
    let first = DrawRequest {
        context: 1,
        frame: frame(0, 64, 64),
        depth: Some(DepthDescriptor { psm: psm::Z32, base: 0x100000 }),
        texture: None,
    };
    ctx.begin_draw(&first);

    let second = DrawRequest {
        context: 0,
        frame: frame(0x200000, 64, 64),
        depth: Some(DepthDescriptor { psm: psm::Z32, base: 0x300000 }),
        texture: None,
    };
    let targets = ctx.begin_draw(&second);

    let (color, depth) = (targets.color.unwrap(), targets.depth.unwrap());
    assert!(ctx.targets().get(color).is_some());
    assert!(ctx.targets().get(depth).is_some());
    assert_eq!(ctx.targets().binding(0), DrawBinding { color: Some(color), depth: Some(depth) });

    // The other context's surfaces are bound as well
    let other = ctx.targets().binding(1);
    assert!(other.color.is_some_and(|id| ctx.targets().get(id).is_some()));
    assert!(other.depth.is_some_and(|id| ctx.targets().get(id).is_some()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reconciled_memory_matches_writes_over_drawn_target(
        writes in prop::collection::vec((0u32..4096, 1u32..4, any::<u8>()), 1..16)
    ) {
        let mut ctx = context(VramConfig::reference());
        draw(&mut ctx, frame(0, 64, 64), None);
        ctx.fill(0, 0xA5A5_A5A5);

        let mut expected = vec![0xA5u8; 0x4000];
        for (pixel, count, value) in writes {
            let start = pixel * 4;
            let end = ((pixel + count) * 4).min(0x4000);
            let bytes = vec![value; (end - start) as usize];

            ctx.store_mut().write(start, &bytes).unwrap();
            ctx.mark_dirty(ByteRange::new(start, end));
            expected[start as usize..end as usize].copy_from_slice(&bytes);
        }

        prop_assert_eq!(ctx.read_back(ByteRange::new(0, 0x4000)), expected);
    }
}
