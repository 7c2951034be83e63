use std::sync::Arc;

use super::memory::palette_bytes;
use super::render::Mimic;
use super::*;
use crate::config::VramConfig;
use crate::format::{psm, FormatTable};
use crate::gpu::{GpuBackend, SoftwareBackend, TexRect};
use crate::memory::{AddressTranslator, BackingStore, ByteRange};

struct Harness {
    gpu: SoftwareBackend,
    store: BackingStore,
    translator: AddressTranslator,
    mirrors: MemoryTargetCache,
    targets: RenderTargetCache,
}

impl Harness {
    fn new(config: VramConfig) -> Self {
        Harness::with_budget(config, None)
    }

    fn with_budget(config: VramConfig, budget: Option<usize>) -> Self {
        Harness {
            gpu: SoftwareBackend::with_budget(budget),
            store: BackingStore::new(),
            translator: AddressTranslator::new(Arc::new(FormatTable::standard())),
            mirrors: MemoryTargetCache::new(&config),
            targets: RenderTargetCache::new(&config),
        }
    }

    fn split(&mut self) -> (&mut RenderTargetCache, TargetEnv<'_>) {
        let Harness { gpu, store, translator, mirrors, targets } = self;
        (targets, TargetEnv { gpu, store, translator, memory_targets: mirrors })
    }

    fn create(&mut self, desc: FrameDescriptor, kind: SurfaceKind, options: TargetOptions) -> Option<SurfaceId> {
        let (targets, mut env) = self.split();
        targets.get_or_create(&mut env, &desc, kind, options, 4096)
    }

    fn color(&mut self, desc: FrameDescriptor) -> SurfaceId {
        self.create(desc, SurfaceKind::Color, TargetOptions::empty()).unwrap()
    }

    fn update(&mut self, id: SurfaceId) -> bool {
        let (targets, mut env) = self.split();
        targets.update(&mut env, id)
    }

    fn resolve(&mut self, id: SurfaceId) -> bool {
        let (targets, mut env) = self.split();
        targets.resolve(&mut env, id)
    }

    fn force_resolve(&mut self, id: SurfaceId) -> bool {
        let (targets, mut env) = self.split();
        targets.force_resolve(&mut env, id)
    }

    fn resolve_range(&mut self, id: SurfaceId, start: u32, end: u32) -> bool {
        let (targets, mut env) = self.split();
        targets.resolve_range(&mut env, id, start, end)
    }

    fn resolve_around(&mut self, id: SurfaceId, hole: ByteRange) -> bool {
        let (targets, mut env) = self.split();
        targets.resolve_around(&mut env, id, hole)
    }

    fn retire(&mut self, id: SurfaceId) {
        let (targets, mut env) = self.split();
        targets.retire(&mut env, id, true);
    }

    /// Stand-in for a draw covering the whole surface.
    fn draw(&mut self, id: SurfaceId, value: u32) {
        let s = self.targets.get(id).unwrap();
        let (texture, rect) = (s.texture.unwrap(), TexRect::new(0, s.row_offset(), s.key.stride, s.height));
        self.gpu.fill(texture, rect, value);
        self.targets.mark_drawn(id);
    }

    fn texels(&self, id: SurfaceId) -> Vec<u32> {
        let texture = self.targets.get(id).unwrap().texture.unwrap();
        self.gpu.texels(texture).unwrap().to_vec()
    }

    fn word(&self, addr: u32) -> u32 {
        let b = self.store.read(addr, 4).unwrap();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn mirror(&mut self, desc: TextureDescriptor, force_validate: bool) -> Option<MirrorId> {
        self.mirrors.get_or_build(&mut self.gpu, &self.store, &self.translator, &desc, force_validate)
    }

    fn mirror_texels(&self, id: MirrorId) -> Vec<u32> {
        let texture = self.mirrors.get(id).unwrap().texture;
        self.gpu.texels(texture).unwrap().to_vec()
    }
}

fn frame(psm: u8, base: u32, stride: u32, height: u32) -> FrameDescriptor {
    FrameDescriptor { psm, base, stride, height, write_mask: 0 }
}

fn texture(psm: u8, base: u32, stride: u32, y: u32, height: u32) -> TextureDescriptor {
    TextureDescriptor { psm, base, stride, y, height, clut: None }
}

#[test]
fn same_key_is_a_hit() {
    let mut h = Harness::new(VramConfig::default());
    let a = h.color(frame(psm::CT32, 0, 64, 32));
    let b = h.color(frame(psm::CT32, 0, 64, 32));

    assert_eq!(a, b);
    assert_eq!(h.targets.stats().created, 1);
    assert_eq!(h.targets.stats().hits, 1);
    assert_eq!(h.targets.lookup(&frame(psm::CT32, 0, 64, 32).key(SurfaceKind::Color)), Some(a));
}

#[test]
fn different_stride_never_aliases() {
    let mut h = Harness::new(VramConfig::default());
    let narrow = h.color(frame(psm::CT32, 0, 64, 32));
    h.targets.bind(0, Some(narrow), None);
    let wide = h.color(frame(psm::CT32, 0, 128, 32));

    assert_ne!(narrow, wide);
    let (a, b) = (h.targets.get(narrow).unwrap(), h.targets.get(wide).unwrap());
    assert_eq!((a.key.stride, b.key.stride), (64, 128));
    assert_ne!(a.texture, b.texture);
}

#[test]
fn taller_request_replaces_surface() {
    let mut h = Harness::new(VramConfig::default());
    let short = h.color(frame(psm::CT32, 0, 64, 64));
    let tall = h.color(frame(psm::CT32, 0, 64, 128));

    assert_ne!(short, tall);
    assert!(h.targets.get(short).is_none());
    assert_eq!(h.targets.get(tall).unwrap().height, 128);
    assert_eq!(h.targets.live_count(), 1);
}

#[test]
fn requests_past_tolerance_reuse_shorter_surface() {
    let mut h = Harness::new(VramConfig::default());
    let a = h.color(frame(psm::CT32, 0, 64, 256));
    let b = h.color(frame(psm::CT32, 0, 64, 480));
    assert_eq!(a, b);
}

#[test]
fn strict_request_replaces_in_place() {
    let mut h = Harness::new(VramConfig::default());
    let old = h.color(frame(psm::CT32, 0, 64, 128));
    h.update(old);
    h.draw(old, 7);

    let new = h
        .create(frame(psm::CT32, 0, 64, 64), SurfaceKind::Color, TargetOptions::STRICT_HEIGHT)
        .unwrap();

    assert_ne!(old, new);
    assert!(h.targets.get(old).is_none());
    assert!(h.texels(new).iter().all(|&t| t == 7));
    assert!(!h.targets.get(new).unwrap().status.contains(TargetStatus::RESOLVED));

    // The draw never reached local memory until now
    assert_eq!(h.word(0), 0);
    assert!(h.resolve(new));
    assert_eq!(h.word(0), 7);
}

#[test]
fn virtual_surface_is_promoted_on_real_request() {
    let mut h = Harness::new(VramConfig::default());
    let desc = frame(psm::CT32, 0, 64, 32);
    let key = desc.key(SurfaceKind::Color);

    let v = h.create(desc, SurfaceKind::Color, TargetOptions::VIRTUAL).unwrap();
    let s = h.targets.get(v).unwrap();
    assert!(s.is_virtual());
    assert!(s.texture.is_none());
    assert_eq!(h.targets.lookup(&key), None);
    assert_eq!(h.targets.lookup_virtual(&key), Some(v));
    assert!(h.targets.intersecting(ByteRange::new(0, 0x2000)).is_empty());

    let real = h.color(desc);
    assert_eq!(real, v);

    let s = h.targets.get(real).unwrap();
    assert!(!s.is_virtual());
    assert!(s.texture.is_some());
    assert!(s.status.contains(TargetStatus::NEEDS_UPDATE | TargetStatus::RESOLVED));
    assert_eq!(h.targets.lookup(&key), Some(real));
    assert_eq!(h.targets.lookup_virtual(&key), None);
    assert_eq!(h.targets.iter().filter(|(_, s)| s.key == key).count(), 1);
    assert_eq!(h.targets.stats().promoted, 1);

    let (targets, mut env) = h.split();
    assert_eq!(targets.promote(&mut env, key), None);
}

#[test]
fn eviction_spares_bound_surfaces() {
    let config = VramConfig { render_target_cap: 2, ..VramConfig::default() };
    let mut h = Harness::new(config);

    let bound = h.color(frame(psm::CT32, 0, 64, 32));
    h.targets.bind(0, Some(bound), None);
    let idle = h.color(frame(psm::CT32, 0x100000, 64, 32));
    let fresh = h.color(frame(psm::CT32, 0x200000, 64, 32));

    assert!(h.targets.get(bound).is_some());
    assert!(h.targets.get(idle).is_none());
    assert!(h.targets.get(fresh).is_some());
    assert_eq!(h.targets.stats().evicted, 1);
    assert_eq!(h.targets.stats().recycled_reuses, 1);
    assert_eq!(h.targets.live_count(), 2);
}

#[test]
fn resolve_copies_once() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.color(frame(psm::CT32, 0, 64, 32));
    h.update(id);
    h.draw(id, 0x1122_3344);

    assert!(h.resolve(id));
    assert_eq!(h.word(0), 0x1122_3344);
    assert_eq!(h.word(0x1FFC), 0x1122_3344);

    let downloads = h.gpu.stats().downloads;
    assert!(!h.resolve(id));
    assert_eq!(h.gpu.stats().downloads, downloads);
    assert_eq!(h.targets.stats().full_resolves, 1);
}

#[test]
fn range_resolve_rounds_in_to_page_rows() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.color(frame(psm::CT32, 0, 64, 64));
    h.update(id);
    h.draw(id, 0x1122_3344);

    // One page row is 0x2000 bytes, the range ends halfway into the second
    assert!(h.resolve_range(id, 0, 0x3000));
    assert_eq!(h.word(0x1FFC), 0x1122_3344);
    assert_eq!(h.word(0x2000), 0);
    assert!(h.targets.get(id).unwrap().status.contains(TargetStatus::RESOLVED));
    assert_eq!(h.targets.stats().partial_resolves, 1);

    h.draw(id, 0x5566_7788);
    let downloads = h.gpu.stats().downloads;
    assert!(!h.resolve_range(id, 0x1000, 0x3000));
    assert_eq!(h.gpu.stats().downloads, downloads);
    assert_eq!(h.word(0), 0x1122_3344);
    assert!(h.targets.get(id).unwrap().status.contains(TargetStatus::RESOLVED));
    assert_eq!(h.targets.stats().skipped_resolves, 1);
}

#[test]
fn short_range_resolve_is_dropped_but_settles() {
    let config = VramConfig { min_partial_rows: 64, ..VramConfig::default() };
    let mut h = Harness::new(config);
    let id = h.color(frame(psm::CT32, 0, 64, 64));
    h.update(id);
    h.draw(id, 0x1122_3344);

    let downloads = h.gpu.stats().downloads;
    assert!(!h.resolve_range(id, 0, 0x3000));
    assert_eq!(h.gpu.stats().downloads, downloads);
    assert_eq!(h.word(0), 0);
    assert!(h.targets.get(id).unwrap().status.contains(TargetStatus::RESOLVED));

    // Settled surfaces are left alone
    assert!(!h.resolve_range(id, 0, 0x4000));
    assert_eq!(h.targets.stats().partial_resolves, 0);
}

#[test]
fn resolve_around_leaves_the_hole() {
    let mut h = Harness::new(VramConfig::default());
    h.store.write(0x2100, &0xAAAA_AAAAu32.to_le_bytes()).unwrap();
    let id = h.color(frame(psm::CT32, 0, 64, 64));
    h.update(id);
    h.draw(id, 0x1122_3344);

    assert!(h.resolve_around(id, ByteRange::new(0x2000, 0x2104)));
    assert_eq!(h.word(0), 0x1122_3344);
    assert_eq!(h.word(0x2100), 0xAAAA_AAAA);
    assert!(h.targets.get(id).unwrap().status.contains(TargetStatus::RESOLVED));
    assert_eq!(h.targets.stats().partial_resolves, 1);
}

#[test]
fn write_mask_keeps_masked_bits() {
    let mut h = Harness::new(VramConfig::default());
    h.store.write(0, &0xAA00_0000u32.to_le_bytes()).unwrap();

    let desc = FrameDescriptor { write_mask: 0xFF00_0000, ..frame(psm::CT32, 0, 64, 32) };
    let id = h.color(desc);
    h.update(id);
    assert_eq!(h.texels(id)[0], 0xAA00_0000);

    h.draw(id, 0x1122_3344);
    h.resolve(id);
    assert_eq!(h.word(0), 0xAA22_3344);
    assert_eq!(h.word(4), 0x0022_3344);
}

#[test]
fn depth_resolve_needs_depth_writes() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.create(frame(psm::Z32, 0, 64, 32), SurfaceKind::Depth, TargetOptions::empty()).unwrap();
    h.update(id);
    h.draw(id, 0x1234);

    h.targets.set_depth_usage(false, true);
    assert!(!h.resolve(id));
    assert_eq!(h.word(0), 0);
    assert!(h.targets.get(id).unwrap().status.contains(TargetStatus::RESOLVED));
    assert_eq!(h.targets.stats().skipped_resolves, 1);
}

#[test]
fn forced_resolve_ignores_depth_gating() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.create(frame(psm::Z32, 0, 64, 32), SurfaceKind::Depth, TargetOptions::empty()).unwrap();
    h.update(id);
    h.draw(id, 0x1234);

    h.targets.set_depth_usage(false, true);
    assert!(h.force_resolve(id));
    assert_eq!(h.word(0), 0x1234);
}

#[test]
fn depth_update_waits_for_depth_test() {
    let mut h = Harness::new(VramConfig::default());
    h.targets.set_depth_usage(true, false);
    let id = h.create(frame(psm::Z32, 0, 64, 32), SurfaceKind::Depth, TargetOptions::empty()).unwrap();

    assert!(!h.update(id));
    assert!(h.targets.get(id).unwrap().status.contains(TargetStatus::NEEDS_UPDATE));

    h.targets.set_depth_usage(true, true);
    assert!(h.update(id));
}

#[test]
fn resolve_budget_is_per_frame() {
    let config = VramConfig { resolve_budget: Some(1), ..VramConfig::default() };
    let mut h = Harness::new(config);

    let a = h.color(frame(psm::CT32, 0, 64, 32));
    let b = h.color(frame(psm::CT32, 0x100000, 64, 32));
    for id in [a, b] {
        h.update(id);
        h.draw(id, 5);
    }

    assert!(h.resolve(a));
    assert!(!h.resolve(b));
    assert_eq!(h.targets.stats().skipped_resolves, 1);

    h.targets.end_frame();
    h.draw(b, 6);
    assert!(h.resolve(b));
    assert_eq!(h.word(0x100000), 6);
}

#[test]
fn no_target_resolve_still_allows_forced_copies() {
    let config = VramConfig { no_target_resolve: true, ..VramConfig::default() };
    let mut h = Harness::new(config);

    let id = h.color(frame(psm::CT32, 0, 64, 32));
    h.update(id);
    h.draw(id, 9);
    assert!(!h.resolve(id));
    assert_eq!(h.word(0), 0);

    h.draw(id, 9);
    assert!(h.force_resolve(id));
    assert_eq!(h.word(0), 9);
}

#[test]
fn newer_enclosing_surface_refreshes_hit() {
    let mut h = Harness::new(VramConfig::default());
    let inner = h.color(frame(psm::CT32, 0x4000, 64, 32));
    h.targets.bind(0, Some(inner), None);
    h.update(inner);

    let outer = h.color(frame(psm::CT32, 0, 64, 128));
    h.update(outer);
    h.draw(outer, 0xCAFE);

    assert_eq!(h.color(frame(psm::CT32, 0x4000, 64, 32)), inner);
    assert!(h.targets.get(inner).unwrap().status.contains(TargetStatus::NEEDS_UPDATE));

    assert!(h.update(inner));
    assert_eq!(h.targets.stats().gpu_updates, 1);
    assert!(h.texels(inner).iter().all(|&t| t == 0xCAFE));
    assert!(!h.targets.get(inner).unwrap().status.contains(TargetStatus::RESOLVED));
}

#[test]
fn short_surface_inside_another_shares_storage() {
    let config = VramConfig { partial_pointers: true, ..VramConfig::default() };
    let mut h = Harness::new(config);

    let parent = h.color(frame(psm::CT32, 0, 64, 256));
    h.update(parent);
    let child = h.color(frame(psm::CT32, 0x4000, 64, 32));

    let c = h.targets.get(child).unwrap();
    assert_eq!(c.mimic, Some(Mimic { parent, row_offset: 64 }));
    assert_eq!(c.texture, h.targets.get(parent).unwrap().texture);
    assert_eq!(h.targets.stats().mimics, 1);
    assert_eq!(h.targets.live_count(), 1);

    h.draw(child, 0x77);
    assert!(!h.targets.get(parent).unwrap().status.contains(TargetStatus::RESOLVED));

    // A mimic never copies back on its own
    assert!(!h.resolve(child));
    assert_eq!(h.word(0x4000), 0);

    assert!(h.resolve(parent));
    assert_eq!(h.word(0x4000), 0x77);
    assert_eq!(h.word(0), 0);

    h.retire(parent);
    assert!(h.targets.get(child).is_none());
}

#[test]
fn format_change_converts_lazily() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.color(frame(psm::CT32, 0, 64, 32));
    h.update(id);
    h.draw(id, 0x1234_5678);

    assert_eq!(h.color(frame(psm::CT16, 0, 64, 32)), id);
    let s = h.targets.get(id).unwrap();
    assert!(s.status.contains(TargetStatus::NEEDS_CONVERT16));
    assert_eq!(s.texel_psm(), psm::CT32);
    assert_eq!(s.psm, psm::CT16);

    assert!(h.update(id));
    let s = h.targets.get(id).unwrap();
    assert!(!s.status.intersects(TargetStatus::CONVERT));
    assert_eq!(s.texel_psm(), psm::CT16);
    assert_eq!(h.targets.stats().conversions, 1);

    let texels = h.texels(id);
    assert_eq!(&texels[..2], &[0x5678, 0x1234]);
    // Local memory was only used as scratch
    assert_eq!(h.word(0), 0);
}

#[test]
fn same_class_format_change_needs_no_conversion() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.color(frame(psm::CT32, 0, 64, 32));
    h.update(id);

    h.color(frame(psm::CT24, 0, 64, 32));
    let s = h.targets.get(id).unwrap();
    assert!(!s.status.intersects(TargetStatus::CONVERT));
    assert_eq!(s.texel_psm(), psm::CT24);
}

#[test]
fn allocation_failure_is_soft() {
    let mut h = Harness::with_budget(VramConfig::default(), Some(64 * 32 * 4));
    let first = h.color(frame(psm::CT32, 0, 64, 32));
    h.targets.bind(0, Some(first), None);

    assert_eq!(h.create(frame(psm::CT32, 0x100000, 64, 32), SurfaceKind::Color, TargetOptions::empty()), None);
    assert_eq!(h.targets.stats().allocation_failures, 1);
    assert!(h.targets.get(first).is_some());

    h.targets.bind(0, None, None);
    let second = h.create(frame(psm::CT32, 0x100000, 64, 32), SurfaceKind::Color, TargetOptions::empty());
    assert!(second.is_some());
    assert!(h.targets.get(first).is_none());
    assert_eq!(h.targets.stats().evicted, 1);
}

#[test]
fn indexed_formats_cannot_be_targets() {
    let mut h = Harness::new(VramConfig::default());
    assert_eq!(h.create(frame(psm::T8, 0, 128, 64), SurfaceKind::Color, TargetOptions::empty()), None);
    assert_eq!(h.create(frame(0x7F, 0, 64, 32), SurfaceKind::Color, TargetOptions::empty()), None);
}

#[test]
fn unwritten_memory_mirrors_as_zero() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.mirror(texture(psm::CT32, 0x200000, 64, 0, 32), false).unwrap();

    let texels = h.mirror_texels(id);
    assert_eq!(texels.len(), 64 * 32);
    assert!(texels.iter().all(|&t| t == 0));
}

#[test]
fn indexed_mirror_expands_palette() {
    let mut h = Harness::new(VramConfig::default());
    h.store.write(0, &[5]).unwrap();
    h.store.write_clut(5 * 4, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();

    let id = h.mirror(texture(psm::T8, 0, 128, 0, 64), false).unwrap();
    let texels = h.mirror_texels(id);
    assert_eq!(texels[0], 0xDEAD_BEEF);
    assert_eq!(texels[1], 0);
}

#[test]
fn palette_offset_uses_five_bits() {
    let mut h = Harness::new(VramConfig::default());
    h.store.write(0, &[5]).unwrap();
    h.store.write_clut(5 * 4, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();

    let desc = TextureDescriptor {
        clut: Some(ClutDescriptor { cpsm: psm::CT32, csa: 0x0800_0000 }),
        ..texture(psm::T8, 0, 128, 0, 64)
    };
    let id = h.mirror(desc, false).unwrap();
    assert_eq!(h.mirror_texels(id)[0], 0xDEAD_BEEF);

    let clut: Vec<u8> = (0..1024).map(|i| i as u8).collect();
    let t4 = FormatTable::standard().get(psm::T4).unwrap().clone();
    assert_eq!(
        palette_bytes(&clut, &t4, ClutDescriptor { cpsm: psm::CT16, csa: 33 }),
        palette_bytes(&clut, &t4, ClutDescriptor { cpsm: psm::CT16, csa: 1 })
    );
}

#[test]
fn rows_past_the_address_space_are_not_mirrored() {
    let mut h = Harness::new(VramConfig::default());
    assert!(h.mirror(texture(psm::CT32, 0, 64, u32::MAX - 8, 16), false).is_none());
    assert!(h.mirror(texture(psm::CT32, 0, 64, u32::MAX - 40, 16), false).is_none());
    assert!(h.mirrors.is_empty());
}

#[test]
fn palette_mismatch_past_threshold_rebuilds() {
    let config = VramConfig { validate_threshold: 0, ..VramConfig::default() };
    let mut h = Harness::new(config);
    let desc = texture(psm::T8, 0, 128, 0, 64);

    let first = h.mirror(desc, false).unwrap();
    assert_eq!(h.mirror(desc, false), Some(first));

    h.store.write_clut(0, &[1, 0, 0, 0]).unwrap();
    let second = h.mirror(desc, false).unwrap();
    assert_ne!(second, first);

    // Back to the original palette, but the first mirror has used up its comparisons
    h.store.write_clut(0, &[0, 0, 0, 0]).unwrap();
    let third = h.mirror(desc, false).unwrap();
    assert_ne!(third, first);
    assert_ne!(third, second);
}

#[test]
fn pending_window_narrows_mirror() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.mirror(texture(psm::CT32, 0, 64, 0, 64), false).unwrap();

    assert_eq!(h.mirrors.clear_range(ByteRange::new(0x2000, 0x2004)), 1);
    assert_eq!(h.mirrors.get(id).unwrap().pending(), Some((32, 64)));

    assert_eq!(h.mirror(texture(psm::CT32, 0, 64, 0, 32), false), Some(id));
    let s = h.mirrors.get(id).unwrap();
    assert_eq!((s.start_y, s.height), (0, 32));
    assert_eq!(s.pending(), None);
    assert_eq!(h.mirrors.stats().narrowed, 1);

    let lower = h.mirror(texture(psm::CT32, 0, 64, 32, 32), false).unwrap();
    assert_ne!(lower, id);
}

#[test]
fn forced_validation_keeps_unchanged_mirror() {
    let mut h = Harness::new(VramConfig::default());
    let desc = texture(psm::CT32, 0, 64, 0, 64);
    let id = h.mirror(desc, false).unwrap();

    h.mirrors.clear_range(ByteRange::new(0x2000, 0x2004));
    assert_eq!(h.mirror(desc, true), Some(id));
    assert_eq!(h.mirrors.get(id).unwrap().height, 64);
    assert_eq!(h.mirrors.stats().validations, 1);
}

#[test]
fn forced_validation_rebuilds_changed_mirror() {
    let mut h = Harness::new(VramConfig::default());
    let desc = texture(psm::CT32, 0, 64, 0, 64);
    let id = h.mirror(desc, false).unwrap();

    h.store.write(0x2000, &[1, 2, 3, 4]).unwrap();
    h.mirrors.clear_range(ByteRange::new(0x2000, 0x2004));

    let rebuilt = h.mirror(desc, true).unwrap();
    assert_ne!(rebuilt, id);
    assert!(h.mirrors.get(id).is_none());
    assert_eq!(h.mirrors.stats().pool_reuses, 1);
    assert_eq!(h.mirror_texels(rebuilt)[32 * 64], 0x0403_0201);
}

#[test]
fn tall_mirror_is_laid_side_by_side() {
    let config = VramConfig { max_texture_height: 64, ..VramConfig::default() };
    let mut h = Harness::new(config);
    h.store.write(0x4000, &[0x55]).unwrap();

    let id = h.mirror(texture(psm::CT32, 0, 64, 0, 128), false).unwrap();
    let s = h.mirrors.get(id).unwrap();
    assert_eq!((s.width_multiplier, s.tex_width, s.tex_height), (2, 128, 64));
    assert_eq!(h.mirror_texels(id)[64], 0x55);

    let dst = h.gpu.create_texture(64, 128).unwrap();
    assert!(h.mirrors.copy_rows_to(&mut h.gpu, id, 0, 128, dst, 0));
    assert_eq!(h.gpu.texels(dst).unwrap()[64 * 64], 0x55);
}

#[test]
fn sweep_ages_out_unused_mirrors() {
    let config = VramConfig {
        memory_unused_max_age: 0,
        memory_pool_max_age: 0,
        memory_purge_interval: 1,
        ..VramConfig::default()
    };
    let mut h = Harness::new(config);
    h.mirror(texture(psm::CT32, 0, 64, 0, 32), false).unwrap();

    h.mirrors.sweep(&mut h.gpu);
    assert_eq!(h.mirrors.len(), 0);
    assert_eq!(h.mirrors.pool_len(), 1);

    h.mirrors.sweep(&mut h.gpu);
    assert_eq!(h.mirrors.pool_len(), 0);
    assert_eq!(h.gpu.stats().live_textures, 0);
}

#[test]
fn allocation_pressure_drains_pool_first() {
    let mut h = Harness::new(VramConfig::default());
    let id = h.mirror(texture(psm::CT32, 0, 64, 0, 32), false).unwrap();
    h.mirrors.destroy(&mut h.gpu, id);
    assert_eq!(h.mirrors.pool_len(), 1);

    assert!(h.mirrors.release_for_allocation(&mut h.gpu));
    assert_eq!(h.mirrors.pool_len(), 0);
    assert!(!h.mirrors.release_for_allocation(&mut h.gpu));
}

#[test]
fn half_palette_selection() {
    let clut: Vec<u8> = (0..1024).map(|i| i as u8).collect();
    let t4 = FormatTable::standard().get(psm::T4).unwrap().clone();

    let bytes = palette_bytes(&clut, &t4, ClutDescriptor { cpsm: psm::CT16, csa: 2 });
    assert_eq!(bytes.len(), 32);
    assert_eq!(bytes[0], 64);

    let bytes = palette_bytes(&clut, &t4, ClutDescriptor { cpsm: psm::CT32, csa: 1 });
    assert_eq!(bytes.len(), 64);
    assert_eq!(bytes[0], 64);
}
