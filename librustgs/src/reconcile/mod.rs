/*
    Reconciliation of pending local memory writes against the caches
*/

#[cfg(test)]
mod test;

use tracing::{debug, trace};

use crate::config::VramConfig;
use crate::format::PAGE_SIZE;
use crate::memory::{ByteRange, DirtyRangeSet};
use crate::target::{RenderTargetCache, RenderTargetSurface, SurfaceId, SurfaceKind, TargetEnv, TargetStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub passes: u64,
    pub intervals: u64,
    /// Targets handed over to local memory
    pub invalidated: u64,
    /// Unresolved targets dropped without a copy by the quick rule
    pub quick: u64,
    /// Unresolved targets whose content outside the writes was copied back
    pub preserved: u64,
    /// Writes that only touched the unused tail of a target's last page row
    pub false_positives: u64,
    pub mirrors_cleared: u64,
}

#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    stats: ReconcileStats,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine::default()
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Drain `dirty`: every render target under a written range ends up
    /// resolved and awaiting an update, every mirror under it gets a
    /// pending invalidation window. `texture` is the range the coming draw
    /// samples from.
    pub fn run(
        &mut self,
        dirty: &mut DirtyRangeSet,
        targets: &mut RenderTargetCache,
        env: &mut TargetEnv<'_>,
        config: &VramConfig,
        texture: Option<ByteRange>,
    ) {
        if dirty.is_empty() {
            return;
        }

        let intervals = dirty.take();
        self.stats.passes += 1;
        self.stats.intervals += intervals.len() as u64;
        trace!("Reconciling {} dirty ranges", intervals.len());

        let mut touched: Vec<SurfaceId> = Vec::new();
        for interval in &intervals {
            for id in targets.intersecting(*interval) {
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
        }

        for id in touched {
            self.reconcile_target(targets, env, config, texture, id, &intervals);
        }

        for interval in &intervals {
            self.stats.mirrors_cleared += env.memory_targets.clear_range(*interval) as u64;
        }
    }

    fn reconcile_target(
        &mut self,
        targets: &mut RenderTargetCache,
        env: &mut TargetEnv<'_>,
        config: &VramConfig,
        texture: Option<ByteRange>,
        id: SurfaceId,
        intervals: &[ByteRange],
    ) {
        let Some(surface) = targets.get(id) else {
            return;
        };
        let handed_over = TargetStatus::RESOLVED | TargetStatus::NEEDS_UPDATE;

        if surface.mimic.is_some() || surface.status.contains(TargetStatus::NEEDS_UPDATE) {
            targets.mark_status(id, handed_over);
            return;
        }

        let mut touching: Vec<ByteRange> = intervals
            .iter()
            .filter(|r| r.intersects(surface.range))
            .copied()
            .collect();

        if !config.exact_reconcile {
            touching.retain(|r| !beyond_last_row(env, surface, *r));
            if touching.is_empty() {
                self.stats.false_positives += 1;
                return;
            }

            if config.quick_resolve && self.quick_rule(targets, config, texture, id, surface, &touching) {
                trace!("Quick invalidation of target 0x{:06X}", surface.key.base);
                targets.mark_status(id, handed_over);
                self.stats.quick += 1;
                return;
            }
        }

        if !surface.status.contains(TargetStatus::RESOLVED) {
            let base = surface.key.base;
            if config.exact_reconcile {
                targets.resolve_excluding(env, id, &touching);
            } else if let (Some(first), Some(last)) = (touching.first(), touching.last()) {
                targets.resolve_around(env, id, ByteRange::new(first.start, last.end));
            }
            debug!("Kept drawn content of 0x{:06X} around {} writes", base, touching.len());
            self.stats.preserved += 1;
        }

        targets.mark_status(id, handed_over);
        self.stats.invalidated += 1;
    }

    /// Targets out of the coming draw's way may drop their content without
    /// a copy when the write is big, starts right at them, or they hold depth.
    fn quick_rule(
        &self,
        targets: &RenderTargetCache,
        config: &VramConfig,
        texture: Option<ByteRange>,
        id: SurfaceId,
        surface: &RenderTargetSurface,
        touching: &[ByteRange],
    ) -> bool {
        if texture.is_some_and(|t| t.intersects(surface.range)) || targets.is_bound(id) {
            return false;
        }

        surface.key.kind == SurfaceKind::Depth
            || touching.iter().any(|r| r.len() > config.quick_resolve_bytes)
            || (config.quick_resolve_exact_start && touching.iter().any(|r| r.start == surface.range.start))
    }
}

/// Page footprints cover whole page rows, so a target whose height is not a
/// multiple of the page height owns only the top part of each page in its
/// last page row. Writes landing entirely below that part miss the target.
fn beyond_last_row(env: &TargetEnv<'_>, surface: &RenderTargetSurface, interval: ByteRange) -> bool {
    let Some(format) = env.translator.formats().get(surface.psm) else {
        return false;
    };

    let ph = format.page_height;
    if surface.height % ph == 0 || format.swizzle.is_some() {
        return false;
    }

    let base = surface.key.base as u64;
    let last_row = base + (surface.height / ph) as u64 * format.page_row_bytes(surface.key.stride);
    let (start, end) = (interval.start as u64, interval.end as u64);
    if start < last_row {
        return false;
    }

    let page = PAGE_SIZE as u64;
    let used = (surface.height % ph) as u64 * format.page_width as u64 * format.bits_per_pixel as u64 / 8;
    let (first_page, last_page) = ((start - base) / page, (end - 1 - base) / page);

    first_page == last_page && (start - base) % page >= used
}
