/* Trace replay against a video memory context */

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use librustgs::{FrameDescriptor, ScanoutSource, VideoMemoryContext};

use crate::trace::TraceOp;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaySummary {
    pub ops: usize,
    pub frames: u64,
    pub draws: u64,
    pub read_back_bytes: u64,
    /// FNV-1a over every byte read back, in order
    pub checksum: u64,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub struct Replay {
    ctx: VideoMemoryContext,
    last_frame: Option<FrameDescriptor>,
    /// Drawing context of the last draw, the one `fill` colours
    last_context: usize,
    summary: ReplaySummary,
}

impl Replay {
    pub fn new(ctx: VideoMemoryContext) -> Self {
        Replay {
            ctx,
            last_frame: None,
            last_context: 0,
            summary: ReplaySummary { checksum: FNV_OFFSET, ..ReplaySummary::default() },
        }
    }

    pub fn context(&self) -> &VideoMemoryContext {
        &self.ctx
    }

    pub fn summary(&self) -> ReplaySummary {
        self.summary
    }

    pub fn run(&mut self, ops: &[TraceOp]) -> Result<()> {
        for (i, op) in ops.iter().enumerate() {
            self.step(op).with_context(|| format!("operation {} ({:?})", i + 1, op))?;
            self.summary.ops += 1;
        }
        Ok(())
    }

    fn step(&mut self, op: &TraceOp) -> Result<()> {
        match op {
            TraceOp::Write { addr, data } => self.ctx.write_local(*addr, data)?,
            TraceOp::Palette { offset, data } => self.ctx.write_palette(*offset, data)?,
            TraceOp::Draw(request) => {
                let targets = self.ctx.begin_draw(request);
                if targets.color.is_none() {
                    warn!("Draw to 0x{:06X} has no colour target", request.frame.base);
                }

                self.ctx.mark_drawn(request.context);
                self.last_frame = Some(request.frame);
                self.last_context = request.context;
                self.summary.draws += 1;
            }
            TraceOp::Fill { rgba } => {
                if !self.ctx.fill(self.last_context, *rgba) {
                    warn!("Fill with nothing bound");
                }
            }
            TraceOp::ReadBack(range) => {
                let bytes = self.ctx.read_back(*range);
                for &b in &bytes {
                    self.summary.checksum = (self.summary.checksum ^ b as u64).wrapping_mul(FNV_PRIME);
                }
                self.summary.read_back_bytes += bytes.len() as u64;
                debug!("Read back {} bytes at 0x{:06X}", bytes.len(), range.start);
            }
            TraceOp::Copy(copy) => self.ctx.copy_local(copy)?,
            TraceOp::Frame => {
                if let Some(frame) = self.last_frame {
                    match self.ctx.scanout(&frame) {
                        ScanoutSource::Surface { surface, .. } => debug!("Presenting surface {:?}", surface),
                        ScanoutSource::BackingStore(range) => {
                            debug!("Presenting local memory 0x{:06X}..0x{:06X}", range.start, range.end)
                        }
                    }
                }

                self.ctx.end_frame();
                self.summary.frames += 1;
            }
        }
        Ok(())
    }

    pub fn print_summary(&self) {
        let summary = self.summary;
        let stats = self.ctx.stats();

        info!("Replayed {} operations, {} draws over {} frames", summary.ops, summary.draws, summary.frames);
        println!("operations       {}", summary.ops);
        println!("frames           {}", summary.frames);
        println!("read back        {} bytes, checksum {:016x}", summary.read_back_bytes, summary.checksum);
        println!(
            "reconcile        {} passes, {} ranges, {} invalidated, {} quick, {} preserved, {} false positives",
            stats.reconcile.passes,
            stats.reconcile.intervals,
            stats.reconcile.invalidated,
            stats.reconcile.quick,
            stats.reconcile.preserved,
            stats.reconcile.false_positives
        );
        println!(
            "render targets   {} live, {} created, {} hits, {} evicted, {} mimics",
            stats.live_targets, stats.targets.created, stats.targets.hits, stats.targets.evicted, stats.targets.mimics
        );
        println!(
            "resolves         {} full, {} partial, {} skipped",
            stats.targets.full_resolves, stats.targets.partial_resolves, stats.targets.skipped_resolves
        );
        println!(
            "updates          {} from gpu, {} from memory, {} conversions",
            stats.targets.gpu_updates, stats.targets.memory_updates, stats.targets.conversions
        );
        println!(
            "texture mirrors  {} live, {} hits, {} misses, {} validations ({} inconclusive)",
            stats.live_mirrors,
            stats.memory_targets.hits,
            stats.memory_targets.misses,
            stats.memory_targets.validations,
            stats.memory_targets.inconclusive
        );
        println!(
            "gpu ({})  {} textures ({} bytes), {} uploads, {} downloads, {} copies",
            self.ctx.gpu().name(),
            stats.gpu.live_textures,
            stats.gpu.live_bytes,
            stats.gpu.uploads,
            stats.gpu.downloads,
            stats.gpu.copies
        );
    }
}
