/*
    Cache sizing and reconciliation heuristics
*/

use serde::{Deserialize, Serialize};

use crate::error::{Result, VramError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VramConfig {
    /// Live render targets kept before the least recently used one is evicted
    pub render_target_cap: usize,
    /// Released render target storage kept for reuse, keyed by geometry
    pub recycled_pool_capacity: usize,
    /// Freed memory target textures kept for reuse
    pub memory_pool_capacity: usize,
    /// Live memory targets above which allocation pressure may reclaim one
    pub memory_release_threshold: usize,
    /// Comparisons a memory target may cost before it is assumed dirty
    pub validate_threshold: u32,
    /// Render target copies allowed per frame, `None` for unlimited
    pub resolve_budget: Option<u32>,
    /// Partial resolves shorter than this many rows are dropped
    pub min_partial_rows: u32,
    /// Byte-exact reconciliation with every heuristic off
    pub exact_reconcile: bool,
    pub quick_resolve: bool,
    pub quick_resolve_bytes: u32,
    pub quick_resolve_exact_start: bool,
    /// Short render targets inside another one share its storage
    pub partial_pointers: bool,
    /// Never copy render targets back, except for read-backs
    pub no_target_resolve: bool,
    pub max_texture_height: u32,
    /// Requests taller than this reuse any shorter target of the same key
    pub height_tolerance: u32,
    pub mimic_max_height: u32,
    pub memory_pool_max_age: u64,
    pub memory_unused_max_age: u64,
    pub memory_purge_interval: u64,
}

impl Default for VramConfig {
    fn default() -> Self {
        VramConfig {
            render_target_cap: 8,
            recycled_pool_capacity: 8,
            memory_pool_capacity: 16,
            memory_release_threshold: 32,
            validate_threshold: 8,
            resolve_budget: None,
            min_partial_rows: 32,
            exact_reconcile: false,
            quick_resolve: true,
            quick_resolve_bytes: 0x50000,
            quick_resolve_exact_start: false,
            partial_pointers: false,
            no_target_resolve: false,
            max_texture_height: 4096,
            height_tolerance: 0x1c0,
            mimic_max_height: 0x40,
            memory_pool_max_age: 2,
            memory_unused_max_age: 3,
            memory_purge_interval: 3,
        }
    }
}

impl VramConfig {
    /// Every heuristic off: full, byte-exact resolves everywhere.
    pub fn reference() -> Self {
        VramConfig::default().into_reference()
    }

    /// Keep the sizing, turn every heuristic off.
    pub fn into_reference(self) -> Self {
        VramConfig {
            resolve_budget: None,
            min_partial_rows: 0,
            exact_reconcile: true,
            quick_resolve: false,
            quick_resolve_exact_start: false,
            partial_pointers: false,
            no_target_resolve: false,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.render_target_cap == 0 {
            return Err(VramError::Config("render_target_cap must be at least 1".into()));
        }

        if self.max_texture_height == 0 {
            return Err(VramError::Config("max_texture_height must be at least 1".into()));
        }

        if self.memory_purge_interval == 0 {
            return Err(VramError::Config("memory_purge_interval must be at least 1".into()));
        }

        Ok(())
    }

    /// True when any throughput shortcut may skip or shorten a resolve.
    pub fn heuristics_enabled(&self) -> bool {
        !self.exact_reconcile
            && (self.quick_resolve
                || self.min_partial_rows > 0
                || self.resolve_budget.is_some()
                || self.no_target_resolve)
    }
}
