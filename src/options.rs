//! Tunables and runtime configuration.
//!
//! The teacher's `lib.rs` declares `mod options;` but ships no
//! `src/options.rs` — this module is authored from scratch, grounded in
//! the `option_*` usage patterns visible in the teacher's `os.rs`/
//! `segment.rs` (a lazily-initialized table of named tunables) and in
//! spec.md §6's tunables table.
use std::sync::OnceLock;

/// Compile-time-ish tunables, overridable for tests. Defaults come
/// straight from spec.md §6 / original_source/src/common.h.
#[derive(Debug, Clone)]
pub struct Options {
    pub arena_size: usize,
    pub max_meshes: usize,
    pub default_max_mesh_count: usize,
    pub max_meshes_per_iteration: usize,
    pub max_split_list_size: usize,
    pub max_merge_sets: usize,
    pub occupancy_cutoff: f64,
    pub mesh_period_ms: u64,
    pub miniheap_refill_goal_size: usize,
    pub max_shuffle_vector_length: usize,
    pub max_miniheaps_per_shuffle_vector: usize,
    pub min_object_size: usize,
    pub max_size: usize,
    pub num_bins: usize,
    pub max_dirty_page_threshold: usize,
    pub min_dirty_page_threshold: usize,
    /// Upper bound on live `MiniHeap` metadata records (the `CheapHeap`
    /// pool's capacity) — one worst case per arena page.
    pub max_miniheap_count: usize,
    /// `CI_DEBUG_MESH` — the one environment variable spec.md names.
    pub verbose_diagnostics: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            #[cfg(target_os = "linux")]
            arena_size: 64 * (1 << 30),
            #[cfg(not(target_os = "linux"))]
            arena_size: 32 * (1 << 30),
            max_meshes: 256,
            default_max_mesh_count: 30_000,
            max_meshes_per_iteration: 2_500,
            max_split_list_size: 16_384,
            max_merge_sets: 4_096,
            occupancy_cutoff: 0.8,
            mesh_period_ms: 100,
            miniheap_refill_goal_size: 4_096,
            max_shuffle_vector_length: 256,
            max_miniheaps_per_shuffle_vector: 24,
            min_object_size: 16,
            max_size: 16_384,
            num_bins: 25,
            max_dirty_page_threshold: 16_384,
            min_dirty_page_threshold: 32,
            max_miniheap_count: 1_048_576,
            verbose_diagnostics: false,
        }
    }
}

impl Options {
    pub fn from_env() -> Options {
        let mut opts = Options::default();
        opts.verbose_diagnostics = std::env::var_os("CI_DEBUG_MESH")
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        opts
    }
}

static OPTIONS: OnceLock<Options> = OnceLock::new();

/// Process-wide tunables, initialized once from the environment on first
/// access. Mirrors the reference's lazy-singleton global state (spec.md §9).
pub fn get() -> &'static Options {
    OPTIONS.get_or_init(Options::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = Options::default();
        assert_eq!(opts.num_bins, 25);
        assert_eq!(opts.max_size, 16_384);
        assert_eq!(opts.min_object_size, 16);
        assert_eq!(opts.max_meshes, 256);
    }
}
