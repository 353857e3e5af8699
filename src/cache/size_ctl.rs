//! Adaptive size controller.
//!
//! Hit rate is measured over epochs of `epoch_length` protect calls. At the
//! end of an epoch:
//! - below `lower_hr_threshold`, growth enabled and the cache full at some
//!   point during the epoch: grow `max_size` by `increment` (capped by
//!   `max_increment` and the ceiling),
//! - above `upper_hr_threshold` with shrinking enabled: shrink by
//!   `decrement` (capped by `max_decrement` and the floor).
//!
//! A flash increase skips the epoch: a single entry large relative to the
//! budget that does not fit grows the budget right away.

use tracing::{debug, info};

use crate::cache::lifecycle::Cache;
use crate::config::ResizeConfig;
use crate::error::Result;
use crate::store::BackingStore;

/// Outcome of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDecision {
    Unchanged,
    Increase { from: usize, to: usize },
    Decrease { from: usize, to: usize },
}

#[derive(Debug, Clone)]
pub struct SizeController {
    config: ResizeConfig,
    epoch_accesses: u64,
    epoch_hits: u64,
    cache_full: bool,
}

impl SizeController {
    pub fn new(config: ResizeConfig) -> Self {
        Self {
            config,
            epoch_accesses: 0,
            epoch_hits: 0,
            cache_full: false,
        }
    }

    pub fn config(&self) -> &ResizeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ResizeConfig) {
        self.config = config;
        self.reset_epoch();
    }

    /// Record one access. Returns true when the epoch is complete.
    pub fn record(&mut self, hit: bool) -> bool {
        if !self.config.epochs_enabled() {
            return false;
        }
        self.epoch_accesses += 1;
        if hit {
            self.epoch_hits += 1;
        }
        self.epoch_accesses >= self.config.epoch_length
    }

    /// Reclamation found the cache over budget.
    pub fn note_full(&mut self) {
        self.cache_full = true;
    }

    pub fn epoch_hit_rate(&self) -> f64 {
        if self.epoch_accesses == 0 {
            return 0.0;
        }
        self.epoch_hits as f64 / self.epoch_accesses as f64
    }

    /// Close the epoch and decide the new budget.
    pub fn end_epoch(&mut self, max_size: usize) -> ResizeDecision {
        let hit_rate = self.epoch_hit_rate();
        let full = self.cache_full;
        self.reset_epoch();

        let cfg = &self.config;
        if cfg.incr_enabled && hit_rate < cfg.lower_hr_threshold && full {
            let mut target = (max_size as f64 * cfg.increment) as usize;
            if cfg.apply_max_increment {
                target = target.min(max_size.saturating_add(cfg.max_increment));
            }
            let target = target.min(cfg.max_size);
            if target > max_size {
                return ResizeDecision::Increase {
                    from: max_size,
                    to: target,
                };
            }
        } else if cfg.decr_enabled && hit_rate > cfg.upper_hr_threshold {
            let mut target = (max_size as f64 * cfg.decrement) as usize;
            if cfg.apply_max_decrement {
                target = target.max(max_size.saturating_sub(cfg.max_decrement));
            }
            let target = target.max(cfg.min_size);
            if target < max_size {
                return ResizeDecision::Decrease {
                    from: max_size,
                    to: target,
                };
            }
        }
        ResizeDecision::Unchanged
    }

    /// New budget for an entry of `needed` bytes arriving in a cache holding
    /// `index_size` bytes, if it warrants a flash increase.
    pub fn flash_target(&self, max_size: usize, index_size: usize, needed: usize) -> Option<usize> {
        let cfg = &self.config;
        if !cfg.flash_incr_enabled {
            return None;
        }
        if (needed as f64) < cfg.flash_threshold * max_size as f64 {
            return None;
        }
        if index_size + needed <= max_size {
            return None;
        }
        let target = max_size + (cfg.flash_multiple * needed as f64) as usize;
        let target = target.min(cfg.max_size);
        (target > max_size).then_some(target)
    }

    /// Minimum clean size that goes with a budget.
    pub fn min_clean_for(&self, max_size: usize) -> usize {
        (max_size as f64 * self.config.min_clean_fraction) as usize
    }

    fn reset_epoch(&mut self) {
        self.epoch_accesses = 0;
        self.epoch_hits = 0;
        self.cache_full = false;
    }
}

impl<S: BackingStore> Cache<S> {
    /// Count a protect call and run the controller at epoch boundaries.
    pub(crate) fn record_access(&mut self, hit: bool) -> Result<()> {
        self.stats.accesses += 1;
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        if !self.size_ctl.record(hit) {
            return Ok(());
        }

        let hit_rate = self.size_ctl.epoch_hit_rate();
        match self.size_ctl.end_epoch(self.max_size) {
            ResizeDecision::Increase { from, to } => {
                self.apply_max_size(to);
                self.stats.size_increases += 1;
                info!(from, to, hit_rate, "Increased cache size");
            }
            ResizeDecision::Decrease { from, to } => {
                self.apply_max_size(to);
                self.stats.size_decreases += 1;
                info!(from, to, hit_rate, "Decreased cache size");
                self.make_space(0)?;
            }
            ResizeDecision::Unchanged => {
                debug!(max_size = self.max_size, hit_rate, "Epoch ended, size unchanged");
            }
        }
        Ok(())
    }

    /// Grow the budget at once if `needed` more bytes warrant it.
    pub(crate) fn flash_increase(&mut self, needed: usize) {
        if let Some(to) = self
            .size_ctl
            .flash_target(self.max_size, self.index.size(), needed)
        {
            info!(from = self.max_size, to, needed, "Flash increase of cache size");
            self.apply_max_size(to);
            self.stats.flash_increases += 1;
        }
    }

    pub(crate) fn apply_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.min_clean_size = self.size_ctl.min_clean_for(max_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResizeConfig {
        ResizeConfig {
            incr_enabled: true,
            decr_enabled: true,
            epoch_length: 4,
            min_size: 1000,
            max_size: 10_000,
            min_clean_fraction: 0.5,
            lower_hr_threshold: 0.5,
            increment: 2.0,
            apply_max_increment: true,
            max_increment: 1500,
            upper_hr_threshold: 0.9,
            decrement: 0.5,
            apply_max_decrement: true,
            max_decrement: 400,
            flash_incr_enabled: true,
            flash_multiple: 1.0,
            flash_threshold: 0.25,
        }
    }

    fn run_epoch(ctl: &mut SizeController, hits: u64) {
        for i in 0..4 {
            ctl.record(i < hits);
        }
    }

    #[test]
    fn test_increase_needs_full_cache() {
        let mut ctl = SizeController::new(config());
        run_epoch(&mut ctl, 0);
        assert_eq!(ctl.end_epoch(2000), ResizeDecision::Unchanged);

        run_epoch(&mut ctl, 0);
        ctl.note_full();
        assert_eq!(
            ctl.end_epoch(2000),
            ResizeDecision::Increase {
                from: 2000,
                to: 3500
            }
        );
    }

    #[test]
    fn test_increase_respects_ceiling() {
        let mut ctl = SizeController::new(config());
        run_epoch(&mut ctl, 1);
        ctl.note_full();
        assert_eq!(
            ctl.end_epoch(9800),
            ResizeDecision::Increase {
                from: 9800,
                to: 10_000
            }
        );
    }

    #[test]
    fn test_decrease_capped_and_floored() {
        let mut ctl = SizeController::new(config());
        run_epoch(&mut ctl, 4);
        assert_eq!(
            ctl.end_epoch(4000),
            ResizeDecision::Decrease {
                from: 4000,
                to: 3600
            }
        );
        run_epoch(&mut ctl, 4);
        assert_eq!(
            ctl.end_epoch(1200),
            ResizeDecision::Decrease {
                from: 1200,
                to: 1000
            }
        );
        run_epoch(&mut ctl, 4);
        assert_eq!(ctl.end_epoch(1000), ResizeDecision::Unchanged);
    }

    #[test]
    fn test_growth_and_shrinkage_switch_separately() {
        let mut ctl = SizeController::new(ResizeConfig {
            decr_enabled: false,
            ..config()
        });
        run_epoch(&mut ctl, 4);
        assert_eq!(ctl.end_epoch(4000), ResizeDecision::Unchanged);
        run_epoch(&mut ctl, 0);
        ctl.note_full();
        assert!(matches!(ctl.end_epoch(2000), ResizeDecision::Increase { .. }));

        let mut ctl = SizeController::new(ResizeConfig {
            incr_enabled: false,
            ..config()
        });
        run_epoch(&mut ctl, 0);
        ctl.note_full();
        assert_eq!(ctl.end_epoch(2000), ResizeDecision::Unchanged);
        run_epoch(&mut ctl, 4);
        assert!(matches!(ctl.end_epoch(4000), ResizeDecision::Decrease { .. }));
    }

    #[test]
    fn test_flash_increase_without_epochs() {
        let ctl = SizeController::new(ResizeConfig {
            incr_enabled: false,
            decr_enabled: false,
            ..config()
        });
        assert_eq!(ctl.flash_target(2000, 1900, 600), Some(2600));
    }

    #[test]
    fn test_epoch_boundary() {
        let mut ctl = SizeController::new(config());
        assert!(!ctl.record(true));
        assert!(!ctl.record(true));
        assert!(!ctl.record(false));
        assert!(ctl.record(true));
        assert!((ctl.epoch_hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disabled_controller_never_ends_epoch() {
        let mut ctl = SizeController::new(ResizeConfig::default());
        for _ in 0..100 {
            assert!(!ctl.record(false));
        }
        assert_eq!(ctl.flash_target(1000, 900, 600), None);
    }

    #[test]
    fn test_flash_target() {
        let ctl = SizeController::new(config());
        // Small entry: no flash.
        assert_eq!(ctl.flash_target(2000, 1900, 200), None);
        // Large entry that fits: no flash.
        assert_eq!(ctl.flash_target(2000, 100, 600), None);
        // Large entry that does not fit.
        assert_eq!(ctl.flash_target(2000, 1900, 600), Some(2600));
        assert_eq!(ctl.flash_target(9800, 9800, 5000), Some(10_000));
        assert_eq!(ctl.min_clean_for(2600), 1300);
    }
}
