//! Adaptive cache sizing.
//!
//! Every epoch (a fixed number of cache accesses) the hit rate is examined and
//! the maximum cache size may be grown or shrunk. This module holds the policy
//! configuration and the sizing arithmetic; the cache applies the decisions and
//! performs any evictions they imply.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest maximum cache size accepted
pub const MIN_MAX_CACHE_SIZE: u64 = 1024;
/// Largest maximum cache size accepted
pub const MAX_MAX_CACHE_SIZE: u64 = 128 * 1024 * 1024;
pub const MIN_EPOCH_LENGTH: u64 = 100;
pub const MAX_EPOCH_LENGTH: u64 = 1_000_000;
/// Upper bound on epochs an entry may go unused before age-out evicts it
pub const MAX_EPOCHS_BEFORE_EVICTION: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrMode {
    Off,
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashIncrMode {
    Off,
    AddSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecrMode {
    Off,
    Threshold,
    AgeOut,
    AgeOutWithThreshold,
}

impl DecrMode {
    pub fn is_age_out(self) -> bool {
        matches!(self, DecrMode::AgeOut | DecrMode::AgeOutWithThreshold)
    }
}

/// Outcome of one resize decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    InSpec,
    Increase,
    FlashIncrease,
    Decrease,
    AtMaxSize,
    AtMinSize,
    IncreaseDisabled,
    DecreaseDisabled,
    NotFull,
}

/// Report delivered after every resize decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeReport {
    pub hit_rate: f64,
    pub status: ResizeStatus,
    pub old_max_size: u64,
    pub new_max_size: u64,
    pub old_min_clean_size: u64,
    pub new_min_clean_size: u64,
}

/// Receives resize reports
pub trait ResizeObserver: Send + Sync {
    fn on_resize(&self, report: &ResizeReport);
}

/// Auto-resize policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoResizeConfig {
    #[serde(default = "default_set_initial_size")]
    pub set_initial_size: bool,
    #[serde(default = "default_initial_size")]
    pub initial_size: u64,
    #[serde(default = "default_min_clean_fraction")]
    pub min_clean_fraction: f64,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_min_size")]
    pub min_size: u64,
    /// Cache accesses per epoch
    #[serde(default = "default_epoch_length")]
    pub epoch_length: u64,

    #[serde(default = "default_incr_mode")]
    pub incr_mode: IncrMode,
    #[serde(default = "default_lower_hr_threshold")]
    pub lower_hr_threshold: f64,
    #[serde(default = "default_increment")]
    pub increment: f64,
    #[serde(default = "default_true")]
    pub apply_max_increment: bool,
    #[serde(default = "default_max_increment")]
    pub max_increment: u64,
    #[serde(default = "default_flash_incr_mode")]
    pub flash_incr_mode: FlashIncrMode,
    #[serde(default = "default_flash_multiple")]
    pub flash_multiple: f64,
    #[serde(default = "default_flash_threshold")]
    pub flash_threshold: f64,

    #[serde(default = "default_decr_mode")]
    pub decr_mode: DecrMode,
    #[serde(default = "default_upper_hr_threshold")]
    pub upper_hr_threshold: f64,
    #[serde(default = "default_decrement")]
    pub decrement: f64,
    #[serde(default = "default_true")]
    pub apply_max_decrement: bool,
    #[serde(default = "default_max_decrement")]
    pub max_decrement: u64,
    #[serde(default = "default_epochs_before_eviction")]
    pub epochs_before_eviction: u32,
    #[serde(default = "default_true")]
    pub apply_empty_reserve: bool,
    #[serde(default = "default_empty_reserve")]
    pub empty_reserve: f64,
}

fn default_set_initial_size() -> bool {
    true
}

fn default_initial_size() -> u64 {
    1024 * 1024
}

fn default_min_clean_fraction() -> f64 {
    0.5
}

fn default_max_size() -> u64 {
    16 * 1024 * 1024
}

fn default_min_size() -> u64 {
    1024 * 1024
}

fn default_epoch_length() -> u64 {
    50_000
}

fn default_incr_mode() -> IncrMode {
    IncrMode::Threshold
}

fn default_lower_hr_threshold() -> f64 {
    0.9
}

fn default_increment() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_max_increment() -> u64 {
    2 * 1024 * 1024
}

fn default_flash_incr_mode() -> FlashIncrMode {
    FlashIncrMode::AddSpace
}

fn default_flash_multiple() -> f64 {
    1.0
}

fn default_flash_threshold() -> f64 {
    0.25
}

fn default_decr_mode() -> DecrMode {
    DecrMode::AgeOutWithThreshold
}

fn default_upper_hr_threshold() -> f64 {
    0.9999
}

fn default_decrement() -> f64 {
    0.9
}

fn default_max_decrement() -> u64 {
    1024 * 1024
}

fn default_epochs_before_eviction() -> u32 {
    3
}

fn default_empty_reserve() -> f64 {
    0.05
}

impl Default for AutoResizeConfig {
    fn default() -> Self {
        Self {
            set_initial_size: default_set_initial_size(),
            initial_size: default_initial_size(),
            min_clean_fraction: default_min_clean_fraction(),
            max_size: default_max_size(),
            min_size: default_min_size(),
            epoch_length: default_epoch_length(),
            incr_mode: default_incr_mode(),
            lower_hr_threshold: default_lower_hr_threshold(),
            increment: default_increment(),
            apply_max_increment: true,
            max_increment: default_max_increment(),
            flash_incr_mode: default_flash_incr_mode(),
            flash_multiple: default_flash_multiple(),
            flash_threshold: default_flash_threshold(),
            decr_mode: default_decr_mode(),
            upper_hr_threshold: default_upper_hr_threshold(),
            decrement: default_decrement(),
            apply_max_decrement: true,
            max_decrement: default_max_decrement(),
            epochs_before_eviction: default_epochs_before_eviction(),
            apply_empty_reserve: true,
            empty_reserve: default_empty_reserve(),
        }
    }
}

impl AutoResizeConfig {
    /// Fixed-size policy: both increment and decrement disabled
    pub fn disabled(size: u64, min_clean_fraction: f64) -> Self {
        Self {
            initial_size: size,
            max_size: size.max(default_max_size()),
            min_size: size.min(default_min_size()).max(MIN_MAX_CACHE_SIZE),
            min_clean_fraction,
            incr_mode: IncrMode::Off,
            flash_incr_mode: FlashIncrMode::Off,
            decr_mode: DecrMode::Off,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.incr_mode != IncrMode::Off || self.decr_mode != DecrMode::Off
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_size > MAX_MAX_CACHE_SIZE {
            return Err(format!(
                "max_size {} exceeds {}",
                self.max_size, MAX_MAX_CACHE_SIZE
            ));
        }
        if self.min_size < MIN_MAX_CACHE_SIZE {
            return Err(format!(
                "min_size {} is below {}",
                self.min_size, MIN_MAX_CACHE_SIZE
            ));
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            ));
        }
        if self.set_initial_size
            && (self.initial_size < self.min_size || self.initial_size > self.max_size)
        {
            return Err(format!(
                "initial_size {} must lie in [{}, {}]",
                self.initial_size, self.min_size, self.max_size
            ));
        }
        if !(0.0..=1.0).contains(&self.min_clean_fraction) {
            return Err("min_clean_fraction must lie in [0.0, 1.0]".to_string());
        }
        if self.epoch_length < MIN_EPOCH_LENGTH || self.epoch_length > MAX_EPOCH_LENGTH {
            return Err(format!(
                "epoch_length {} must lie in [{}, {}]",
                self.epoch_length, MIN_EPOCH_LENGTH, MAX_EPOCH_LENGTH
            ));
        }

        if self.incr_mode == IncrMode::Threshold {
            if !(0.0..=1.0).contains(&self.lower_hr_threshold) {
                return Err("lower_hr_threshold must lie in [0.0, 1.0]".to_string());
            }
            if self.increment < 1.0 {
                return Err("increment must be at least 1.0".to_string());
            }
        }
        if self.flash_incr_mode == FlashIncrMode::AddSpace {
            if !(0.1..=10.0).contains(&self.flash_multiple) {
                return Err("flash_multiple must lie in [0.1, 10.0]".to_string());
            }
            if !(0.1..=1.0).contains(&self.flash_threshold) {
                return Err("flash_threshold must lie in [0.1, 1.0]".to_string());
            }
        }

        if matches!(
            self.decr_mode,
            DecrMode::Threshold | DecrMode::AgeOutWithThreshold
        ) && !(0.0..=1.0).contains(&self.upper_hr_threshold)
        {
            return Err("upper_hr_threshold must lie in [0.0, 1.0]".to_string());
        }
        if self.decr_mode == DecrMode::Threshold && !(0.0..=1.0).contains(&self.decrement) {
            return Err("decrement must lie in [0.0, 1.0]".to_string());
        }
        if self.decr_mode.is_age_out() {
            if self.epochs_before_eviction == 0
                || self.epochs_before_eviction > MAX_EPOCHS_BEFORE_EVICTION
            {
                return Err(format!(
                    "epochs_before_eviction must lie in [1, {}]",
                    MAX_EPOCHS_BEFORE_EVICTION
                ));
            }
            if self.apply_empty_reserve && !(0.0..=1.0).contains(&self.empty_reserve) {
                return Err("empty_reserve must lie in [0.0, 1.0]".to_string());
            }
        }

        if self.incr_mode == IncrMode::Threshold
            && matches!(
                self.decr_mode,
                DecrMode::Threshold | DecrMode::AgeOutWithThreshold
            )
            && self.lower_hr_threshold >= self.upper_hr_threshold
        {
            return Err("conflicting hit rate thresholds".to_string());
        }
        Ok(())
    }

    pub fn min_clean_for(&self, max_size: u64) -> u64 {
        (max_size as f64 * self.min_clean_fraction) as u64
    }

    fn size_increase_possible(&self) -> bool {
        self.incr_mode != IncrMode::Off && self.max_size > self.min_size && self.increment > 1.0
    }

    fn size_decrease_possible(&self) -> bool {
        match self.decr_mode {
            DecrMode::Off => false,
            DecrMode::Threshold => self.max_size > self.min_size && self.decrement < 1.0,
            DecrMode::AgeOut | DecrMode::AgeOutWithThreshold => self.max_size > self.min_size,
        }
    }

    pub fn flash_increase_possible(&self) -> bool {
        self.size_increase_possible() && self.flash_incr_mode != FlashIncrMode::Off
    }
}

/// Per-cache resize state: hit statistics for the current epoch and epoch counting
#[derive(Debug, Clone)]
pub struct AutoResizer {
    pub config: AutoResizeConfig,
    accesses: u64,
    hits: u64,
    /// Epochs completed since the policy was installed
    pub epoch: u64,
    pub flash_size_threshold: u64,
    pub cache_full: bool,
}

impl AutoResizer {
    pub fn new(config: AutoResizeConfig, max_cache_size: u64) -> Self {
        let flash_size_threshold = (max_cache_size as f64 * config.flash_threshold) as u64;
        Self {
            config,
            accesses: 0,
            hits: 0,
            epoch: 0,
            flash_size_threshold,
            cache_full: false,
        }
    }

    pub fn record_access(&mut self, hit: bool) {
        self.accesses += 1;
        if hit {
            self.hits += 1;
        }
    }

    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    pub fn hit_rate(&self) -> f64 {
        if self.accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.accesses as f64
        }
    }

    pub fn reset_hit_rate_stats(&mut self) {
        self.accesses = 0;
        self.hits = 0;
    }

    pub fn epoch_complete(&self) -> bool {
        self.config.is_enabled() && self.accesses >= self.config.epoch_length
    }

    /// Age-out only starts once enough epochs have elapsed to judge staleness
    pub fn age_out_ready(&self) -> bool {
        self.epoch >= self.config.epochs_before_eviction as u64
    }

    /// Increase decision for the current epoch
    pub fn plan_increase(&self, hit_rate: f64, max_cache_size: u64) -> (ResizeStatus, u64) {
        let cfg = &self.config;
        if cfg.incr_mode == IncrMode::Off || hit_rate >= cfg.lower_hr_threshold {
            return (ResizeStatus::InSpec, max_cache_size);
        }
        if !cfg.size_increase_possible() {
            return (ResizeStatus::IncreaseDisabled, max_cache_size);
        }
        if max_cache_size >= cfg.max_size {
            return (ResizeStatus::AtMaxSize, max_cache_size);
        }
        if !self.cache_full {
            return (ResizeStatus::NotFull, max_cache_size);
        }
        let mut new_size = ((max_cache_size as f64) * cfg.increment) as u64;
        new_size = new_size.min(cfg.max_size);
        if cfg.apply_max_increment && max_cache_size + cfg.max_increment < new_size {
            new_size = max_cache_size + cfg.max_increment;
        }
        (ResizeStatus::Increase, new_size)
    }

    /// Threshold decrease decision
    pub fn plan_threshold_decrease(
        &self,
        hit_rate: f64,
        max_cache_size: u64,
    ) -> (ResizeStatus, u64) {
        let cfg = &self.config;
        if hit_rate <= cfg.upper_hr_threshold {
            return (ResizeStatus::InSpec, max_cache_size);
        }
        if !cfg.size_decrease_possible() {
            return (ResizeStatus::DecreaseDisabled, max_cache_size);
        }
        if max_cache_size <= cfg.min_size {
            return (ResizeStatus::AtMinSize, max_cache_size);
        }
        let mut new_size = ((max_cache_size as f64) * cfg.decrement) as u64;
        new_size = new_size.max(cfg.min_size);
        if cfg.apply_max_decrement && cfg.max_decrement + new_size < max_cache_size {
            new_size = max_cache_size - cfg.max_decrement;
        }
        (ResizeStatus::Decrease, new_size)
    }

    /// Whether the age-out pass should evict this epoch
    pub fn age_out_applies(&self, hit_rate: f64, max_cache_size: u64) -> bool {
        let cfg = &self.config;
        let mode_applies = cfg.decr_mode == DecrMode::AgeOut
            || (cfg.decr_mode == DecrMode::AgeOutWithThreshold
                && hit_rate >= cfg.upper_hr_threshold);
        mode_applies && max_cache_size > cfg.min_size
    }

    /// Decrease decision after aged-out entries have been evicted
    pub fn plan_age_out_decrease(
        &self,
        hit_rate: f64,
        index_size: u64,
        max_cache_size: u64,
    ) -> (ResizeStatus, u64) {
        let cfg = &self.config;
        if !cfg.size_decrease_possible() {
            return (ResizeStatus::DecreaseDisabled, max_cache_size);
        }
        if !self.age_out_applies(hit_rate, max_cache_size) {
            if max_cache_size <= cfg.min_size {
                return (ResizeStatus::AtMinSize, max_cache_size);
            }
            return (ResizeStatus::InSpec, max_cache_size);
        }
        if index_size >= max_cache_size {
            return (ResizeStatus::InSpec, max_cache_size);
        }
        let mut new_size = if cfg.apply_empty_reserve {
            let test_size = (index_size as f64 / (1.0 - cfg.empty_reserve)) as u64;
            if test_size >= max_cache_size {
                return (ResizeStatus::InSpec, max_cache_size);
            }
            test_size
        } else {
            index_size
        };
        new_size = new_size.max(cfg.min_size);
        if cfg.apply_max_decrement && cfg.max_decrement + new_size < max_cache_size {
            new_size = max_cache_size - cfg.max_decrement;
        }
        if new_size >= max_cache_size {
            return (ResizeStatus::InSpec, max_cache_size);
        }
        (ResizeStatus::Decrease, new_size)
    }

    /// Flash increase when a single insertion or growth of `space_needed`
    /// bytes would overflow the cache. Returns the new maximum, if any.
    pub fn plan_flash_increase(
        &self,
        space_needed: u64,
        index_size: u64,
        max_cache_size: u64,
    ) -> Option<u64> {
        let cfg = &self.config;
        if !cfg.flash_increase_possible()
            || space_needed <= self.flash_size_threshold
            || index_size + space_needed <= max_cache_size
            || max_cache_size >= cfg.max_size
        {
            return None;
        }
        let mut needed = space_needed;
        if index_size < max_cache_size {
            needed -= max_cache_size - index_size;
        }
        let needed = (needed as f64 * cfg.flash_multiple) as u64;
        let new_size = (max_cache_size + needed).min(cfg.max_size);
        debug!(
            "Flash increase: space_needed={} index_size={} max {} -> {}",
            space_needed, index_size, max_cache_size, new_size
        );
        Some(new_size)
    }

    /// Install a new maximum and recompute derived thresholds
    pub fn on_new_max(&mut self, new_max: u64, status: ResizeStatus) {
        self.flash_size_threshold = (new_max as f64 * self.config.flash_threshold) as u64;
        if matches!(status, ResizeStatus::Increase | ResizeStatus::FlashIncrease) {
            self.cache_full = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn resizer() -> AutoResizer {
        AutoResizer::new(AutoResizeConfig::default(), 1024 * 1024)
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AutoResizeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let mut config = AutoResizeConfig::default();
        config.max_size = MAX_MAX_CACHE_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = AutoResizeConfig::default();
        config.epoch_length = 10;
        assert!(config.validate().is_err());

        let mut config = AutoResizeConfig::default();
        config.lower_hr_threshold = 0.99999;
        assert!(config.validate().unwrap_err().contains("conflicting"));

        let mut config = AutoResizeConfig::default();
        config.initial_size = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_increase_requires_full_cache() {
        let mut r = resizer();
        let (status, _) = r.plan_increase(0.5, 1024 * 1024);
        assert_eq!(status, ResizeStatus::NotFull);

        r.cache_full = true;
        let (status, new_size) = r.plan_increase(0.5, 1024 * 1024);
        assert_eq!(status, ResizeStatus::Increase);
        assert_eq!(new_size, 2 * 1024 * 1024);
    }

    #[test]
    fn test_increase_clipped_by_max_increment() {
        let mut r = resizer();
        r.cache_full = true;
        let (status, new_size) = r.plan_increase(0.1, 4 * 1024 * 1024);
        assert_eq!(status, ResizeStatus::Increase);
        assert_eq!(new_size, 6 * 1024 * 1024);

        let (status, _) = r.plan_increase(0.1, 16 * 1024 * 1024);
        assert_eq!(status, ResizeStatus::AtMaxSize);
    }

    #[test]
    fn test_threshold_decrease() {
        let mut config = AutoResizeConfig::default();
        config.decr_mode = DecrMode::Threshold;
        let r = AutoResizer::new(config, 8 * 1024 * 1024);

        let (status, _) = r.plan_threshold_decrease(0.5, 8 * 1024 * 1024);
        assert_eq!(status, ResizeStatus::InSpec);

        let (status, new_size) = r.plan_threshold_decrease(1.0, 8 * 1024 * 1024);
        assert_eq!(status, ResizeStatus::Decrease);
        assert_eq!(new_size, (8.0 * 1024.0 * 1024.0 * 0.9) as u64);

        // clipped by max_decrement
        let (status, new_size) = r.plan_threshold_decrease(1.0, 16 * 1024 * 1024);
        assert_eq!(status, ResizeStatus::Decrease);
        assert_eq!(new_size, 15 * 1024 * 1024);

        let (status, _) = r.plan_threshold_decrease(1.0, 1024 * 1024);
        assert_eq!(status, ResizeStatus::AtMinSize);
    }

    #[test]
    fn test_age_out_decrease_applies_empty_reserve() {
        let mut config = AutoResizeConfig::default();
        config.decr_mode = DecrMode::AgeOut;
        config.apply_max_decrement = false;
        let r = AutoResizer::new(config, 8 * 1024 * 1024);

        let index_size = 2 * 1024 * 1024;
        let (status, new_size) = r.plan_age_out_decrease(0.5, index_size, 8 * 1024 * 1024);
        assert_eq!(status, ResizeStatus::Decrease);
        assert_eq!(new_size, (index_size as f64 / 0.95) as u64);
    }

    #[test]
    fn test_flash_increase() {
        let r = resizer();
        // below the flash threshold
        assert_eq!(r.plan_flash_increase(1024, 0, 1024 * 1024), None);
        // fits without growing
        assert_eq!(r.plan_flash_increase(300 * 1024, 0, 1024 * 1024), None);

        let new_max = r
            .plan_flash_increase(600 * 1024, 800 * 1024, 1024 * 1024)
            .unwrap();
        assert_eq!(new_max, 1024 * 1024 + 376 * 1024);
    }

    #[test]
    fn test_hit_rate_and_epochs() {
        let mut config = AutoResizeConfig::default();
        config.epoch_length = 100;
        let mut r = AutoResizer::new(config, 1024 * 1024);
        for i in 0..100 {
            r.record_access(i % 4 != 0);
        }
        assert!(r.epoch_complete());
        assert!((r.hit_rate() - 0.75).abs() < f64::EPSILON);
        r.reset_hit_rate_stats();
        assert_eq!(r.hit_rate(), 0.0);
        assert!(!r.epoch_complete());
    }

    #[quickcheck]
    fn prop_increase_never_exceeds_max(hit_pct: u8, size_kib: u16) -> TestResult {
        if hit_pct > 100 || size_kib == 0 {
            return TestResult::discard();
        }
        let mut r = resizer();
        r.cache_full = true;
        let current = size_kib as u64 * 1024;
        let (status, new_size) = r.plan_increase(hit_pct as f64 / 100.0, current);
        if status == ResizeStatus::Increase {
            TestResult::from_bool(
                new_size <= r.config.max_size
                    && new_size > current
                    && new_size - current <= r.config.max_increment,
            )
        } else {
            TestResult::from_bool(new_size == current)
        }
    }
}
