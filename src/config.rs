//! Collector tuning parameters.
//!
//! Read once at startup from `GC_*` environment variables, which are
//! then cleared so child processes do not inherit them. Invalid values
//! are ignored with a warning, keeping the defaults.

use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use log::warn;

use crate::pages::CELLS_PER_PAGE;

/// Byte-pressure threshold for the tracked allocator.
pub const GC_MALLOC_LIMIT: usize = 8_000_000;
/// Cells materialized at startup.
pub const HEAP_MIN_SLOTS: usize = 10_000;
/// Minimum free cells required after a collection.
pub const FREE_MIN: usize = 4_096;
/// Multiplicative page-growth factor.
pub const HEAP_SLOTS_GROWTH_FACTOR: f64 = 1.8;

#[derive(Clone, Debug)]
pub struct GcConfig {
    pub initial_malloc_limit: usize,
    pub initial_heap_min_slots: usize,
    pub initial_free_min: usize,
    /// Linear growth step, in pages.
    pub heap_pages_increment: usize,
    pub heap_slots_growth_factor: f64,
    pub data_file: Option<PathBuf>,
    pub verbose_gc_stats: bool,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            initial_malloc_limit: GC_MALLOC_LIMIT,
            initial_heap_min_slots: HEAP_MIN_SLOTS,
            initial_free_min: FREE_MIN,
            heap_pages_increment: HEAP_MIN_SLOTS / CELLS_PER_PAGE,
            heap_slots_growth_factor: HEAP_SLOTS_GROWTH_FACTOR,
            data_file: None,
            verbose_gc_stats: false,
        }
    }
}

const ENV_VARS: &[&str] = &[
    "GC_MALLOC_LIMIT",
    "GC_HEAP_MIN_SLOTS",
    "GC_HEAP_FREE_MIN",
    "FREE_MIN",
    "GC_HEAP_SLOTS_INCREMENT",
    "GC_HEAP_SLOTS_GROWTH_FACTOR",
    "GC_DATA_FILE",
    "GC_STATS",
];

impl GcConfig {
    /// Read parameters from the process environment and clear them.
    pub fn from_env() -> GcConfig {
        let config = GcConfig::parse(|key| env::var(key).ok());
        for key in ENV_VARS {
            env::remove_var(key);
        }
        config
    }

    /// Pure core of `from_env`, driven by an arbitrary lookup.
    pub fn parse<F>(mut lookup: F) -> GcConfig
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = GcConfig::default();

        if let Some(raw) = lookup("GC_MALLOC_LIMIT") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.initial_malloc_limit = n,
                _ => warn!("GC_MALLOC_LIMIT={} ignored", raw),
            }
        }
        if let Some(raw) = lookup("GC_HEAP_MIN_SLOTS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.initial_heap_min_slots = n,
                _ => warn!("GC_HEAP_MIN_SLOTS={} ignored", raw),
            }
        }
        let free_min = lookup("GC_HEAP_FREE_MIN").or_else(|| lookup("FREE_MIN"));
        if let Some(raw) = free_min {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.initial_free_min = n,
                _ => warn!("GC_HEAP_FREE_MIN={} ignored", raw),
            }
        }
        if let Some(raw) = lookup("GC_HEAP_SLOTS_INCREMENT") {
            match raw.parse::<usize>() {
                Ok(n) => config.heap_pages_increment = n / CELLS_PER_PAGE,
                _ => warn!("GC_HEAP_SLOTS_INCREMENT={} ignored", raw),
            }
        }
        if let Some(raw) = lookup("GC_HEAP_SLOTS_GROWTH_FACTOR") {
            match raw.parse::<f64>() {
                Ok(d) if d > 0.0 => config.heap_slots_growth_factor = d,
                _ => warn!("GC_HEAP_SLOTS_GROWTH_FACTOR={} ignored", raw),
            }
        }
        if let Some(raw) = lookup("GC_DATA_FILE") {
            config.data_file = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("GC_STATS") {
            config.verbose_gc_stats = raw.parse::<i64>().map(|n| n > 0).unwrap_or(false);
        }
        config
    }
}

/// Where the human-readable GC log goes. Defaults to standard error; an
/// unopenable `GC_DATA_FILE` is reported there and the default kept.
pub enum LogTarget {
    Stderr,
    File(File),
}

impl LogTarget {
    pub fn from_config(config: &GcConfig) -> LogTarget {
        match &config.data_file {
            Some(path) => LogTarget::open(path.clone()),
            None => LogTarget::Stderr,
        }
    }

    pub fn open(path: PathBuf) -> LogTarget {
        match File::create(&path) {
            Ok(f) => LogTarget::File(f),
            Err(err) => {
                eprintln!(
                    "can't open gc log file {} for writing, using default: {}",
                    path.display(),
                    err
                );
                LogTarget::Stderr
            }
        }
    }
}

impl Write for LogTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogTarget::Stderr => io::stderr().write(buf),
            LogTarget::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogTarget::Stderr => io::stderr().flush(),
            LogTarget::File(f) => f.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse_map(pairs: &[(&str, &str)]) -> GcConfig {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        GcConfig::parse(|key| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_without_environment() {
        let config = parse_map(&[]);
        assert_eq!(config.initial_malloc_limit, GC_MALLOC_LIMIT);
        assert_eq!(config.initial_heap_min_slots, HEAP_MIN_SLOTS);
        assert_eq!(config.initial_free_min, FREE_MIN);
        assert_eq!(config.heap_pages_increment, HEAP_MIN_SLOTS / CELLS_PER_PAGE);
        assert!(!config.verbose_gc_stats);
        assert!(config.data_file.is_none());
    }

    #[test]
    fn numeric_overrides() {
        let config = parse_map(&[
            ("GC_MALLOC_LIMIT", "16000000"),
            ("GC_HEAP_MIN_SLOTS", "50000"),
            ("GC_HEAP_FREE_MIN", "1000"),
            ("GC_HEAP_SLOTS_INCREMENT", "20000"),
            ("GC_HEAP_SLOTS_GROWTH_FACTOR", "2.5"),
        ]);
        assert_eq!(config.initial_malloc_limit, 16_000_000);
        assert_eq!(config.initial_heap_min_slots, 50_000);
        assert_eq!(config.initial_free_min, 1_000);
        assert_eq!(config.heap_pages_increment, 20_000 / CELLS_PER_PAGE);
        assert!((config.heap_slots_growth_factor - 2.5).abs() < 1e-9);
    }

    #[test]
    fn free_min_alias() {
        let config = parse_map(&[("FREE_MIN", "777")]);
        assert_eq!(config.initial_free_min, 777);
        // the primary name wins over the alias
        let config = parse_map(&[("GC_HEAP_FREE_MIN", "888"), ("FREE_MIN", "999")]);
        assert_eq!(config.initial_free_min, 888);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = parse_map(&[
            ("GC_MALLOC_LIMIT", "banana"),
            ("GC_HEAP_MIN_SLOTS", "0"),
            ("GC_HEAP_SLOTS_GROWTH_FACTOR", "-1.0"),
            ("GC_STATS", "nope"),
        ]);
        assert_eq!(config.initial_malloc_limit, GC_MALLOC_LIMIT);
        assert_eq!(config.initial_heap_min_slots, HEAP_MIN_SLOTS);
        assert!((config.heap_slots_growth_factor - HEAP_SLOTS_GROWTH_FACTOR).abs() < 1e-9);
        assert!(!config.verbose_gc_stats);
    }

    #[test]
    fn stats_switch() {
        assert!(parse_map(&[("GC_STATS", "1")]).verbose_gc_stats);
        assert!(!parse_map(&[("GC_STATS", "0")]).verbose_gc_stats);
    }

    #[test]
    fn data_file_path_is_kept() {
        let config = parse_map(&[("GC_DATA_FILE", "/tmp/gc.log")]);
        assert_eq!(config.data_file, Some(PathBuf::from("/tmp/gc.log")));
    }
}
