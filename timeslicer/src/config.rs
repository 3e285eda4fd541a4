//! The immutable collector configuration, read from the environment once at
//! startup and passed by reference into every component.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;

use timeslicer_perf::events::{resolve_event_names, Preset};

use crate::error::CollectorError;

/// Sampling below this period breaks the kernel's throttling assumptions.
pub const MIN_PERIOD: u64 = 100_000;
/// Factor applied to the period on throttle/unthrottle notifications.
pub const PERIOD_ADJUST_SCALE: u64 = 10;
/// Consecutive empty wakes tolerated before the collector assumes the
/// consumer and the kernel have desynchronized.
pub const MAX_SAMPLE_PERIOD_SKIPS: u32 = 30;
/// Upper bound on records pulled from one ring per wake; the rest is drained.
pub const MAX_RECORD_READS: u32 = 100;
/// Wake-to-wake gaps above this many milliseconds are logged.
pub const EPOLL_TIME_DIFF_MAX_MS: u128 = 100;

pub const DEFAULT_PERIOD: u64 = 10_000_000;
pub const DEFAULT_RESULT_FILE: &str = "result.txt";
pub const DEFAULT_WATTSUP_DEVICE: &str = "ttyUSB0";
pub const DEFAULT_PRELOAD: &str = "libtimeslicer_preload.so";

#[derive(Debug, Clone)]
pub struct SampleConfig {
    /// Leader sample period in nanoseconds.
    pub period: u64,
    /// Auxiliary event names in the order counters are opened and reported.
    pub events: Vec<String>,
    pub presets: BTreeSet<Preset>,
    pub result_file: PathBuf,
    pub notify_start: bool,
    /// `%`-wildcard patterns deciding which source files are in scope.
    pub source_scope: Vec<String>,
    /// Path handed to the dynamic linker for the interposition shim.
    pub preload: PathBuf,
    pub wattsup_device: String,
}

impl SampleConfig {
    pub fn from_env() -> Result<SampleConfig, CollectorError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// The parse itself, driven by an arbitrary variable source so it can be
    /// exercised without touching the process environment.
    pub fn from_lookup(
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<SampleConfig, CollectorError> {
        let period = match get("COLLECTOR_PERIOD") {
            Some(raw) => raw.parse::<u64>().map_err(|e| CollectorError::Env {
                var: "COLLECTOR_PERIOD",
                detail: format!("`{raw}`: {e}"),
            })?,
            None => DEFAULT_PERIOD,
        };
        if period < MIN_PERIOD {
            return Err(CollectorError::Param { period });
        }

        let mut presets = BTreeSet::new();
        if let Some(raw) = get("COLLECTOR_PRESETS") {
            for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
                let preset = name.trim().parse::<Preset>().map_err(|e| CollectorError::Env {
                    var: "COLLECTOR_PRESETS",
                    detail: e.to_string(),
                })?;
                presets.insert(preset);
            }
        }

        let events_var = get("COLLECTOR_EVENTS").unwrap_or_default();
        let events = resolve_event_names(&events_var, &presets);

        let source_scope = match get("COLLECTOR_SOURCE_SCOPE") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec!["%".to_string()],
        };

        Ok(SampleConfig {
            period,
            events,
            presets,
            result_file: get("COLLECTOR_RESULT_FILE")
                .unwrap_or_else(|| DEFAULT_RESULT_FILE.to_string())
                .into(),
            notify_start: get("COLLECTOR_NOTIFY_START").as_deref() == Some("yes"),
            source_scope,
            preload: get("COLLECTOR_PRELOAD")
                .unwrap_or_else(|| DEFAULT_PRELOAD.to_string())
                .into(),
            wattsup_device: get("COLLECTOR_WATTSUP_DEVICE")
                .unwrap_or_else(|| DEFAULT_WATTSUP_DEVICE.to_string()),
        })
    }

    pub fn preset_enabled(&self, preset: Preset) -> bool {
        self.presets.contains(&preset)
    }
}
