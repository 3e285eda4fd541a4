//! Translation of symbolic event names into kernel counter configurations.
//!
//! Two name spaces are recognized: the generic perf names (`cpu-cycles`,
//! `instructions`, ...) which map onto `PERF_TYPE_HARDWARE`/`_SOFTWARE`
//! configs, and the platform event database (`MEM_LOAD_RETIRED.L3_MISS` and
//! friends) which encodes to a `PERF_TYPE_RAW` config on x86. The encoder
//! only shapes the attr; it never opens anything.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::sys::*;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("unknown event name `{name}`: {detail}")]
    BadEvent { name: String, detail: String },
}

/// Generic event names understood on every platform, mirroring the names the
/// `perf` tool itself accepts.
const GENERIC_EVENTS: &[(&str, u32, u64)] = &[
    ("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    (
        "cache-references",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_CACHE_REFERENCES,
    ),
    ("cache-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
    (
        "branches",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    ),
    (
        "branch-instructions",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    ),
    (
        "branch-misses",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_BRANCH_MISSES,
    ),
    (
        "ref-cycles",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_REF_CPU_CYCLES,
    ),
    ("cpu-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    (
        "context-switches",
        PERF_TYPE_SOFTWARE,
        PERF_COUNT_SW_CONTEXT_SWITCHES,
    ),
];

/// Produce a count-only attr for a symbolic event name. The exclude-kernel
/// bit is always set; the caller decides the disabled state.
pub fn encode(name: &str) -> Result<PerfEventAttr, EncodeError> {
    let mut attr = PerfEventAttr::zeroed();
    attr.flags = PERF_ATTR_FLAG_EXCLUDE_KERNEL;

    if let Some(&(_, kind, config)) = GENERIC_EVENTS.iter().find(|(n, _, _)| *n == name) {
        attr.kind = kind;
        attr.config = config;
        return Ok(attr);
    }

    let raw = raw_config_for(name)?;
    attr.kind = PERF_TYPE_RAW;
    attr.config = raw;
    Ok(attr)
}

/// True if `name` resolves to an openable configuration on this machine.
pub fn is_encodable(name: &str) -> bool {
    encode(name).is_ok()
}

/// The generic names plus everything the platform event database knows.
pub fn known_event_names() -> Vec<String> {
    let mut names: Vec<String> = GENERIC_EVENTS.iter().map(|(n, _, _)| n.to_string()).collect();
    names.extend(platform_event_names());
    names
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn raw_config_for(name: &str) -> Result<u64, EncodeError> {
    use x86::perfcnt::intel::{EventDescription, Tuple};

    let counters = x86::perfcnt::intel::events().ok_or_else(|| EncodeError::BadEvent {
        name: name.to_string(),
        detail: "no event database for this cpu model".to_string(),
    })?;
    let desc: &EventDescription = counters.get(name).ok_or_else(|| EncodeError::BadEvent {
        name: name.to_string(),
        detail: "not in the platform event database".to_string(),
    })?;

    let mut config: u64 = 0;
    match desc.event_code {
        Tuple::One(code) => config |= code as u64,
        Tuple::Two(code, _) => config |= code as u64,
    }
    match desc.umask {
        Tuple::One(mask) => config |= (mask as u64) << 8,
        Tuple::Two(mask, _) => config |= (mask as u64) << 8,
    }
    config |= (desc.counter_mask as u64) << 24;
    if desc.edge_detect {
        config |= 1 << 18;
    }
    if desc.any_thread {
        config |= 1 << 21;
    }
    if desc.invert {
        config |= 1 << 23;
    }
    Ok(config)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn platform_event_names() -> Vec<String> {
    x86::perfcnt::intel::events()
        .map(|counters| counters.keys().map(|k| k.to_string()).collect())
        .unwrap_or_default()
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn raw_config_for(name: &str) -> Result<u64, EncodeError> {
    Err(EncodeError::BadEvent {
        name: name.to_string(),
        detail: "no platform event database on this architecture".to_string(),
    })
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn platform_event_names() -> Vec<String> {
    Vec::new()
}

/// A named bundle of events (or a background reader) the operator can request
/// without enumerating low-level names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Preset {
    Cpu,
    Cache,
    Branches,
    Rapl,
    Wattsup,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Cpu,
        Preset::Cache,
        Preset::Branches,
        Preset::Rapl,
        Preset::Wattsup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Preset::Cpu => "cpu",
            Preset::Cache => "cache",
            Preset::Branches => "branches",
            Preset::Rapl => "rapl",
            Preset::Wattsup => "wattsup",
        }
    }

    /// The counter events this preset expands to. The energy presets expand
    /// to nothing; they enable background readers instead.
    pub fn events(self) -> &'static [&'static str] {
        match self {
            Preset::Cpu => &["cpu-cycles", "instructions"],
            Preset::Cache => &["MEM_LOAD_RETIRED.L3_HIT", "MEM_LOAD_RETIRED.L3_MISS"],
            Preset::Branches => &["branches", "branch-misses"],
            Preset::Rapl | Preset::Wattsup => &[],
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Preset::Cpu => "cpu cycles and retired instructions",
            Preset::Cache => "last-level cache hits and misses",
            Preset::Branches => "branches and branch mispredictions",
            Preset::Rapl => "package energy from the powercap interface",
            Preset::Wattsup => "wall power from a WattsUp meter",
        }
    }
}

impl FromStr for Preset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Preset::Cpu),
            "cache" => Ok(Preset::Cache),
            "branches" => Ok(Preset::Branches),
            "rapl" => Ok(Preset::Rapl),
            "wattsup" => Ok(Preset::Wattsup),
            other => Err(UnknownPreset(other.to_string())),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("unknown preset `{0}`")]
pub struct UnknownPreset(pub String);

/// The ordered event list the collector and the preload shim must agree on:
/// the comma-separated explicit names followed by each requested preset's
/// expansion, duplicates removed while preserving first occurrence.
pub fn resolve_event_names(
    events_var: &str,
    presets: &BTreeSet<Preset>,
) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for name in events_var.split(',') {
        push(name.trim());
    }
    for preset in presets {
        for name in preset.events() {
            push(name);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_events_encode() {
        let attr = encode("cpu-cycles").unwrap();
        assert_eq!(attr.kind, PERF_TYPE_HARDWARE);
        assert_eq!(attr.config, PERF_COUNT_HW_CPU_CYCLES);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_EXCLUDE_KERNEL, 0);

        let attr = encode("page-faults").unwrap();
        assert_eq!(attr.kind, PERF_TYPE_SOFTWARE);
        assert_eq!(attr.config, PERF_COUNT_SW_PAGE_FAULTS);
    }

    #[test]
    fn nonsense_names_are_rejected() {
        let err = encode("NOT_A_REAL_EVENT.AT_ALL").unwrap_err();
        let EncodeError::BadEvent { name, .. } = err;
        assert_eq!(name, "NOT_A_REAL_EVENT.AT_ALL");
    }

    #[test]
    fn preset_round_trip() {
        for preset in Preset::ALL {
            assert_eq!(preset.name().parse::<Preset>().unwrap(), preset);
        }
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn event_resolution_order_and_dedup() {
        let presets: BTreeSet<Preset> = [Preset::Cpu, Preset::Branches].into_iter().collect();
        let names = resolve_event_names("instructions,cache-misses", &presets);
        assert_eq!(
            names,
            vec![
                "instructions",
                "cache-misses",
                "cpu-cycles",
                "branches",
                "branch-misses",
            ]
        );
    }

    #[test]
    fn empty_event_var_resolves_to_preset_events_only() {
        let presets: BTreeSet<Preset> = [Preset::Cpu].into_iter().collect();
        assert_eq!(
            resolve_event_names("", &presets),
            vec!["cpu-cycles", "instructions"]
        );
    }
}
