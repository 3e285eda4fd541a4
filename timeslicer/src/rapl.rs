//! Energy readings from the powercap hierarchy: every `intel-rapl:*` zone
//! and its subzones report an accumulating microjoule counter in
//! `energy_uj`, labeled by the zone's `name` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;

pub const POWERCAP_ROOT: &str = "/sys/class/powercap/intel-rapl";
const ZONE_PREFIX: &str = "intel-rapl:";

/// Read every zone under the system powercap root. Unreadable zones are
/// skipped; an empty map just means nothing could be read this cycle.
pub fn read_energy() -> BTreeMap<String, u64> {
    read_energy_under(Path::new(POWERCAP_ROOT))
}

pub fn zones_available() -> bool {
    !find_in_dir(Path::new(POWERCAP_ROOT), ZONE_PREFIX).is_empty()
}

fn read_energy_under(root: &Path) -> BTreeMap<String, u64> {
    let mut readings = BTreeMap::new();
    for zone in find_in_dir(root, ZONE_PREFIX) {
        let zone_dir = root.join(&zone);
        push_energy_info(&mut readings, &zone_dir);
        for sub in find_in_dir(&zone_dir, &zone) {
            push_energy_info(&mut readings, &zone_dir.join(sub));
        }
    }
    readings
}

fn push_energy_info(readings: &mut BTreeMap<String, u64>, dir: &Path) {
    let name = match read_trimmed(&dir.join("name")) {
        Some(name) => name,
        None => return,
    };
    let energy = match read_trimmed(&dir.join("energy_uj")).and_then(|s| s.parse::<u64>().ok()) {
        Some(energy) => energy,
        None => {
            debug!("zone {} has no readable energy counter", dir.display());
            return;
        }
    };
    readings.insert(name, energy);
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn find_in_dir(dir: &Path, substr: &str) -> Vec<String> {
    let mut found: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.contains(substr))
                .collect()
        })
        .unwrap_or_default();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_zone(dir: &Path, name: &str, energy: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("name"), format!("{name}\n")).unwrap();
        fs::write(dir.join("energy_uj"), format!("{energy}\n")).unwrap();
    }

    #[test]
    fn zones_and_subzones_are_collected() {
        let root = tempfile::tempdir().unwrap();
        let zone = root.path().join("intel-rapl:0");
        write_zone(&zone, "package-0", "123456");
        write_zone(&zone.join("intel-rapl:0:0"), "core", "111");
        write_zone(&zone.join("intel-rapl:0:1"), "uncore", "222");
        // an unrelated directory is ignored
        fs::create_dir_all(root.path().join("thermal")).unwrap();

        let readings = read_energy_under(root.path());
        assert_eq!(readings.len(), 3);
        assert_eq!(readings["package-0"], 123_456);
        assert_eq!(readings["core"], 111);
        assert_eq!(readings["uncore"], 222);
    }

    #[test]
    fn unreadable_counters_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let zone = root.path().join("intel-rapl:0");
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("name"), "package-0\n").unwrap();
        fs::write(zone.join("energy_uj"), "not a number\n").unwrap();

        assert!(read_energy_under(root.path()).is_empty());
    }

    #[test]
    fn missing_root_reads_as_empty() {
        assert!(read_energy_under(Path::new("/definitely/not/here")).is_empty());
    }
}
