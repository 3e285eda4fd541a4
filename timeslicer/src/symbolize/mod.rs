//! The memory map: built once after the subject's image is loaded, then
//! queried for every captured instruction pointer. Address ranges resolve to
//! source lines and function symbols through two interval tables; per-module
//! ELF symbol indexes stand in for runtime symbol lookup.

pub mod demangle;
pub mod dwarf;
pub mod elf;
pub mod interval;
pub mod scope;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::proc_maps::MapRegion;
use self::elf::ModuleSymbols;
use self::interval::Interval;

pub type FileId = usize;
type LineId = usize;

/// A source file that received at least one address range; holds its lines'
/// sample counters through the shared line table.
#[derive(Debug)]
pub struct SourceFile {
    name: String,
    lines: FxHashMap<u32, LineId>,
}

impl SourceFile {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One source line. The sample counter is the only thing mutated after the
/// map is built, and only ever monotonically.
#[derive(Debug)]
pub struct Line {
    file: FileId,
    number: u32,
    samples: AtomicU64,
}

impl Line {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn add_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    /// Name of the containing class when the DIE tree shows one.
    pub class: String,
}

#[derive(Debug)]
struct RangeTarget {
    line: LineId,
    col: u32,
}

#[derive(Debug)]
pub struct LineHit<'a> {
    pub file_name: &'a str,
    pub line: &'a Line,
    pub col: u32,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no debug information found for any executable mapping")]
    NoDebugInfo,
}

/// Accumulates the interval tables during the build. Inserts are
/// first-wins: a range overlapping an already-recorded one is dropped,
/// which keeps the tables disjoint.
#[derive(Default)]
pub(crate) struct MapBuilder {
    files: Vec<SourceFile>,
    file_ids: FxHashMap<String, FileId>,
    lines: Vec<Line>,
    line_ranges: BTreeMap<Interval, RangeTarget>,
    sym_ranges: BTreeMap<Interval, FunctionSymbol>,
}

impl MapBuilder {
    fn file_id(&mut self, name: &str) -> FileId {
        if let Some(&id) = self.file_ids.get(name) {
            return id;
        }
        let id = self.files.len();
        self.files.push(SourceFile {
            name: name.to_string(),
            lines: FxHashMap::default(),
        });
        self.file_ids.insert(name.to_string(), id);
        id
    }

    fn line_id(&mut self, file: FileId, number: u32) -> LineId {
        if let Some(&id) = self.files[file].lines.get(&number) {
            return id;
        }
        let id = self.lines.len();
        self.lines.push(Line {
            file,
            number,
            samples: AtomicU64::new(0),
        });
        self.files[file].lines.insert(number, id);
        id
    }

    pub(crate) fn add_line_range(&mut self, file: &str, line: u32, col: u32, range: Interval) {
        if range.is_empty() || self.line_ranges.contains_key(&range) {
            return;
        }
        let file = self.file_id(file);
        let line = self.line_id(file, line);
        self.line_ranges.insert(range, RangeTarget { line, col });
    }

    pub(crate) fn add_function_range(&mut self, range: Interval, name: String, class: String) {
        if range.is_empty() || name.is_empty() || self.sym_ranges.contains_key(&range) {
            return;
        }
        self.sym_ranges.insert(range, FunctionSymbol { name, class });
    }

    fn finish(self, modules: Vec<ModuleSymbols>) -> MemoryMap {
        MemoryMap {
            files: self.files,
            lines: self.lines,
            line_ranges: self.line_ranges,
            sym_ranges: self.sym_ranges,
            modules,
        }
    }
}

pub struct MemoryMap {
    files: Vec<SourceFile>,
    lines: Vec<Line>,
    line_ranges: BTreeMap<Interval, RangeTarget>,
    sym_ranges: BTreeMap<Interval, FunctionSymbol>,
    modules: Vec<ModuleSymbols>,
}

impl MemoryMap {
    /// Build the map for a set of process mappings: locate debug info for
    /// each executable file mapping, index its symbols, and ingest its
    /// DWARF. Mappings without usable debug info are skipped with a note;
    /// having none at all is fatal.
    pub fn build(regions: &[MapRegion], source_scope: &[String]) -> Result<MemoryMap, BuildError> {
        let mut builder = MapBuilder::default();
        let mut modules = Vec::new();
        let mut ingested = 0usize;
        let mut seen: Vec<&str> = Vec::new();

        for region in regions.iter().filter(|r| r.is_executable_file()) {
            if seen.contains(&region.path.as_str()) {
                continue;
            }
            seen.push(&region.path);

            let Some(debug_obj) = elf::locate_debug_object(Path::new(&region.path)) else {
                debug!("no debug information for {}", region.path);
                continue;
            };
            let Some(module) = ModuleSymbols::from_object_data(
                region.path.clone(),
                region.start,
                region.end,
                &debug_obj.data,
            ) else {
                warn!("unreadable object file {}", debug_obj.path.display());
                continue;
            };

            let load_offset = module.bias.offset();
            match dwarf::collect_debug_info(&debug_obj.data, load_offset, source_scope, &mut builder)
            {
                Ok(()) => {
                    debug!("ingested debug info for {}", region.path);
                    ingested += 1;
                }
                Err(err) => {
                    warn!("failed to read debug info for {}: {err}", region.path);
                }
            }
            modules.push(module);
        }

        if ingested == 0 {
            return Err(BuildError::NoDebugInfo);
        }
        Ok(builder.finish(modules))
    }

    /// The source line covering `addr`, if any range claims it.
    pub fn find_line(&self, addr: u64) -> Option<LineHit<'_>> {
        let target = self.line_ranges.get(&Interval::point(addr))?;
        let line = &self.lines[target.line];
        Some(LineHit {
            file_name: self.files[line.file].name(),
            line,
            col: target.col,
        })
    }

    /// The function whose DWARF range covers `addr`.
    pub fn find_symbol(&self, addr: u64) -> Option<&FunctionSymbol> {
        self.sym_ranges.get(&Interval::point(addr))
    }

    /// The mapped module containing `addr`, for runtime-style symbol lookup.
    pub fn module_for(&self, addr: u64) -> Option<&ModuleSymbols> {
        self.modules.iter().find(|module| module.contains(addr))
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_map() -> MemoryMap {
        let mut builder = MapBuilder::default();
        builder.add_line_range("/src/app.cc", 10, 3, Interval::new(0x1000, 0x1020));
        builder.add_line_range("/src/app.cc", 11, 1, Interval::new(0x1020, 0x1040));
        builder.add_line_range("/src/util.cc", 80, 0, Interval::new(0x2000, 0x2100));
        // overlapping insert loses
        builder.add_line_range("/src/other.cc", 99, 0, Interval::new(0x1010, 0x1018));
        builder.add_function_range(
            Interval::new(0x1000, 0x1040),
            "compute".into(),
            "Engine".into(),
        );
        builder.add_function_range(Interval::new(0x2000, 0x2100), "helper".into(), String::new());
        builder.finish(Vec::new())
    }

    #[test]
    fn line_lookup_hits_the_covering_range() {
        let map = built_map();
        let hit = map.find_line(0x1005).unwrap();
        assert_eq!(hit.file_name, "/src/app.cc");
        assert_eq!(hit.line.number(), 10);
        assert_eq!(hit.col, 3);

        let hit = map.find_line(0x1020).unwrap();
        assert_eq!(hit.line.number(), 11);

        assert!(map.find_line(0x1040).is_none());
        assert!(map.find_line(0x500).is_none());
    }

    #[test]
    fn overlapping_ranges_keep_the_first_entry() {
        let map = built_map();
        let hit = map.find_line(0x1012).unwrap();
        assert_eq!(hit.file_name, "/src/app.cc");
        assert_eq!(hit.line.number(), 10);
    }

    #[test]
    fn symbol_lookup_carries_the_class() {
        let map = built_map();
        let sym = map.find_symbol(0x1030).unwrap();
        assert_eq!(sym.name, "compute");
        assert_eq!(sym.class, "Engine");

        let sym = map.find_symbol(0x2050).unwrap();
        assert_eq!(sym.name, "helper");
        assert!(sym.class.is_empty());
    }

    #[test]
    fn sample_counters_accumulate_per_line() {
        let map = built_map();
        let hit = map.find_line(0x1005).unwrap();
        assert_eq!(hit.line.samples(), 0);
        hit.line.add_sample();
        hit.line.add_sample();
        // same line, different address in the range
        let again = map.find_line(0x101f).unwrap();
        assert_eq!(again.line.samples(), 2);
    }

    #[test]
    fn files_are_deduplicated_by_name() {
        let map = built_map();
        // the losing overlapped insert never created its file entry
        let names: Vec<&str> = map.files().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["/src/app.cc", "/src/util.cc"]);
    }
}
