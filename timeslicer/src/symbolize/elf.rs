//! ELF-side symbolization support: locating the object that actually holds
//! debug info for a mapping, and a per-module function-symbol index that
//! stands in for runtime symbol lookup in the subject's address space.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};

/// How addresses in a mapping translate to file-relative addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBias {
    /// Fixed-address executable: instruction pointers are file addresses.
    Executable,
    /// Position-independent object shifted by the mapping base.
    Dynamic(u64),
}

impl LoadBias {
    pub fn for_kind(kind: ObjectKind, mapping_base: u64) -> LoadBias {
        match kind {
            ObjectKind::Executable => LoadBias::Executable,
            _ => LoadBias::Dynamic(mapping_base),
        }
    }

    /// The amount added to file-relative ranges to get runtime addresses.
    pub fn offset(&self) -> u64 {
        match self {
            LoadBias::Executable => 0,
            LoadBias::Dynamic(base) => *base,
        }
    }

    pub fn file_addr(&self, runtime_addr: u64) -> Option<u64> {
        runtime_addr.checked_sub(self.offset())
    }
}

pub struct MappedObject {
    pub path: PathBuf,
    pub data: Mmap,
}

fn map_file(path: &Path) -> Option<MappedObject> {
    let file = File::open(path).ok()?;
    let data = unsafe { Mmap::map(&file) }.ok()?;
    Some(MappedObject {
        path: path.to_path_buf(),
        data,
    })
}

fn has_debug_info(data: &[u8]) -> bool {
    object::File::parse(data)
        .map(|obj| obj.section_by_name(".debug_info").is_some())
        .unwrap_or(false)
}

fn build_id_path(data: &[u8]) -> Option<PathBuf> {
    let obj = object::File::parse(data).ok()?;
    let build_id = obj.build_id().ok()??;
    if build_id.len() < 2 {
        return None;
    }
    let hex: String = build_id.iter().map(|b| format!("{b:02x}")).collect();
    Some(PathBuf::from(format!(
        "/usr/lib/debug/.build-id/{}/{}.debug",
        &hex[..2],
        &hex[2..]
    )))
}

fn debuglink_paths(data: &[u8], binary_path: &Path) -> Vec<PathBuf> {
    let Some(directory) = binary_path.parent() else {
        return Vec::new();
    };
    let Ok(obj) = object::File::parse(data) else {
        return Vec::new();
    };
    let Ok(Some((name, _crc))) = obj.gnu_debuglink() else {
        return Vec::new();
    };
    let name = String::from_utf8_lossy(name).into_owned();
    vec![
        directory.join(&name),
        directory.join(".debug").join(&name),
        Path::new("/usr/lib/debug")
            .join(directory.strip_prefix("/").unwrap_or(directory))
            .join(&name),
    ]
}

/// Find the ELF object carrying DWARF for `binary_path`: the binary itself
/// when it still has `.debug_info`, otherwise the build-id path under
/// `/usr/lib/debug`, otherwise the `.gnu_debuglink` targets.
pub fn locate_debug_object(binary_path: &Path) -> Option<MappedObject> {
    let binary = map_file(binary_path)?;
    if has_debug_info(&binary.data) {
        return Some(binary);
    }

    let mut candidates = Vec::new();
    if let Some(path) = build_id_path(&binary.data) {
        candidates.push(path);
    }
    candidates.extend(debuglink_paths(&binary.data, binary_path));

    for candidate in candidates {
        if let Some(mapped) = map_file(&candidate) {
            if has_debug_info(&mapped.data) {
                debug!(
                    "using {} for debug info of {}",
                    mapped.path.display(),
                    binary_path.display()
                );
                return Some(mapped);
            }
        }
    }
    None
}

#[derive(Debug)]
struct SymbolEntry {
    addr: u64,
    size: u64,
    name: String,
}

/// A sorted function-symbol index over one mapped module, answering "which
/// function contains this instruction pointer" the way a runtime lookup
/// against the loaded image would.
#[derive(Debug)]
pub struct ModuleSymbols {
    pub path: String,
    pub mapping_base: u64,
    pub mapping_end: u64,
    pub bias: LoadBias,
    symbols: Vec<SymbolEntry>,
}

#[derive(Debug, PartialEq)]
pub struct SymbolHit<'a> {
    pub name: &'a str,
    /// Runtime address of the symbol, bias already applied.
    pub sym_addr: u64,
}

impl ModuleSymbols {
    /// Index the text symbols of `data` (symtab and dynsym merged) for the
    /// mapping `[mapping_base, mapping_end)`.
    pub fn from_object_data(
        path: String,
        mapping_base: u64,
        mapping_end: u64,
        data: &[u8],
    ) -> Option<ModuleSymbols> {
        let obj = object::File::parse(data).ok()?;
        let bias = LoadBias::for_kind(obj.kind(), mapping_base);

        let mut symbols: Vec<SymbolEntry> = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| {
                Some(SymbolEntry {
                    addr: sym.address(),
                    size: sym.size(),
                    name: sym.name().ok()?.to_string(),
                })
            })
            .collect();
        symbols.sort_by_key(|entry| entry.addr);
        symbols.dedup_by_key(|entry| entry.addr);

        Some(ModuleSymbols {
            path,
            mapping_base,
            mapping_end,
            bias,
            symbols,
        })
    }

    pub fn contains(&self, runtime_addr: u64) -> bool {
        self.mapping_base <= runtime_addr && runtime_addr < self.mapping_end
    }

    /// The symbol with the greatest address not exceeding the ip. A symbol
    /// with a known size only matches inside its extent.
    pub fn lookup(&self, runtime_addr: u64) -> Option<SymbolHit<'_>> {
        let file_addr = self.bias.file_addr(runtime_addr)?;
        let index = self
            .symbols
            .partition_point(|entry| entry.addr <= file_addr)
            .checked_sub(1)?;
        let entry = &self.symbols[index];
        if entry.size != 0 && file_addr >= entry.addr + entry.size {
            return None;
        }
        Some(SymbolHit {
            name: &entry.name,
            sym_addr: entry.addr + self.bias.offset(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(bias: LoadBias) -> ModuleSymbols {
        ModuleSymbols {
            path: "/usr/lib/libdemo.so".into(),
            mapping_base: 0x7f00_0000_0000,
            mapping_end: 0x7f00_0010_0000,
            bias,
            symbols: vec![
                SymbolEntry {
                    addr: 0x1000,
                    size: 0x100,
                    name: "alpha".into(),
                },
                SymbolEntry {
                    addr: 0x2000,
                    size: 0,
                    name: "beta".into(),
                },
                SymbolEntry {
                    addr: 0x3000,
                    size: 0x10,
                    name: "gamma".into(),
                },
            ],
        }
    }

    #[test]
    fn lookup_picks_the_covering_symbol() {
        let base = 0x7f00_0000_0000;
        let m = module(LoadBias::Dynamic(base));
        let hit = m.lookup(base + 0x1080).unwrap();
        assert_eq!(hit.name, "alpha");
        assert_eq!(hit.sym_addr, base + 0x1000);

        // sized symbol bounds are respected
        assert!(m.lookup(base + 0x1100).is_none());

        // zero-size symbols extend to the next address
        let hit = m.lookup(base + 0x2abc).unwrap();
        assert_eq!(hit.name, "beta");
    }

    #[test]
    fn lookup_before_the_first_symbol_misses() {
        let base = 0x7f00_0000_0000;
        let m = module(LoadBias::Dynamic(base));
        assert!(m.lookup(base + 0xfff).is_none());
    }

    #[test]
    fn executables_use_file_addresses_directly() {
        let m = module(LoadBias::Executable);
        let hit = m.lookup(0x3008).unwrap();
        assert_eq!(hit.name, "gamma");
        assert_eq!(hit.sym_addr, 0x3000);
    }

    #[test]
    fn containment_uses_the_mapping_extent() {
        let m = module(LoadBias::Executable);
        assert!(m.contains(0x7f00_0000_1234));
        assert!(!m.contains(0x1000));
    }
}
