//! DWARF ingestion: walk each compilation unit's DIE tree for function and
//! inlined-call ranges, and its line table for address-to-source mappings.
//! Everything is extracted into the memory map's interval tables up front;
//! no DWARF state survives the build.

use std::borrow::Cow;

use gimli::{AttributeValue, DebuggingInformationEntry, Dwarf, EndianSlice, RunTimeEndian, Unit};
use log::debug;
use object::{Object, ObjectSection};
use thiserror::Error;

use super::scope::{canonicalize_path, in_scope};
use super::interval::Interval;
use super::MapBuilder;

#[derive(Debug, Error)]
pub enum DwarfError {
    #[error("not a readable object file: {0}")]
    Object(#[from] object::read::Error),

    #[error("malformed debug info: {0}")]
    Dwarf(#[from] gimli::Error),
}

/// Ingest one debug object. `load_offset` is zero for fixed-address
/// executables and the mapping base for position-independent objects.
pub(crate) fn collect_debug_info(
    data: &[u8],
    load_offset: u64,
    scope: &[String],
    builder: &mut MapBuilder,
) -> Result<(), DwarfError> {
    let obj = object::File::parse(data)?;
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load = |id: gimli::SectionId| -> Result<Cow<'_, [u8]>, gimli::Error> {
        Ok(obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..])))
    };
    let sections = gimli::DwarfSections::load(load)?;
    let dwarf = sections.borrow(|section| EndianSlice::new(section, endian));

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = match dwarf.unit(header) {
            Ok(unit) => unit,
            Err(err) => {
                debug!("skipping malformed compilation unit: {err}");
                continue;
            }
        };
        if let Err(err) = process_unit(&dwarf, &unit, load_offset, scope, builder) {
            debug!("abandoning compilation unit mid-walk: {err}");
        }
    }
    Ok(())
}

fn process_unit<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    load_offset: u64,
    scope: &[String],
    builder: &mut MapBuilder,
) -> Result<(), gimli::Error> {
    walk_dies(dwarf, unit, load_offset, scope, builder)?;
    walk_line_table(dwarf, unit, load_offset, scope, builder);
    Ok(())
}

/// One pass over the DIE tree: subprograms declared in scope become function
/// ranges (tagged with the nearest enclosing class), inlined subroutines
/// whose declaration is out of scope but whose call site is in scope become
/// synthetic ranges attributed to the caller's file and line.
fn walk_dies<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    load_offset: u64,
    scope: &[String],
    builder: &mut MapBuilder,
) -> Result<(), gimli::Error> {
    let mut class_stack: Vec<(isize, String)> = Vec::new();
    let mut depth: isize = 0;
    let mut entries = unit.entries();
    while let Some((delta, entry)) = entries.next_dfs()? {
        depth += delta;
        while class_stack.last().is_some_and(|(d, _)| *d >= depth) {
            class_stack.pop();
        }

        match entry.tag() {
            gimli::DW_TAG_class_type | gimli::DW_TAG_structure_type => {
                if let Some(name) = attr_string(dwarf, unit, entry, gimli::DW_AT_name) {
                    class_stack.push((depth, name));
                }
            }
            gimli::DW_TAG_subprogram => {
                let Some(decl_file) = decl_file_path(dwarf, unit, entry, gimli::DW_AT_decl_file)
                else {
                    continue;
                };
                if !in_scope(&decl_file, scope) {
                    continue;
                }
                let Some(range) = pc_range(dwarf, unit, entry) else {
                    continue;
                };
                let name =
                    attr_string(dwarf, unit, entry, gimli::DW_AT_name).unwrap_or_default();
                let class = class_stack
                    .last()
                    .map(|(_, name)| name.clone())
                    .unwrap_or_default();
                builder.add_function_range(range.shifted(load_offset), name, class);
            }
            gimli::DW_TAG_inlined_subroutine => {
                record_inline(dwarf, unit, entry, load_offset, scope, builder)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn record_inline<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
    load_offset: u64,
    scope: &[String],
    builder: &mut MapBuilder,
) -> Result<(), gimli::Error> {
    let Some(call_file) = decl_file_path(dwarf, unit, entry, gimli::DW_AT_call_file) else {
        return Ok(());
    };
    let decl_file =
        decl_file_path(dwarf, unit, entry, gimli::DW_AT_decl_file).unwrap_or_default();

    // Only calls whose body lives outside the scope but whose call site is
    // inside it need synthetic ranges; in-scope bodies are covered by the
    // line table.
    if decl_file.is_empty() || in_scope(&decl_file, scope) || !in_scope(&call_file, scope) {
        return Ok(());
    }

    let call_line = entry
        .attr_value(gimli::DW_AT_call_line)?
        .and_then(|v| v.udata_value())
        .unwrap_or(0) as u32;
    let name = attr_string(dwarf, unit, entry, gimli::DW_AT_name).unwrap_or_default();

    let mut ranges: Vec<Interval> = Vec::new();
    if let Some(value) = entry.attr_value(gimli::DW_AT_ranges)? {
        if let Some(offset) = dwarf.attr_ranges_offset(unit, value)? {
            let mut iter = dwarf.ranges(unit, offset)?;
            while let Some(range) = iter.next()? {
                if range.begin < range.end {
                    ranges.push(Interval::new(range.begin, range.end));
                }
            }
        }
    } else if let Some(range) = pc_range(dwarf, unit, entry) {
        ranges.push(range);
    }

    for range in ranges {
        let range = range.shifted(load_offset);
        builder.add_line_range(&call_file, call_line, 0, range);
        builder.add_function_range(range, name.clone(), String::new());
    }
    Ok(())
}

/// Consecutive line-table rows become address ranges attributed to the
/// earlier row's file, line, and column. End-of-sequence rows reset the
/// chain so padding between functions is never attributed.
fn walk_line_table<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    load_offset: u64,
    scope: &[String],
    builder: &mut MapBuilder,
) {
    let Some(program) = unit.line_program.clone() else {
        return;
    };
    let mut rows = program.rows();
    let mut prev: Option<(u64, String, u32, u32)> = None;
    loop {
        let (header, row) = match rows.next_row() {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(err) => {
                debug!("line table walk stopped early: {err}");
                break;
            }
        };

        if let Some((prev_addr, ref prev_file, prev_line, prev_col)) = prev {
            if prev_addr != 0 && prev_addr < row.address() && in_scope(prev_file, scope) {
                builder.add_line_range(
                    prev_file,
                    prev_line,
                    prev_col,
                    Interval::new(prev_addr, row.address()).shifted(load_offset),
                );
            }
        }

        if row.end_sequence() {
            prev = None;
            continue;
        }

        let file = row
            .file(header)
            .and_then(|file| file_entry_path(dwarf, unit, header, file))
            .unwrap_or_default();
        let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
        let col = match row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(c) => c.get() as u32,
        };
        prev = Some((row.address(), file, line, col));
    }
}

/// Look up an attribute on the entry itself, then through its abstract
/// origin and specification, the way debuggers resolve split definitions.
fn find_attr<R: gimli::Reader>(
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
    name: gimli::DwAt,
    depth: u32,
) -> Option<AttributeValue<R>> {
    if let Ok(Some(value)) = entry.attr_value(name) {
        return Some(value);
    }
    if depth == 0 {
        return None;
    }
    for link in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        if let Ok(Some(AttributeValue::UnitRef(offset))) = entry.attr_value(link) {
            if let Ok(target) = unit.entry(offset) {
                if let Some(value) = find_attr(unit, &target, name, depth - 1) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn attr_string<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
    name: gimli::DwAt,
) -> Option<String> {
    let value = find_attr(unit, entry, name, 4)?;
    let raw = dwarf.attr_string(unit, value).ok()?;
    raw.to_string_lossy().ok().map(|s| s.into_owned())
}

fn attr_address<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    value: AttributeValue<R>,
) -> Option<u64> {
    match value {
        AttributeValue::Addr(addr) => Some(addr),
        AttributeValue::DebugAddrIndex(index) => dwarf.address(unit, index).ok(),
        _ => None,
    }
}

/// The `[low_pc, high_pc)` extent of a DIE, accepting both encodings of
/// high_pc (absolute address or offset from low_pc).
fn pc_range<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
) -> Option<Interval> {
    let low_value = find_attr(unit, entry, gimli::DW_AT_low_pc, 4)?;
    let low = attr_address(dwarf, unit, low_value)?;
    let high_value = find_attr(unit, entry, gimli::DW_AT_high_pc, 4)?;
    let high = match attr_address(dwarf, unit, high_value.clone()) {
        Some(addr) => addr,
        None => low + high_value.udata_value()?,
    };
    if low == 0 || high <= low {
        return None;
    }
    Some(Interval::new(low, high))
}

fn decl_file_path<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
    name: gimli::DwAt,
) -> Option<String> {
    let index = find_attr(unit, entry, name, 4)?;
    let index = match index {
        AttributeValue::FileIndex(i) => i,
        other => other.udata_value()?,
    };
    let header = unit.line_program.as_ref()?.header();
    let file = header.file(index)?;
    file_entry_path(dwarf, unit, header, file)
}

/// Assemble a file entry's path: compilation directory, then the entry's
/// directory, then its name, each later absolute component overriding the
/// accumulated prefix.
fn file_entry_path<R: gimli::Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    header: &gimli::LineProgramHeader<R>,
    file: &gimli::FileEntry<R>,
) -> Option<String> {
    let mut path = String::new();
    if let Some(comp_dir) = &unit.comp_dir {
        if let Ok(dir) = comp_dir.to_string_lossy() {
            join_path(&mut path, &dir);
        }
    }
    if let Some(dir_value) = file.directory(header) {
        if let Ok(dir) = dwarf.attr_string(unit, dir_value) {
            if let Ok(dir) = dir.to_string_lossy() {
                join_path(&mut path, &dir);
            }
        }
    }
    let name = dwarf.attr_string(unit, file.path_name()).ok()?;
    let name = name.to_string_lossy().ok()?;
    join_path(&mut path, &name);
    if path.is_empty() {
        None
    } else {
        Some(canonicalize_path(&path))
    }
}

fn join_path(base: &mut String, part: &str) {
    if part.is_empty() {
        return;
    }
    if part.starts_with('/') {
        base.clear();
        base.push_str(part);
        return;
    }
    if !base.is_empty() && !base.ends_with('/') {
        base.push('/');
    }
    base.push_str(part);
}

#[cfg(test)]
mod tests {
    use super::join_path;

    #[test]
    fn paths_assemble_left_to_right() {
        let mut path = String::new();
        join_path(&mut path, "/home/dev/project");
        join_path(&mut path, "src");
        join_path(&mut path, "main.cc");
        assert_eq!(path, "/home/dev/project/src/main.cc");
    }

    #[test]
    fn absolute_components_restart_the_path() {
        let mut path = String::new();
        join_path(&mut path, "/home/dev/project");
        join_path(&mut path, "/usr/include");
        join_path(&mut path, "stdio.h");
        assert_eq!(path, "/usr/include/stdio.h");
    }

    #[test]
    fn empty_components_are_ignored() {
        let mut path = String::from("/a");
        join_path(&mut path, "");
        assert_eq!(path, "/a");
    }
}
