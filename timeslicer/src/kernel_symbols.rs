//! Kernel symbol resolution from `/proc/kallsyms`. The map keeps absolute
//! addresses; a kernel-section instruction pointer resolves to the greatest
//! symbol address not exceeding it.

use std::collections::BTreeMap;

use log::warn;

#[derive(Debug, Default)]
pub struct KernelSymbols {
    syms: BTreeMap<u64, String>,
}

impl KernelSymbols {
    /// Read the running kernel's symbol list. An unreadable or redacted
    /// kallsyms (all zero addresses) degrades to an empty map; kernel frames
    /// then render unresolved.
    pub fn from_proc() -> KernelSymbols {
        match std::fs::read("/proc/kallsyms") {
            Ok(data) => KernelSymbols::parse(&data),
            Err(err) => {
                warn!("could not read /proc/kallsyms: {err}");
                KernelSymbols::default()
            }
        }
    }

    pub fn parse(data: &[u8]) -> KernelSymbols {
        let mut syms = BTreeMap::new();
        for (address, name) in KallsymsIter::new(data) {
            if address == 0 {
                continue;
            }
            // strip a trailing "\t[module]" annotation
            let name = match memchr::memchr(b'\t', name) {
                Some(cut) => &name[..cut],
                None => name,
            };
            syms.insert(address, String::from_utf8_lossy(name).into_owned());
        }
        KernelSymbols { syms }
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// The symbol covering `addr`: greatest known address `<= addr`.
    pub fn lookup(&self, addr: u64) -> Option<(u64, &str)> {
        self.syms
            .range(..=addr)
            .next_back()
            .map(|(sym_addr, name)| (*sym_addr, name.as_str()))
    }
}

struct KallsymsIter<'a> {
    remaining: &'a [u8],
}

impl<'a> KallsymsIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        KallsymsIter { remaining: data }
    }
}

impl<'a> Iterator for KallsymsIter<'a> {
    type Item = (u64, &'a [u8]);

    // Line format: <hex address> <space> <type letter> <space> <name> \n
    fn next(&mut self) -> Option<Self::Item> {
        while !self.remaining.is_empty() {
            let line = match memchr::memchr(b'\n', self.remaining) {
                Some(end) => {
                    let line = &self.remaining[..end];
                    self.remaining = &self.remaining[end + 1..];
                    line
                }
                None => std::mem::take(&mut self.remaining),
            };
            if let Some(parsed) = parse_line(line) {
                return Some(parsed);
            }
        }
        None
    }
}

fn parse_line(line: &[u8]) -> Option<(u64, &[u8])> {
    let (rest, address) = hex_prefix(line)?;
    // skip " <letter> "
    let name = rest.get(3..)?;
    if name.is_empty() {
        return None;
    }
    Some((address, name))
}

fn hex_prefix(input: &[u8]) -> Option<(&[u8], u64)> {
    let mut value: u64 = 0;
    let mut digits = 0;
    for byte in input.iter().take(16) {
        match (*byte as char).to_digit(16) {
            Some(digit) => {
                value = (value << 4) | digit as u64;
                digits += 1;
            }
            None => break,
        }
    }
    if digits == 0 {
        return None;
    }
    Some((&input[digits..], value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KALLSYMS: &[u8] = b"\
ffffffffa7e00000 T startup_64
ffffffffa7e00000 T _text
ffffffffa7e00040 T secondary_startup_64
ffffffffa7e00110 t verify_cpu
ffffffffa7e00210 T sev_verify_cbit
ffffffffc0a01000 t tls_get_info_size\t[tls]
";

    #[test]
    fn lookup_finds_the_covering_symbol() {
        let syms = KernelSymbols::parse(KALLSYMS);
        let (addr, name) = syms.lookup(0xffff_ffff_a7e0_0055).unwrap();
        assert_eq!(addr, 0xffff_ffff_a7e0_0040);
        assert_eq!(name, "secondary_startup_64");

        // exact hit
        let (addr, name) = syms.lookup(0xffff_ffff_a7e0_0110).unwrap();
        assert_eq!(addr, 0xffff_ffff_a7e0_0110);
        assert_eq!(name, "verify_cpu");
    }

    #[test]
    fn addresses_below_the_first_symbol_miss() {
        let syms = KernelSymbols::parse(KALLSYMS);
        assert!(syms.lookup(0x1000).is_none());
    }

    #[test]
    fn module_annotations_are_stripped() {
        let syms = KernelSymbols::parse(KALLSYMS);
        let (_, name) = syms.lookup(0xffff_ffff_c0a0_1000).unwrap();
        assert_eq!(name, "tls_get_info_size");
    }

    #[test]
    fn redacted_zero_addresses_are_dropped() {
        let syms = KernelSymbols::parse(b"0000000000000000 A fixed_percpu_data\n");
        assert!(syms.is_empty());
    }

    #[test]
    fn missing_trailing_newline_still_parses() {
        let syms = KernelSymbols::parse(b"ffffffffa7e00000 T _text");
        assert_eq!(syms.lookup(0xffff_ffff_a7e0_0000).unwrap().1, "_text");
    }
}
