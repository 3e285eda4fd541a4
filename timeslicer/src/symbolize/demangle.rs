//! Best-effort demangling of ELF symbol names. Tries the Rust scheme, then
//! the Itanium C++ ABI, then falls back to the raw name.

pub fn demangle_any(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{demangled:#}");
    }

    if name.starts_with('_') {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle_with_options(&options) {
                return demangled;
            }
        }
    }

    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::demangle_any;

    #[test]
    fn cpp_demangling() {
        assert_eq!(
            demangle_any("_ZNK8KxVectorI16KxfArcFileRecordjEixEj"),
            "KxVector<KxfArcFileRecord, unsigned int>::operator[](unsigned int) const"
        );
    }

    #[test]
    fn rust_demangling() {
        assert_eq!(
            demangle_any("_RNvMsr_NtCs3ssYzQotkvD_3std4pathNtB5_7PathBuf3newCs15kBYyAo9fc_7mycrate"),
            "<std::path::PathBuf>::new"
        );
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(demangle_any("main"), "main");
        assert_eq!(demangle_any("foo_bar"), "foo_bar");
    }
}
