//! Source-scope filtering: `%`-wildcard patterns matched against
//! canonicalized absolute paths. A file is in scope iff any pattern matches.

/// Greedy wildcard match; `%` swallows any run of characters.
pub fn wildcard_match(subject: &str, pattern: &str) -> bool {
    match_bytes(subject.as_bytes(), pattern.as_bytes())
}

fn match_bytes(subject: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => subject.is_empty(),
        Some(b'%') => {
            // longest match first
            for split in (0..=subject.len()).rev() {
                if match_bytes(&subject[split..], &pattern[1..]) {
                    return true;
                }
            }
            false
        }
        Some(&ch) => match subject.first() {
            Some(&first) if first == ch => match_bytes(&subject[1..], &pattern[1..]),
            _ => false,
        },
    }
}

/// Resolve a path to absolute form and fold away `.` and `..` segments,
/// purely textually.
pub fn canonicalize_path(path: &str) -> String {
    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{cwd}/{path}")
    };

    let mut reduced: Vec<&str> = Vec::new();
    for part in absolute.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                reduced.pop();
            }
            other => reduced.push(other),
        }
    }

    let mut result = String::new();
    for part in reduced {
        result.push('/');
        result.push_str(part);
    }
    result
}

pub fn in_scope(name: &str, scope: &[String]) -> bool {
    if name.is_empty() {
        return false;
    }
    let normalized = canonicalize_path(name);
    scope
        .iter()
        .any(|pattern| wildcard_match(&normalized, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_swallow_arbitrary_runs() {
        assert!(wildcard_match("/src/main.rs", "%"));
        assert!(wildcard_match("/src/main.rs", "%/main.rs"));
        assert!(wildcard_match("/src/main.rs", "/src/%.rs"));
        assert!(wildcard_match("/src/main.rs", "%src%"));
        assert!(!wildcard_match("/src/main.rs", "%.cc"));
        assert!(!wildcard_match("/src/main.rs", "/lib/%"));
    }

    #[test]
    fn literal_matching_needs_the_whole_subject() {
        assert!(wildcard_match("abc", "abc"));
        assert!(!wildcard_match("abc", "ab"));
        assert!(!wildcard_match("ab", "abc"));
        assert!(wildcard_match("", ""));
        assert!(wildcard_match("", "%"));
    }

    #[test]
    fn canonicalization_folds_dots() {
        assert_eq!(canonicalize_path("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(canonicalize_path("/a//b/"), "/a/b");
        assert_eq!(canonicalize_path("/.."), "");
    }

    #[test]
    fn relative_paths_are_anchored_to_the_cwd() {
        let canonical = canonicalize_path("src/lib.rs");
        assert!(canonical.starts_with('/'));
        assert!(canonical.ends_with("/src/lib.rs"));
    }

    #[test]
    fn scope_is_any_pattern() {
        let scope = vec!["%/include/%".to_string(), "%.rs".to_string()];
        assert!(in_scope("/x/y/z.rs", &scope));
        assert!(in_scope("/usr/include/stdio.h", &scope));
        assert!(!in_scope("/x/y/z.cc", &scope));
        assert!(!in_scope("", &scope));
    }
}
