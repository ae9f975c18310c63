//! Name validation for forks, versions, and published files.
//!
//! All three share one rule: first character in `[A-Za-z0-9_-]`, the rest
//! additionally allowing `.`. This excludes path separators, `.` and `..`
//! components, and hidden files by construction.

/// Whether `s` is a valid fork, version, or artifact file name.
pub fn valid_name(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphanumeric() || first == '_' || first == '-') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::valid_name;

    #[test]
    fn accepts_typical_names() {
        for name in ["1.2.3", "v1_rc-2", "Server_linux-x64.zip", "0", "a"] {
            assert!(valid_name(name), "{name:?} should be valid");
        }
    }

    #[test]
    fn rejects_path_tricks() {
        for name in ["", ".", "..", ".hidden", "a/b", "../x", "a\\b", "a b", "名前"] {
            assert!(!valid_name(name), "{name:?} should be invalid");
        }
    }
}
