use std::io;
use std::path::{Component, Path};

/// Validate a user-supplied relative path fragment before joining it
/// under a managed directory. Rejects absolute paths, parent traversal
/// and control characters.
pub fn validate_relative_fragment(fragment: &str) -> io::Result<()> {
    if fragment.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty path fragment",
        ));
    }
    if fragment.chars().any(|c| c.is_control()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path fragment contains control characters: {:?}", fragment),
        ));
    }

    let path = Path::new(fragment);
    if path.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("absolute path not allowed: {}", fragment),
        ));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("parent traversal not allowed: {}", fragment),
                ));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid path component in: {}", fragment),
                ));
            }
        }
    }

    Ok(())
}

/// Normalise a folder name coming from remote metadata: backslashes
/// become slashes, surrounding whitespace is dropped. Returns `None`
/// when nothing usable remains.
pub fn normalize_folder_name(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/").trim().to_string();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_simple_names() {
        assert!(validate_relative_fragment("checkpoints").is_ok());
        assert!(validate_relative_fragment("loras/style.safetensors").is_ok());
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(validate_relative_fragment("../etc/passwd").is_err());
        assert!(validate_relative_fragment("a/../../b").is_err());
    }

    #[test]
    fn test_rejects_absolute() {
        assert!(validate_relative_fragment("/etc/passwd").is_err());
    }

    #[test]
    fn test_rejects_empty_and_control() {
        assert!(validate_relative_fragment("   ").is_err());
        assert!(validate_relative_fragment("bad\u{0}name").is_err());
    }

    #[test]
    fn test_normalize_folder_name() {
        assert_eq!(
            normalize_folder_name("  video\\models "),
            Some("video/models".to_string())
        );
        assert_eq!(normalize_folder_name("   "), None);
    }
}
