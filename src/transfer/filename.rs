//! File name derivation and sanitization for landed files.
//!
//! Remote files are named after the last segment of their URL. Uploaded files
//! keep their client-supplied relative path, component by component, as long
//! as it cannot escape the entry directory.

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::TransferError;

/// Sanitizes one path component for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// File name for a remote URL: the decoded last path segment, or `download.bin`.
///
/// The name depends only on the URL so a restarted transfer finds the partial
/// file it left behind.
pub(crate) fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
        return sanitize_filename(&decoded);
    }
    "download.bin".to_string()
}

/// Converts a client-supplied upload name into a safe path relative to the entry directory.
///
/// Backslashes are treated as separators. Absolute paths and any `..` component
/// are rejected outright rather than rewritten; `.` components are dropped.
///
/// # Errors
///
/// Returns [`TransferError::UnsafePath`] if the name is absolute, traverses
/// upwards, or has no usable component.
pub fn sanitize_relative_path(name: &str) -> Result<PathBuf, TransferError> {
    let unsafe_path = || TransferError::UnsafePath {
        name: name.to_string(),
    };
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || Path::new(&normalized).is_absolute() {
        return Err(unsafe_path());
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(unsafe_path()),
            other => relative.push(sanitize_filename(other)),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    Ok(relative)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.tar"), "file_name.tar");
        assert_eq!(sanitize_filename("file:name.tar"), "file_name.tar");
        assert_eq!(sanitize_filename("file<name>.tar"), "file_name_.tar");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "__");
    }

    #[test]
    fn test_filename_from_url_uses_decoded_last_segment() {
        let url = Url::parse("https://zenodo.org/records/42/files/my%20images.tar.gz?download=1")
            .unwrap();
        assert_eq!(filename_from_url(&url), "my images.tar.gz");
    }

    #[test]
    fn test_filename_from_url_empty_path_falls_back() {
        let url = Url::parse("https://example.org/").unwrap();
        assert_eq!(filename_from_url(&url), "download.bin");
    }

    #[test]
    fn test_filename_from_url_encoded_slash_stays_single_component() {
        let url = Url::parse("https://example.org/a%2F..%2Fb.zip").unwrap();
        let name = filename_from_url(&url);
        assert!(!name.contains('/'));
        assert_eq!(Path::new(&name).components().count(), 1);
    }

    #[test]
    fn test_sanitize_relative_path_keeps_subdirectories() {
        let path = sanitize_relative_path("run1/images/img_0001.cbf").unwrap();
        assert_eq!(path, PathBuf::from("run1/images/img_0001.cbf"));
    }

    #[test]
    fn test_sanitize_relative_path_drops_current_dir_components() {
        let path = sanitize_relative_path("./a/./b.txt").unwrap();
        assert_eq!(path, PathBuf::from("a/b.txt"));
    }

    #[test]
    fn test_sanitize_relative_path_rejects_absolute() {
        assert!(matches!(
            sanitize_relative_path("/etc/passwd"),
            Err(TransferError::UnsafePath { .. })
        ));
        assert!(sanitize_relative_path("\\windows\\system32").is_err());
    }

    #[test]
    fn test_sanitize_relative_path_rejects_parent_traversal() {
        for name in ["../x", "a/../../x", "a\\..\\x", ".."] {
            assert!(sanitize_relative_path(name).is_err(), "{name} accepted");
        }
    }

    #[test]
    fn test_sanitize_relative_path_rejects_empty() {
        assert!(sanitize_relative_path("").is_err());
        assert!(sanitize_relative_path("./").is_err());
    }
}
