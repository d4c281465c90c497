//! Sandbox path resolution and content limits at the filesystem boundary.
//!
//! Every file the engine opens goes through [`resolve`] first. The lexical
//! checks (`normalize`, `validate_extension`, `validate_size`,
//! `sanitize_filename`) are pure and never touch the disk.
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const MAX_FILENAME_BYTES: usize = 255;

static FORBIDDEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"|?*\x00-\x1F\x7F]"#).expect("valid forbidden-char regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Target must exist and be a regular file.
    Read,
    /// Target may be missing; its nearest existing ancestor must sit inside
    /// the sandbox.
    Create,
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("path traversal rejected: {0}")]
    Traversal(String),
    #[error("absolute path rejected: {0}")]
    Absolute(String),
    #[error("forbidden character {ch:?} in path")]
    ForbiddenCharacter { ch: char },
    #[error("path escapes sandbox root: {0}")]
    OutsideRoot(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("not a regular file: {0}")]
    NotAFile(String),
    #[error("extension {extension:?} is not allowed")]
    ExtensionNotAllowed { extension: String },
    #[error("file size {size} exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error("I/O error resolving {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl PathError {
    /// Rejections that indicate an attempt to reach outside the sandbox.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            PathError::Traversal(_)
                | PathError::Absolute(_)
                | PathError::ForbiddenCharacter { .. }
                | PathError::OutsideRoot(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PathError::NotFound(_))
    }
}

/// Lexically normalize a user-supplied relative path. Accepts `/` and `\`
/// as separators, drops empty and `.` segments.
pub fn normalize(user_path: &str) -> Result<PathBuf, PathError> {
    if let Some(m) = FORBIDDEN.find(user_path) {
        let ch = m.as_str().chars().next().unwrap_or('\0');
        return Err(PathError::ForbiddenCharacter { ch });
    }
    if user_path.starts_with('/') || user_path.starts_with('\\') {
        return Err(PathError::Absolute(user_path.to_string()));
    }

    let mut out = PathBuf::new();
    for segment in user_path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(user_path.to_string())),
            s => out.push(s),
        }
    }
    // Platform prefixes (drive letters, UNC) survive the split above.
    if out.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(PathError::Absolute(user_path.to_string()));
    }
    if out.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Resolve `user_path` against `root`, returning an absolute path that has
/// the canonical root as an ancestor.
pub fn resolve(root: &Path, user_path: &str, access: Access) -> Result<PathBuf, PathError> {
    let res = resolve_inner(root, user_path, access);
    if let Err(err) = &res {
        if err.is_security_violation() {
            warn!(
                target: "security",
                root = %root.display(),
                path = user_path,
                reason = %err,
                "rejected path outside sandbox"
            );
        }
    }
    res
}

fn resolve_inner(root: &Path, user_path: &str, access: Access) -> Result<PathBuf, PathError> {
    let relative = normalize(user_path)?;
    let canonical_root = root.canonicalize().map_err(|source| PathError::Io {
        path: root.display().to_string(),
        source,
    })?;
    let joined = canonical_root.join(&relative);
    if !joined.starts_with(&canonical_root) {
        return Err(PathError::OutsideRoot(user_path.to_string()));
    }

    match access {
        Access::Read => {
            let target = match joined.canonicalize() {
                Ok(p) => p,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(PathError::NotFound(user_path.to_string()))
                }
                Err(source) => {
                    return Err(PathError::Io {
                        path: user_path.to_string(),
                        source,
                    })
                }
            };
            // Symlinks may point anywhere; the canonical target decides.
            if !target.starts_with(&canonical_root) {
                return Err(PathError::OutsideRoot(user_path.to_string()));
            }
            let meta = std::fs::metadata(&target).map_err(|source| PathError::Io {
                path: user_path.to_string(),
                source,
            })?;
            if !meta.is_file() {
                return Err(PathError::NotAFile(user_path.to_string()));
            }
            Ok(target)
        }
        Access::Create => {
            if joined.is_dir() {
                return Err(PathError::NotAFile(user_path.to_string()));
            }
            let mut ancestor = joined.parent();
            while let Some(dir) = ancestor {
                if dir.exists() {
                    let canonical = dir.canonicalize().map_err(|source| PathError::Io {
                        path: dir.display().to_string(),
                        source,
                    })?;
                    if !canonical.starts_with(&canonical_root) {
                        return Err(PathError::OutsideRoot(user_path.to_string()));
                    }
                    break;
                }
                ancestor = dir.parent();
            }
            Ok(joined)
        }
    }
}

/// Case-insensitive extension check. An empty allow-list permits everything.
pub fn validate_extension<S: AsRef<str>>(name: &str, allowed: &[S]) -> Result<(), PathError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if allowed
        .iter()
        .any(|a| a.as_ref().trim_start_matches('.').eq_ignore_ascii_case(&extension))
    {
        Ok(())
    } else {
        Err(PathError::ExtensionNotAllowed { extension })
    }
}

pub fn validate_size(bytes: u64, max_bytes: u64) -> Result<(), PathError> {
    if bytes > max_bytes {
        return Err(PathError::TooLarge {
            size: bytes,
            max: max_bytes,
        });
    }
    Ok(())
}

/// Strip separators and forbidden characters, then cap the name at 255
/// bytes while keeping the extension.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\')
        .collect();
    let cleaned = FORBIDDEN.replace_all(&cleaned, "");
    let cleaned = cleaned
        .trim()
        .trim_start_matches('.')
        .trim_end_matches(['.', ' ']);
    if cleaned.is_empty() {
        return "unnamed".to_string();
    }
    if cleaned.len() <= MAX_FILENAME_BYTES {
        return cleaned.to_string();
    }

    match cleaned.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() + 1 < MAX_FILENAME_BYTES / 2 => {
            let budget = MAX_FILENAME_BYTES - ext.len() - 1;
            format!("{}.{}", truncate_to_boundary(stem, budget), ext)
        }
        _ => truncate_to_boundary(cleaned, MAX_FILENAME_BYTES).to_string(),
    }
}

fn truncate_to_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn normalize_rejects_traversal_and_absolute() {
        assert!(matches!(normalize("../../etc/passwd"), Err(PathError::Traversal(_))));
        assert!(matches!(normalize("pages/../../x.json"), Err(PathError::Traversal(_))));
        assert!(matches!(normalize("pages\\..\\x.json"), Err(PathError::Traversal(_))));
        assert!(matches!(normalize("/etc/passwd"), Err(PathError::Absolute(_))));
        assert!(matches!(normalize("\\share\\x"), Err(PathError::Absolute(_))));
        assert!(matches!(normalize("C:\\x.json"), Err(PathError::ForbiddenCharacter { ch: ':' })));
        assert!(matches!(normalize(""), Err(PathError::Empty)));
        assert!(matches!(normalize("./."), Err(PathError::Empty)));
    }

    #[test]
    fn normalize_rejects_control_and_forbidden_chars() {
        for bad in ["pages/a\0.json", "pages/a\n.json", "a<b.json", "a|b", "what?.json", "star*.json", "q\"uote"] {
            let err = normalize(bad).unwrap_err();
            assert!(err.is_security_violation(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        let p = normalize("./pages//by-page/./x.json").unwrap();
        assert_eq!(p, PathBuf::from("pages/by-page/x.json"));
    }

    #[test]
    fn resolve_accepts_file_inside_root() {
        let td = tempdir().unwrap();
        fs::create_dir_all(td.path().join("pages")).unwrap();
        fs::write(td.path().join("pages/valid.json"), "{}").unwrap();

        let resolved = resolve(td.path(), "pages/valid.json", Access::Read).unwrap();
        let root = td.path().canonicalize().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.starts_with(&root));
        assert!(resolved.ancestors().any(|a| a == root));
    }

    #[test]
    fn resolve_rejects_traversal_before_io() {
        let td = tempdir().unwrap();
        let err = resolve(td.path(), "../../etc/passwd", Access::Read).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn resolve_read_requires_existing_regular_file() {
        let td = tempdir().unwrap();
        fs::create_dir_all(td.path().join("pages")).unwrap();
        assert!(resolve(td.path(), "pages/missing.json", Access::Read)
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            resolve(td.path(), "pages", Access::Read),
            Err(PathError::NotAFile(_))
        ));
    }

    #[test]
    fn resolve_create_allows_missing_target() {
        let td = tempdir().unwrap();
        let p = resolve(td.path(), "pages/new/doc.json", Access::Create).unwrap();
        assert!(p.starts_with(td.path().canonicalize().unwrap()));
        assert!(p.ends_with("pages/new/doc.json"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.json"), "{}").unwrap();
        let td = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), td.path().join("pages")).unwrap();

        let err = resolve(td.path(), "pages/secret.json", Access::Read).unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot(_)));
        let err = resolve(td.path(), "pages/new.json", Access::Create).unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot(_)));
    }

    #[test]
    fn extension_and_size_checks() {
        assert!(validate_extension("a.JSON", &["json"]).is_ok());
        assert!(validate_extension("a.postman_collection.json", &[".json"]).is_ok());
        assert!(matches!(
            validate_extension("a.exe", &["json"]),
            Err(PathError::ExtensionNotAllowed { .. })
        ));
        assert!(validate_extension("noext", &["json"]).is_err());
        assert!(validate_extension("anything.bin", &[] as &[&str]).is_ok());

        assert!(validate_size(10, 10).is_ok());
        assert!(matches!(validate_size(11, 10), Err(PathError::TooLarge { size: 11, max: 10 })));
    }

    #[test]
    fn sanitize_strips_separators_and_forbidden() {
        assert_eq!(sanitize_filename("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("a<b>c:d|e?.json"), "abcde.json");
        assert_eq!(sanitize_filename("tab\there.json"), "tabhere.json");
        assert_eq!(sanitize_filename("..."), "unnamed");
        assert_eq!(sanitize_filename("  report.json  "), "report.json");
    }

    #[test]
    fn sanitize_truncates_preserving_extension() {
        let long = format!("{}.json", "x".repeat(400));
        let out = sanitize_filename(&long);
        assert_eq!(out.len(), MAX_FILENAME_BYTES);
        assert!(out.ends_with(".json"));

        let multibyte = format!("{}.json", "é".repeat(200));
        let out = sanitize_filename(&multibyte);
        assert!(out.len() <= MAX_FILENAME_BYTES);
        assert!(out.ends_with(".json"));
    }
}
