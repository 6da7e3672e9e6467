//! Path canonicalization and allowlist containment.
//!
//! Containment is always decided on canonical forms: the candidate and every
//! allowlist entry are resolved (symlinks followed) before comparison, and
//! the resolved realpath — never the caller's spelling — is what reaches the
//! executor. A symlink swapped in after validation is caught on the next
//! canonicalization.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use super::error::PolicyError;

/// Convert caller input to a platform path. On Windows, forward slashes
/// become backslashes and rooted drive-letterless paths default to `C:`.
pub fn normalize_input(input: &str) -> PathBuf {
    #[cfg(windows)]
    {
        let converted = input.replace('/', "\\");
        if converted.starts_with('\\') && !converted.starts_with("\\\\") {
            return PathBuf::from(format!("C:{converted}"));
        }
        PathBuf::from(converted)
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(input)
    }
}

/// Lexically collapse `.` and `..` components. `..` at the root is dropped.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Strip the Windows verbatim prefix (`\\?\`) that `fs::canonicalize`
/// produces, so canonical forms stay comparable with config entries.
fn strip_verbatim(path: PathBuf) -> PathBuf {
    #[cfg(windows)]
    {
        let s = path.to_string_lossy();
        if let Some(stripped) = s.strip_prefix(r"\\?\UNC\") {
            return PathBuf::from(format!(r"\\{stripped}"));
        }
        if let Some(stripped) = s.strip_prefix(r"\\?\") {
            return PathBuf::from(stripped.to_string());
        }
        path
    }
    #[cfg(not(windows))]
    {
        path
    }
}

fn to_absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}

/// Resolve a path to its absolute, normalized, symlink-followed form.
///
/// When the path does not exist, the deepest existing ancestor is resolved
/// and the remaining components are appended lexically, so containment can
/// still be checked for paths about to be created.
pub fn canonicalize(path: &Path) -> PathBuf {
    let absolute = lexical_normalize(&to_absolute(path));

    if let Ok(real) = std::fs::canonicalize(&absolute) {
        return strip_verbatim(real);
    }

    let mut tail: Vec<OsString> = Vec::new();
    let mut cursor = absolute.clone();
    loop {
        if let Ok(real) = std::fs::canonicalize(&cursor) {
            let mut out = strip_verbatim(real);
            for name in tail.iter().rev() {
                out.push(name);
            }
            return out;
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                cursor = parent.to_path_buf();
            }
            _ => return absolute,
        }
    }
}

fn components_eq(a: &Component<'_>, b: &Component<'_>) -> bool {
    #[cfg(windows)]
    {
        a.as_os_str()
            .to_string_lossy()
            .eq_ignore_ascii_case(&b.as_os_str().to_string_lossy())
    }
    #[cfg(not(windows))]
    {
        a == b
    }
}

/// Component-wise prefix test. Matching at component boundaries rules out
/// partial suffix matches: `C:\test2\f` is not under `C:\test`.
fn is_under(candidate: &Path, base: &Path) -> bool {
    let base: Vec<Component<'_>> = base.components().collect();
    let mut candidate = candidate.components();
    base.iter()
        .all(|b| matches!(candidate.next(), Some(ref c) if components_eq(b, c)))
}

/// True when `path`, after canonicalization of both sides, equals an
/// allowlist entry or sits strictly below one.
pub fn is_contained(path: &Path, allowed: &[PathBuf]) -> bool {
    let candidate = canonicalize(path);
    allowed
        .iter()
        .any(|entry| is_under(&candidate, &canonicalize(entry)))
}

/// True for inputs the gateway accepts as "absolute": Unix-rooted,
/// drive-letter, UNC, or Windows-rooted (drive-letterless) spellings.
pub fn is_absolute_input(input: &str) -> bool {
    let bytes = input.as_bytes();
    if input.starts_with('/') || input.starts_with('\\') {
        return true;
    }
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Validate a working directory and return the realpath the executor must
/// use. The user-supplied spelling is never returned.
pub fn validate_working_directory(
    input: &str,
    allowed: &[PathBuf],
    restrict: bool,
) -> Result<PathBuf, PolicyError> {
    if !is_absolute_input(input) {
        return Err(PolicyError::WorkingDirNotAbsolute);
    }

    let path = normalize_input(input);
    if !path.is_dir() {
        return Err(PolicyError::WorkingDirMissing);
    }

    let real = canonicalize(&path);
    if restrict && !is_contained(&real, allowed) {
        return Err(PolicyError::WorkingDirNotAllowed);
    }
    Ok(real)
}
