//! Path helpers shared by both ends of a transfer.
//!
//! Home and working directories are always passed in explicitly.

use std::path::{Component, Path, PathBuf};

/// Expand a leading `~` against `home`.
pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Expand `~` and make the result absolute, relative paths resolving against `base`.
pub fn resolve(path: &str, home: &Path, base: &Path) -> PathBuf {
    let expanded = expand_tilde(path, home);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    normalize_path(&absolute)
}

/// Components of `path` with `.` dropped and `..` applied lexically.
///
/// `..` never climbs above the root or the start of a relative path. The
/// components borrow from `path`.
fn lexical_components(path: &Path) -> Vec<Component<'_>> {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    parts
}

/// Lexical cleanup of `path`; the filesystem is never consulted.
pub fn normalize_path(path: &Path) -> PathBuf {
    lexical_components(path).into_iter().collect()
}

/// `~/`-relative form of `path` when it lies under `home`.
pub fn home_relative(path: &Path, home: &Path) -> String {
    match path.strip_prefix(home) {
        Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
        Ok(rest) => format!("~/{}", to_wire(rest)),
        Err(_) => to_wire(path),
    }
}

/// Forward-slash representation used on the wire.
pub fn to_wire(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    let joined = parts.join("/");
    if path.has_root() {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Join a remote base and a relative wire path.
pub fn join_wire(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        base.trim_end_matches('/').to_string()
    } else if base.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    }
}

/// Path of `target` as seen from the directory `from_dir`.
pub fn relative_path(target: &Path, from_dir: &Path) -> PathBuf {
    let target = lexical_components(target);
    let from = lexical_components(from_dir);
    let common = target
        .iter()
        .zip(from.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for c in &target[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/u");
        assert_eq!(expand_tilde("~", home), PathBuf::from("/home/u"));
        assert_eq!(expand_tilde("~/a/b", home), PathBuf::from("/home/u/a/b"));
        assert_eq!(expand_tilde("/etc/x", home), PathBuf::from("/etc/x"));
        assert_eq!(expand_tilde("~other", home), PathBuf::from("~other"));
    }

    #[test]
    fn test_resolve_relative_against_base() {
        let home = Path::new("/home/u");
        assert_eq!(
            resolve("docs/../x.txt", home, home),
            PathBuf::from("/home/u/x.txt")
        );
        assert_eq!(resolve("~/y", home, Path::new("/tmp")), PathBuf::from("/home/u/y"));
    }

    #[test]
    fn test_home_relative() {
        let home = Path::new("/home/u");
        assert_eq!(home_relative(Path::new("/home/u/a/b"), home), "~/a/b");
        assert_eq!(home_relative(Path::new("/home/u"), home), "~");
        assert_eq!(home_relative(Path::new("/srv/x"), home), "/srv/x");
    }

    #[test]
    fn test_join_wire() {
        assert_eq!(join_wire("~/dest/", "a/b"), "~/dest/a/b");
        assert_eq!(join_wire("~/dest", ""), "~/dest");
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/d/a/file"), Path::new("/d/b/c")),
            PathBuf::from("../../a/file")
        );
        assert_eq!(
            relative_path(Path::new("/d/a/file"), Path::new("/d/a")),
            PathBuf::from("file")
        );
        assert_eq!(
            relative_path(Path::new("/d/./a/../b/x"), Path::new("/d/c/../b")),
            PathBuf::from("x")
        );
        assert_eq!(relative_path(Path::new("/d"), Path::new("/d/")), PathBuf::from("."));
    }

    #[test]
    fn test_normalize_stops_at_root() {
        assert_eq!(normalize_path(Path::new("/../a/./b/..")), PathBuf::from("/a"));
        assert_eq!(normalize_path(Path::new("../x")), PathBuf::from("x"));
    }
}
