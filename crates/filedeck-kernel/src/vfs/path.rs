//! Helpers for `/`-rooted backend ids.

use super::error::{VfsError, VfsResult};
use super::types::ROOT_ID;

/// Join a directory id and a child name.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent id, `None` for the root.
pub fn parent(id: &str) -> Option<String> {
    let trimmed = id.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) | None => Some(ROOT_ID.to_string()),
        Some(i) => Some(trimmed[..i].to_string()),
    }
}

/// Last component of an id (empty for the root).
pub fn basename(id: &str) -> &str {
    let trimmed = id.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Normalize an id: leading `/`, no empty, `.` or `..` components.
///
/// `..` never climbs above the root.
pub fn normalize(id: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in id.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Reject names that would address anything other than a direct child.
pub fn validate_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(VfsError::invalid_path(format!("invalid entry name: {name:?}")));
    }
    Ok(())
}

/// Relative path of `id` under `root` (both normalized), `None` if outside.
pub fn relative_to<'a>(id: &'a str, root: &str) -> Option<&'a str> {
    if root == ROOT_ID {
        return Some(id.trim_start_matches('/'));
    }
    let rest = id.strip_prefix(root)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// Split a name into stem and extension (extension includes the dot).
pub fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

/// Replace (or append) the extension of a name.
pub fn replace_ext(name: &str, ext: &str) -> String {
    let (stem, _) = split_ext(name);
    if ext.is_empty() || ext.starts_with('.') {
        format!("{stem}{ext}")
    } else {
        format!("{stem}.{ext}")
    }
}
