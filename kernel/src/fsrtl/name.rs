//! Name Comparison and Parsing Utilities
//!
//! Provides the path operations the relay needs:
//! - Path normalization and validation
//! - Case-folded lookup keys
//! - Path component extraction
//! - Directory containment for change notification

use crate::status::{NtStatus, STATUS_OBJECT_NAME_INVALID};

/// Path separator
pub const PATH_SEPARATOR: char = '\\';

/// Root of a volume
pub const ROOT_PATH: &str = "\\";

/// Characters illegal in any path component
const ILLEGAL_CHARS: &[char] = &['<', '>', '"', '/', '|', '*', '?'];

/// Alternate data stream separator
const STREAM_SEPARATOR: char = ':';

/// Dissect a path into first component and remainder
///
/// # Example
/// `\Directory\SubDir\File.txt` -> (`Directory`, `SubDir\File.txt`)
pub fn fsrtl_dissect_name(path: &str) -> (&str, &str) {
    // Skip leading separator if present
    let path = path.strip_prefix(PATH_SEPARATOR).unwrap_or(path);

    match path.find(PATH_SEPARATOR) {
        Some(sep_pos) => (&path[..sep_pos], &path[sep_pos + 1..]),
        // No more separators - this is the last component
        None => (path, ""),
    }
}

/// Check if a name contains wildcard characters
pub fn fsrtl_does_name_contain_wild_cards(name: &str) -> bool {
    name.chars().any(|c| matches!(c, '*' | '?' | '<' | '>' | '"'))
}

/// Compare two names for equality
pub fn fsrtl_are_names_equal(name1: &str, name2: &str, ignore_case: bool) -> bool {
    if ignore_case {
        name1.chars().flat_map(char::to_uppercase).eq(name2.chars().flat_map(char::to_uppercase))
    } else {
        name1 == name2
    }
}

/// Normalize a volume-relative path
///
/// - empty becomes the root
/// - a missing leading separator is added
/// - a trailing separator is stripped (except on the root)
///
/// Rejected with STATUS_OBJECT_NAME_INVALID: empty components, `.` and
/// `..`, illegal characters, and a stream separator when streams are not
/// allowed.
pub fn fsrtl_normalize_path(path: &str, allow_streams: bool) -> Result<String, NtStatus> {
    let trimmed = path.trim_end_matches(PATH_SEPARATOR);
    if trimmed.is_empty() {
        return Ok(ROOT_PATH.to_string());
    }

    let body = trimmed.strip_prefix(PATH_SEPARATOR).unwrap_or(trimmed);
    let mut normalized = String::with_capacity(body.len() + 1);

    for component in body.split(PATH_SEPARATOR) {
        validate_component(component, allow_streams)?;
        normalized.push(PATH_SEPARATOR);
        normalized.push_str(component);
    }

    Ok(normalized)
}

fn validate_component(component: &str, allow_streams: bool) -> Result<(), NtStatus> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(STATUS_OBJECT_NAME_INVALID);
    }
    if component
        .chars()
        .any(|c| (c as u32) < 0x20 || ILLEGAL_CHARS.contains(&c))
    {
        return Err(STATUS_OBJECT_NAME_INVALID);
    }
    if component.contains(STREAM_SEPARATOR) && !allow_streams {
        return Err(STATUS_OBJECT_NAME_INVALID);
    }
    Ok(())
}

/// Key under which a path is indexed
pub fn fsrtl_path_key(path: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        path.to_string()
    } else {
        path.to_uppercase()
    }
}

/// Parent directory of a normalized path (`\a\b` -> `\a`, `\a` -> `\`)
pub fn fsrtl_parent_directory(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR) {
        Some(0) | None => ROOT_PATH,
        Some(pos) => &path[..pos],
    }
}

/// Last component of a normalized path
pub fn fsrtl_final_component(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Name of `target` relative to `directory`, if it lies inside it
///
/// Without `watch_subtree` only direct children qualify. Both paths must be
/// normalized.
pub fn fsrtl_relative_name<'a>(
    directory: &str,
    target: &'a str,
    watch_subtree: bool,
    ignore_case: bool,
) -> Option<&'a str> {
    if target.len() <= directory.len() || !target.is_char_boundary(directory.len()) {
        return None;
    }
    let (head, rest) = target.split_at(directory.len());
    if !fsrtl_are_names_equal(head, directory, ignore_case) {
        return None;
    }

    let relative = if directory == ROOT_PATH {
        rest
    } else {
        rest.strip_prefix(PATH_SEPARATOR)?
    };

    if relative.is_empty() || (!watch_subtree && relative.contains(PATH_SEPARATOR)) {
        return None;
    }
    Some(relative)
}
