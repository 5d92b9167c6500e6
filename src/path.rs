//! Archive path resolution
//!
//! EPUB documents reference each other with relative, possibly
//! percent-encoded hrefs. Everything stored in the index is a normalised
//! archive path: no leading `/`, no `.` or `..` segments, no fragment.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use percent_encoding::percent_decode_str;

/// Normalise an archive path by resolving `.` and `..` segments.
///
/// Leading slashes and repeated separators are dropped. A `..` that would
/// climb above the archive root is discarded.
pub fn normalise(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Directory portion of an archive path, including the trailing `/`.
///
/// Returns an empty string for root-level files.
pub fn base_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..=pos],
        None => "",
    }
}

/// Split an href into its path and fragment (without the `#`).
pub fn split_fragment(href: &str) -> (&str, &str) {
    match href.find('#') {
        Some(pos) => (&href[..pos], &href[pos + 1..]),
        None => (href, ""),
    }
}

/// Resolve `href` relative to `base`, returning the archive path and fragment.
///
/// `base` is a directory as returned by [`base_dir`]. Absolute hrefs
/// (starting with `/`) ignore the base. Percent escapes are decoded.
pub fn resolve_href(base: &str, href: &str) -> (String, String) {
    let (path, fragment) = split_fragment(href.trim());
    let path = percent_decode_str(path).decode_utf8_lossy();
    let fragment = percent_decode_str(fragment).decode_utf8_lossy().into_owned();

    if path.is_empty() {
        return (String::new(), fragment);
    }
    if path.starts_with('/') {
        return (normalise(&path), fragment);
    }

    let mut joined = String::with_capacity(base.len() + path.len());
    joined.push_str(base);
    joined.push_str(&path);
    (normalise(&joined), fragment)
}

/// Resolve `href` relative to `base`, discarding any fragment.
pub fn resolve_path(base: &str, href: &str) -> String {
    resolve_href(base, href).0
}

/// Case-insensitive extension check (`ext` without the dot).
pub fn has_extension(path: &str, ext: &str) -> bool {
    match path.rfind('.') {
        Some(pos) if !path[pos..].contains('/') => path[pos + 1..].eq_ignore_ascii_case(ext),
        _ => false,
    }
}
