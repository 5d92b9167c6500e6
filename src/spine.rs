//! Spine table and href lookup
//!
//! The spine defines the reading order. Each entry carries the cumulative
//! inflated size of the book up to and including itself, which is what the
//! progress calculation runs on.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

/// A single entry in the reading order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpineEntry {
    /// Normalised archive path of the document
    pub href: String,
    /// Inflated bytes of every entry up to and including this one
    pub cumulative_size: u32,
    /// First table of contents entry targeting this document
    pub toc_index: Option<usize>,
}

/// Sorted `(href, position)` table for O(log n) href lookup
///
/// Duplicate hrefs resolve to their first position.
#[derive(Clone, Debug, Default)]
pub struct HrefTable {
    sorted: Vec<(String, usize)>,
}

impl HrefTable {
    /// Build from hrefs in spine order
    pub fn new<'a>(hrefs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut sorted: Vec<(String, usize)> = hrefs
            .into_iter()
            .enumerate()
            .map(|(i, href)| (String::from(href), i))
            .collect();
        // Stable sort keeps the earliest position first among equal hrefs.
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self { sorted }
    }

    /// Position of the first spine entry with exactly this href
    pub fn position(&self, href: &str) -> Option<usize> {
        let idx = self.sorted.partition_point(|(h, _)| h.as_str() < href);
        match self.sorted.get(idx) {
            Some((h, pos)) if h == href => Some(*pos),
            _ => None,
        }
    }

    /// Number of hrefs in the table
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

/// Running prefix sum of entry sizes, saturating at `u32::MAX`
pub fn cumulative_sizes(sizes: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut total = 0u32;
    sizes
        .into_iter()
        .map(|size| {
            total = total.saturating_add(size);
            total
        })
        .collect()
}
