//! Container and package document parsers
//!
//! `META-INF/container.xml` names the package document; the package
//! document (content.opf) carries the bibliographic metadata, the manifest
//! and the spine. Both are parsed incrementally through [`XmlStream`].
//! Spine entries are pushed to a [`SpineSink`] the moment their `itemref`
//! is seen, so the spine never has to be held by the parser.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{ParseError, StorageError};
use crate::path;
use crate::xml::{Element, MarkupHandler, XmlLimits, XmlStream};

/// Archive path of the container descriptor
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";
const CSS_MEDIA_TYPE: &str = "text/css";

/// Bibliographic metadata persisted in the index
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreMetadata {
    /// Book title
    pub title: String,
    /// Author name
    pub author: String,
    /// Language code (e.g. "en")
    pub language: String,
    /// Archive path of the cover image, empty if the package names none
    pub cover_item_href: String,
    /// Archive path of the "start reading here" document, possibly empty
    pub text_reference_href: String,
}

/// Receiver of spine entries, in reading order
pub trait SpineSink {
    /// Accept the resolved archive path of the next spine entry.
    fn push_spine_href(&mut self, href: &str) -> Result<(), StorageError>;
}

impl SpineSink for Vec<String> {
    fn push_spine_href(&mut self, href: &str) -> Result<(), StorageError> {
        self.push(href.to_string());
        Ok(())
    }
}

/// Extracts the package document path from `container.xml`
#[derive(Debug, Default)]
pub struct ContainerHandler {
    root_path: Option<String>,
}

impl ContainerHandler {
    /// Normalised archive path of the first `rootfile`
    pub fn root_path(&self) -> Option<&str> {
        self.root_path.as_deref()
    }
}

impl MarkupHandler for ContainerHandler {
    fn start(&mut self, element: &Element, _depth: usize) -> Result<(), ParseError> {
        if self.root_path.is_none() && element.local_name() == "rootfile" {
            if let Some(full_path) = element.attr_local("full-path") {
                let normalised = path::normalise(full_path);
                if !normalised.is_empty() {
                    self.root_path = Some(normalised);
                }
            }
        }
        Ok(())
    }
}

/// Streaming parser for `container.xml`
pub type ContainerParser = XmlStream<ContainerHandler>;

/// Create a container parser
pub fn container_parser(limits: XmlLimits) -> ContainerParser {
    XmlStream::with_limits(ContainerHandler::default(), limits)
}

/// Everything the package document contributes besides the spine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpfSummary {
    /// Bibliographic metadata
    pub metadata: CoreMetadata,
    /// Directory of the package document, with trailing `/`
    pub base_dir: String,
    /// Archive path of the EPUB 3 navigation document
    pub nav_href: Option<String>,
    /// Archive path of the EPUB 2 NCX
    pub ncx_href: Option<String>,
    /// Stylesheets in manifest order
    pub css_files: Vec<String>,
    /// Number of spine entries pushed to the sink
    pub spine_count: usize,
}

#[derive(Clone, Debug)]
struct ManifestItem {
    href: String,
    media_type: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Other,
    Metadata,
    Manifest,
    Spine,
    Guide,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Title,
    Creator,
    Language,
}

/// Extracts metadata and manifest facts from the package document
pub struct OpfHandler<'s> {
    sink: &'s mut dyn SpineSink,
    summary: OpfSummary,
    section: Section,
    capture: Option<Field>,
    text: String,
    manifest: BTreeMap<String, ManifestItem>,
    cover_image_href: Option<String>,
    cover_meta_id: Option<String>,
    spine_toc_id: Option<String>,
    max_manifest_items: usize,
}

impl<'s> OpfHandler<'s> {
    /// Create a handler for the package document at `opf_path`
    pub fn new(opf_path: &str, sink: &'s mut dyn SpineSink) -> Self {
        let summary = OpfSummary {
            base_dir: path::base_dir(opf_path).to_string(),
            ..OpfSummary::default()
        };
        Self {
            sink,
            summary,
            section: Section::Other,
            capture: None,
            text: String::new(),
            manifest: BTreeMap::new(),
            cover_image_href: None,
            cover_meta_id: None,
            spine_toc_id: None,
            max_manifest_items: 4096,
        }
    }

    /// Directory every manifest href is resolved against
    pub fn base_dir(&self) -> &str {
        &self.summary.base_dir
    }

    /// Number of spine entries pushed so far
    pub fn spine_count(&self) -> usize {
        self.summary.spine_count
    }

    /// Finish extraction, resolving cover and NCX references that go
    /// through manifest ids.
    pub fn into_summary(self) -> OpfSummary {
        let mut summary = self.summary;

        let cover = self.cover_image_href.or_else(|| {
            self.cover_meta_id
                .as_ref()
                .and_then(|id| self.manifest.get(id))
                .map(|item| item.href.clone())
        });
        if let Some(cover) = cover {
            summary.metadata.cover_item_href = cover;
        }

        if summary.ncx_href.is_none() {
            summary.ncx_href = self
                .spine_toc_id
                .as_ref()
                .and_then(|id| self.manifest.get(id))
                .map(|item| item.href.clone());
        }

        summary
    }

    fn manifest_item(&mut self, element: &Element) {
        let (Some(id), Some(href)) = (element.attr("id"), element.attr("href")) else {
            return;
        };
        if self.manifest.len() >= self.max_manifest_items {
            log::warn!("[OPF] Manifest exceeds {} items, ignoring {}", self.max_manifest_items, id);
            return;
        }

        let resolved = path::resolve_path(&self.summary.base_dir, href);
        let media_type = element.attr("media-type").unwrap_or_default();
        let properties = element.attr("properties").unwrap_or_default();

        for property in properties.split_ascii_whitespace() {
            match property {
                "cover-image" if self.cover_image_href.is_none() => {
                    self.cover_image_href = Some(resolved.clone());
                }
                "nav" if self.summary.nav_href.is_none() => {
                    self.summary.nav_href = Some(resolved.clone());
                }
                _ => {}
            }
        }
        if media_type == NCX_MEDIA_TYPE && self.summary.ncx_href.is_none() {
            self.summary.ncx_href = Some(resolved.clone());
        }
        if media_type == CSS_MEDIA_TYPE {
            self.summary.css_files.push(resolved.clone());
        }

        self.manifest.insert(
            id.to_string(),
            ManifestItem {
                href: resolved,
                media_type: media_type.to_string(),
            },
        );
    }

    fn spine_item(&mut self, element: &Element) -> Result<(), ParseError> {
        let Some(idref) = element.attr("idref") else {
            return Ok(());
        };
        match self.manifest.get(idref) {
            Some(item) => {
                if item.media_type == NCX_MEDIA_TYPE {
                    log::debug!("[OPF] Skipping NCX listed in spine: {}", item.href);
                    return Ok(());
                }
                self.sink.push_spine_href(&item.href)?;
                self.summary.spine_count += 1;
            }
            None => log::warn!("[OPF] Spine itemref '{}' not in manifest", idref),
        }
        Ok(())
    }

    fn guide_reference(&mut self, element: &Element) {
        if !self.summary.metadata.text_reference_href.is_empty() {
            return;
        }
        let is_start = element
            .attr("type")
            .is_some_and(|t| matches!(t.to_ascii_lowercase().as_str(), "text" | "start" | "bodymatter"));
        if let (true, Some(href)) = (is_start, element.attr("href")) {
            self.summary.metadata.text_reference_href =
                path::resolve_path(&self.summary.base_dir, href);
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

impl MarkupHandler for OpfHandler<'_> {
    fn start(&mut self, element: &Element, _depth: usize) -> Result<(), ParseError> {
        let name = element.local_name();
        match name {
            "metadata" => self.section = Section::Metadata,
            "manifest" => self.section = Section::Manifest,
            "spine" => {
                self.section = Section::Spine;
                self.spine_toc_id = element.attr("toc").map(|id| id.to_string());
            }
            "guide" => self.section = Section::Guide,
            _ => {}
        }

        match (self.section, name) {
            (Section::Metadata, "title") => self.capture = Some(Field::Title),
            (Section::Metadata, "creator") => self.capture = Some(Field::Creator),
            (Section::Metadata, "language") => self.capture = Some(Field::Language),
            (Section::Metadata, "meta") => {
                if element.attr("name") == Some("cover") {
                    if let Some(content) = element.attr("content") {
                        self.cover_meta_id = Some(content.to_string());
                    }
                }
            }
            (Section::Manifest, "item") => self.manifest_item(element),
            (Section::Spine, "itemref") => self.spine_item(element)?,
            (Section::Guide, "reference") => self.guide_reference(element),
            _ => {}
        }
        if self.capture.is_some() {
            self.text.clear();
        }
        Ok(())
    }

    fn end(&mut self, local_name: &str, _depth: usize) -> Result<(), ParseError> {
        match local_name {
            "metadata" | "manifest" | "spine" | "guide" => self.section = Section::Other,
            "title" | "creator" | "language" => {
                if let Some(field) = self.capture.take() {
                    let value = collapse_whitespace(&self.text);
                    let metadata = &mut self.summary.metadata;
                    let slot = match field {
                        Field::Title => &mut metadata.title,
                        Field::Creator => &mut metadata.author,
                        Field::Language => &mut metadata.language,
                    };
                    if slot.is_empty() {
                        *slot = value;
                    }
                }
                self.text.clear();
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), ParseError> {
        if self.capture.is_some() {
            self.text.push_str(text);
        }
        Ok(())
    }
}

/// Streaming parser for the package document
pub type ContentOpfParser<'s> = XmlStream<OpfHandler<'s>>;

/// Create a package document parser pushing spine entries into `sink`
pub fn content_opf_parser<'s>(
    opf_path: &str,
    sink: &'s mut dyn SpineSink,
    limits: XmlLimits,
) -> ContentOpfParser<'s> {
    XmlStream::with_limits(OpfHandler::new(opf_path, sink), limits)
}

pub(crate) fn normalise_title(text: &str) -> String {
    collapse_whitespace(text)
}
