//! Build and load configuration

use crate::xml::XmlLimits;

/// Streaming and asset parameters for building a book index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexOptions {
    /// Chunk size used to stream `META-INF/container.xml`.
    pub container_chunk: usize,
    /// Chunk size used to stream the package document.
    pub opf_chunk: usize,
    /// Chunk size used to stream the nav document or NCX.
    pub toc_chunk: usize,
    /// Chunk size used when copying images and stylesheets to scratch files.
    pub copy_chunk: usize,
    /// Limits applied to every structural XML parse.
    pub xml_limits: XmlLimits,
    /// Portrait display width used for cover markers.
    pub display_width: u32,
    /// Portrait display height used for cover markers.
    pub display_height: u32,
    /// Thumbnail width as a fraction of its height.
    pub thumb_aspect: f32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            container_chunk: 512,
            opf_chunk: 1024,
            toc_chunk: 1024,
            copy_chunk: 1024,
            xml_limits: XmlLimits::default(),
            display_width: 480,
            display_height: 800,
            thumb_aspect: 0.6,
        }
    }
}

impl IndexOptions {
    /// Use the same chunk size for every structural pass.
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        let chunk = chunk.max(1);
        self.container_chunk = chunk;
        self.opf_chunk = chunk;
        self.toc_chunk = chunk;
        self
    }

    /// Set explicit XML parser limits.
    pub fn with_xml_limits(mut self, limits: XmlLimits) -> Self {
        self.xml_limits = limits;
        self
    }

    /// Set the display dimensions cover markers are drawn at.
    ///
    /// Landscape dimensions are swapped so covers stay portrait.
    pub fn with_display(mut self, width: u32, height: u32) -> Self {
        self.display_width = width.min(height);
        self.display_height = width.max(height);
        self
    }

    /// Width of a thumbnail rendered at `height`.
    pub fn thumb_width(&self, height: u32) -> u32 {
        (height as f32 * self.thumb_aspect) as u32
    }
}

/// Flags for [`crate::Book::load`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    /// Build the index when no valid cached index exists.
    pub build_if_missing: bool,
    /// Do not load or rebuild the stylesheet cache.
    pub skip_css: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            build_if_missing: true,
            skip_css: false,
        }
    }
}

impl LoadOptions {
    /// Only accept an existing cached index.
    pub fn cached_only(mut self) -> Self {
        self.build_if_missing = false;
        self
    }

    /// Skip stylesheet loading.
    pub fn without_css(mut self) -> Self {
        self.skip_css = true;
        self
    }
}
