//! Cover and thumbnail bitmaps
//!
//! Each bitmap in the cache directory has a one-byte sidecar tag
//! (`<name>.bmp.tag`) recording how it was produced. The tag decides
//! whether an existing file is reused or the generation is retried:
//!
//! | Tag                       | File                 | Next call        |
//! |---------------------------|----------------------|------------------|
//! | none                      | absent               | generate         |
//! | `NoSourceMarker`          | zero bytes           | probe again      |
//! | `UnsupportedFormatMarker` | cross marker bitmap  | reuse            |
//! | `Generated`               | converted bitmap     | reuse            |
//!
//! Files without a tag (written before tags existed, or interrupted between
//! bitmap and tag) are reused when they start with the `BM` magic.

extern crate alloc;

use alloc::format;
use alloc::string::{String, ToString};

use crate::archive::{Archive, CopyToSink};
use crate::bitmap;
use crate::error::{IndexError, RasterError, StorageError};
use crate::metadata::CoreMetadata;
use crate::options::IndexOptions;
use crate::path;
use crate::storage::{join_path, ByteSink, ByteSource, Storage};

/// Scratch copy of the source image during conversion
pub const COVER_SCRATCH: &str = ".cover.jpg";

const COVER_MARKER_THICKNESS: u32 = 6;
const THUMB_MARKER_THICKNESS: u32 = 2;

const COVER_DIRS: [&str; 6] = ["", "images/", "Images/", "OEBPS/", "OEBPS/images/", "OEBPS/Images/"];
const COVER_NAMES: [&str; 2] = ["cover.jpg", "cover.jpeg"];

/// How the raster converter should render the source image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionMode {
    /// Full-screen cover, cropped to fill or fitted inside the display
    Cover {
        /// Crop to fill instead of letterboxing
        cropped: bool,
    },
    /// Reduced-depth thumbnail at an explicit size
    Thumbnail {
        /// Target width in pixels
        width: u32,
        /// Target height in pixels
        height: u32,
    },
}

/// Decodes a JPEG stream and writes a BMP stream
pub trait RasterConverter {
    /// Convert `source` into `dest` according to `mode`.
    fn convert(
        &mut self,
        source: &mut dyn ByteSource,
        dest: &mut dyn ByteSink,
        mode: ConversionMode,
    ) -> Result<(), RasterError>;
}

/// Persisted state of one derived bitmap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetState {
    /// Never attempted
    Absent,
    /// No source image was found; the zero-byte file only records the attempt
    NoSourceMarker,
    /// Cross marker written for an unusable source image
    UnsupportedFormatMarker,
    /// Real converted image
    Generated,
}

impl AssetState {
    fn tag_byte(self) -> u8 {
        match self {
            AssetState::Absent => 0,
            AssetState::NoSourceMarker => 1,
            AssetState::UnsupportedFormatMarker => 2,
            AssetState::Generated => 3,
        }
    }

    fn from_tag_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(AssetState::NoSourceMarker),
            2 => Some(AssetState::UnsupportedFormatMarker),
            3 => Some(AssetState::Generated),
            _ => None,
        }
    }

    /// Whether an asset in this state should be reused as is
    pub fn is_final(self) -> bool {
        matches!(self, AssetState::UnsupportedFormatMarker | AssetState::Generated)
    }
}

/// Result of one generation attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetOutcome {
    /// An existing bitmap was kept
    Reused,
    /// The source image was converted
    Generated,
    /// The source is not a JPEG; a marker was written
    UnsupportedFormatMarker {
        /// Archive path of the source image
        href: String,
    },
    /// The converter rejected the source; a marker was written
    ConversionFailedMarker {
        /// Archive path of the source image
        href: String,
    },
    /// No cover image could be located
    NoSource,
    /// Storage failed while writing the asset
    Failed(IndexError),
}

impl AssetOutcome {
    /// Whether a displayable bitmap now exists at the target path
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            AssetOutcome::Reused
                | AssetOutcome::Generated
                | AssetOutcome::UnsupportedFormatMarker { .. }
                | AssetOutcome::ConversionFailedMarker { .. }
        )
    }

    /// The failure behind a marker or a failed attempt, if any
    pub fn error(&self) -> Option<IndexError> {
        match self {
            AssetOutcome::UnsupportedFormatMarker { href } => {
                Some(IndexError::AssetUnsupportedFormat { href: href.clone() })
            }
            AssetOutcome::ConversionFailedMarker { href } => {
                Some(IndexError::AssetConversionFailed { href: href.clone() })
            }
            AssetOutcome::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }
}

/// File name of the full-screen cover bitmap
pub fn cover_file_name(cropped: bool) -> &'static str {
    if cropped {
        "cover_crop.bmp"
    } else {
        "cover.bmp"
    }
}

/// File name of the thumbnail bitmap at `height`
pub fn thumb_file_name(height: u32) -> String {
    format!("thumb_{}.bmp", height)
}

/// Conventional cover locations probed when the package names no cover
pub fn cover_candidates() -> impl Iterator<Item = String> {
    COVER_NAMES
        .iter()
        .flat_map(|name| COVER_DIRS.iter().map(move |dir| format!("{}{}", dir, name)))
}

/// Resolve the cover image: the package's cover first, then the probe list
pub fn effective_cover_href<A: Archive + ?Sized>(
    archive: &A,
    metadata: &CoreMetadata,
) -> Option<String> {
    if !metadata.cover_item_href.is_empty() {
        return Some(metadata.cover_item_href.clone());
    }
    let found = cover_candidates().find(|candidate| archive.size_of(candidate).is_some());
    if let Some(candidate) = &found {
        log::debug!("[ASSET] Using conventional cover {}", candidate);
    }
    found
}

struct Target {
    path: String,
    mode: ConversionMode,
    marker_width: u32,
    marker_height: u32,
    marker_thickness: u32,
    record_no_source: bool,
}

/// Generates and reuses derived bitmaps inside one book's cache directory
pub struct AssetManager<'a, S: Storage> {
    storage: &'a S,
    cache_dir: &'a str,
    options: &'a IndexOptions,
}

impl<'a, S: Storage> AssetManager<'a, S> {
    /// Create a manager for `cache_dir`
    pub fn new(storage: &'a S, cache_dir: &'a str, options: &'a IndexOptions) -> Self {
        Self {
            storage,
            cache_dir,
            options,
        }
    }

    /// Path of the cover bitmap
    pub fn cover_path(&self, cropped: bool) -> String {
        join_path(self.cache_dir, cover_file_name(cropped))
    }

    /// Path of the thumbnail bitmap at `height`
    pub fn thumb_path(&self, height: u32) -> String {
        join_path(self.cache_dir, &thumb_file_name(height))
    }

    /// Recorded state of the asset at `path`
    pub fn state(&self, path: &str) -> AssetState {
        let tag_path = tag_path(path);
        if !self.storage.exists(&tag_path) {
            return AssetState::Absent;
        }
        match self.storage.read_all(&tag_path) {
            Ok(bytes) => bytes
                .first()
                .copied()
                .and_then(AssetState::from_tag_byte)
                .unwrap_or(AssetState::Absent),
            Err(err) => {
                log::warn!("[ASSET] Failed to read {}: {}", tag_path, err);
                AssetState::Absent
            }
        }
    }

    /// Produce the cover bitmap unless a reusable one exists
    pub fn generate_cover<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        metadata: &CoreMetadata,
        converter: &mut dyn RasterConverter,
        cropped: bool,
    ) -> AssetOutcome {
        let target = Target {
            path: self.cover_path(cropped),
            mode: ConversionMode::Cover { cropped },
            marker_width: self.options.display_width,
            marker_height: self.options.display_height,
            marker_thickness: COVER_MARKER_THICKNESS,
            record_no_source: false,
        };
        self.generate(archive, metadata, converter, &target)
    }

    /// Produce the thumbnail bitmap at `height` unless a reusable one exists
    pub fn generate_thumbnail<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        metadata: &CoreMetadata,
        converter: &mut dyn RasterConverter,
        height: u32,
    ) -> AssetOutcome {
        let width = self.options.thumb_width(height);
        let target = Target {
            path: self.thumb_path(height),
            mode: ConversionMode::Thumbnail { width, height },
            marker_width: width,
            marker_height: height,
            marker_thickness: THUMB_MARKER_THICKNESS,
            record_no_source: true,
        };
        self.generate(archive, metadata, converter, &target)
    }

    /// `true` when a cover bitmap (real or marker) exists afterwards
    pub fn ensure_cover<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        metadata: &CoreMetadata,
        converter: &mut dyn RasterConverter,
        cropped: bool,
    ) -> bool {
        self.generate_cover(archive, metadata, converter, cropped)
            .is_available()
    }

    /// `true` when a thumbnail bitmap (real or marker) exists afterwards
    pub fn ensure_thumbnail<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        metadata: &CoreMetadata,
        converter: &mut dyn RasterConverter,
        height: u32,
    ) -> bool {
        self.generate_thumbnail(archive, metadata, converter, height)
            .is_available()
    }

    fn reusable(&self, path: &str) -> bool {
        match self.state(path) {
            state if state.is_final() => {
                if bitmap::is_valid_bitmap(self.storage, path) {
                    return true;
                }
                log::warn!("[ASSET] {} tagged {:?} but invalid, regenerating", path, state);
            }
            AssetState::NoSourceMarker => {
                log::debug!("[ASSET] {} recorded no source, probing again", path);
            }
            _ => {
                if bitmap::is_valid_bitmap(self.storage, path) {
                    return true;
                }
            }
        }
        self.remove_asset(path);
        false
    }

    fn remove_asset(&self, path: &str) {
        for file in [String::from(path), tag_path(path)] {
            if self.storage.exists(&file) {
                if let Err(err) = self.storage.remove_file(&file) {
                    log::warn!("[ASSET] Failed to remove {}: {}", file, err);
                }
            }
        }
    }

    fn generate<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        metadata: &CoreMetadata,
        converter: &mut dyn RasterConverter,
        target: &Target,
    ) -> AssetOutcome {
        if self.reusable(&target.path) {
            return AssetOutcome::Reused;
        }

        let Some(href) = effective_cover_href(archive, metadata) else {
            log::info!("[ASSET] No cover image for {}", target.path);
            if target.record_no_source {
                let recorded = self
                    .storage
                    .open_write(&target.path)
                    .and_then(|mut file| file.flush())
                    .and_then(|()| self.write_tag(&target.path, AssetState::NoSourceMarker));
                if let Err(err) = recorded {
                    return AssetOutcome::Failed(IndexError::CacheIo(err));
                }
            }
            return AssetOutcome::NoSource;
        };

        if !(path::has_extension(&href, "jpg") || path::has_extension(&href, "jpeg")) {
            log::info!("[ASSET] Cover {} is not a JPEG, writing marker", href);
            return match self.write_marker(target) {
                Ok(()) => AssetOutcome::UnsupportedFormatMarker { href },
                Err(err) => AssetOutcome::Failed(IndexError::CacheIo(err)),
            };
        }

        match self.convert(archive, converter, &href, target) {
            Ok(true) => AssetOutcome::Generated,
            Ok(false) => match self.write_marker(target) {
                Ok(()) => AssetOutcome::ConversionFailedMarker { href },
                Err(err) => AssetOutcome::Failed(IndexError::CacheIo(err)),
            },
            Err(err) => {
                self.remove_asset(&target.path);
                AssetOutcome::Failed(err)
            }
        }
    }

    /// Stream the source to scratch and run the converter.
    ///
    /// `Ok(false)` means the image could not be converted; storage failures
    /// are errors.
    fn convert<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        converter: &mut dyn RasterConverter,
        href: &str,
        target: &Target,
    ) -> Result<bool, IndexError> {
        let scratch = join_path(self.cache_dir, COVER_SCRATCH);
        let result = self.convert_via_scratch(archive, converter, href, target, &scratch);
        if self.storage.exists(&scratch) {
            if let Err(err) = self.storage.remove_file(&scratch) {
                log::warn!("[ASSET] Failed to remove {}: {}", scratch, err);
            }
        }
        result
    }

    fn convert_via_scratch<A: Archive + ?Sized>(
        &self,
        archive: &mut A,
        converter: &mut dyn RasterConverter,
        href: &str,
        target: &Target,
        scratch: &str,
    ) -> Result<bool, IndexError> {
        {
            let mut copy = self.storage.open_write(scratch)?;
            match archive.stream_to(href, &mut CopyToSink(&mut copy), self.options.copy_chunk) {
                Ok(_) => {}
                Err(IndexError::CacheIo(err)) => return Err(IndexError::CacheIo(err)),
                Err(err) => {
                    log::warn!("[ASSET] Failed to read cover {}: {}", href, err);
                    return Ok(false);
                }
            }
            copy.flush()?;
        }

        let mut source = self.storage.open_read(scratch)?;
        let mut dest = self.storage.open_write(&target.path)?;
        match converter.convert(&mut source, &mut dest, target.mode) {
            Ok(()) => {
                dest.flush()?;
                drop(dest);
                self.write_tag(&target.path, AssetState::Generated)?;
                log::info!("[ASSET] Generated {} from {}", target.path, href);
                Ok(true)
            }
            Err(err) => {
                log::warn!("[ASSET] {} for {}", err, href);
                Ok(false)
            }
        }
    }

    fn write_marker(&self, target: &Target) -> Result<(), StorageError> {
        let mut file = self.storage.open_write(&target.path)?;
        bitmap::write_cross_marker(
            &mut file,
            target.marker_width,
            target.marker_height,
            target.marker_thickness,
        )?;
        drop(file);
        self.write_tag(&target.path, AssetState::UnsupportedFormatMarker)
    }

    fn write_tag(&self, asset_path: &str, state: AssetState) -> Result<(), StorageError> {
        let mut tag = self.storage.open_write(&tag_path(asset_path))?;
        tag.write_all(&[state.tag_byte()])?;
        tag.flush()
    }
}

fn tag_path(asset_path: &str) -> String {
    let mut tag = asset_path.to_string();
    tag.push_str(".tag");
    tag
}
