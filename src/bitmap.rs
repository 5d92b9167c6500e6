//! 1-bit BMP marker images
//!
//! A marker is a white image with a black diagonal cross. It is a valid,
//! decodable bitmap, so a viewer shows it as a placeholder, and its
//! presence tells the asset manager not to retry the conversion.

use alloc::format;

use crate::error::StorageError;
use crate::storage::{ByteSink, ByteSource, Storage};

const FILE_HEADER_LEN: u32 = 14;
const INFO_HEADER_LEN: u32 = 40;
const PALETTE_LEN: u32 = 8;
const PIXELS_PER_METRE: u32 = 2835;

/// Bytes per padded pixel row of a 1-bit image
fn row_bytes(width: u32) -> u32 {
    width.div_ceil(32) * 4
}

/// Size of the whole file for a `width` x `height` marker, or `None` when
/// it does not fit a BMP header
pub fn marker_file_size(width: u32, height: u32) -> Option<u32> {
    row_bytes(width)
        .checked_mul(height)?
        .checked_add(FILE_HEADER_LEN + INFO_HEADER_LEN + PALETTE_LEN)
}

fn on_cross(x: u32, y: u32, width: u32, height: u32, thickness: u32) -> bool {
    let scaled_y = (u64::from(y) * u64::from(width) / u64::from(height)) as i64;
    let x = i64::from(x);
    let thickness = i64::from(thickness);
    let mirrored = i64::from(width) - 1 - scaled_y;
    (x - scaled_y).abs() <= thickness || (x - mirrored).abs() <= thickness
}

/// Stream a diagonal-cross marker into `sink`, one row at a time
///
/// Rows are written top-down (negative height in the header). Zero
/// dimensions are bumped to 1 so the output is always decodable. Dimensions
/// whose image size or signed header fields overflow are rejected before
/// anything is written.
pub fn write_cross_marker<W: ByteSink + ?Sized>(
    sink: &mut W,
    width: u32,
    height: u32,
    thickness: u32,
) -> Result<(), StorageError> {
    let width = width.max(1);
    let height = height.max(1);
    let (Ok(signed_width), Ok(signed_height), Some(file_size)) = (
        i32::try_from(width),
        i32::try_from(height),
        marker_file_size(width, height),
    ) else {
        return Err(StorageError::Io(format!(
            "marker dimensions {}x{} too large",
            width, height
        )));
    };
    let stride = row_bytes(width);
    let image_size = stride * height;

    let mut header = [0u8; (FILE_HEADER_LEN + INFO_HEADER_LEN + PALETTE_LEN) as usize];
    header[0..2].copy_from_slice(b"BM");
    header[2..6].copy_from_slice(&file_size.to_le_bytes());
    header[10..14].copy_from_slice(&(FILE_HEADER_LEN + INFO_HEADER_LEN + PALETTE_LEN).to_le_bytes());

    let info = &mut header[14..54];
    info[0..4].copy_from_slice(&INFO_HEADER_LEN.to_le_bytes());
    info[4..8].copy_from_slice(&signed_width.to_le_bytes());
    info[8..12].copy_from_slice(&(-signed_height).to_le_bytes());
    info[12..14].copy_from_slice(&1u16.to_le_bytes());
    info[14..16].copy_from_slice(&1u16.to_le_bytes());
    info[20..24].copy_from_slice(&image_size.to_le_bytes());
    info[24..28].copy_from_slice(&PIXELS_PER_METRE.to_le_bytes());
    info[28..32].copy_from_slice(&PIXELS_PER_METRE.to_le_bytes());
    info[32..36].copy_from_slice(&2u32.to_le_bytes());
    info[36..40].copy_from_slice(&2u32.to_le_bytes());

    // Palette: index 0 black, index 1 white.
    header[58..62].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x00]);
    sink.write_all(&header)?;

    let mut row = [0u8; 512];
    let stride = stride as usize;
    for y in 0..height {
        let mut x = 0u32;
        for chunk_start in (0..stride).step_by(row.len()) {
            let chunk_len = (stride - chunk_start).min(row.len());
            let chunk = &mut row[..chunk_len];
            chunk.fill(0xFF);
            for byte in chunk.iter_mut() {
                for bit in 0..8 {
                    if x < width && on_cross(x, y, width, height, thickness) {
                        *byte &= !(0x80 >> bit);
                    }
                    x += 1;
                }
            }
            sink.write_all(chunk)?;
        }
    }
    sink.flush()
}

/// Whether `path` holds a non-empty file starting with the `BM` magic
pub fn is_valid_bitmap<S: Storage>(storage: &S, path: &str) -> bool {
    if storage.file_size(path).unwrap_or(0) == 0 {
        return false;
    }
    let Ok(mut reader) = storage.open_read(path) else {
        return false;
    };
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic).is_ok() && &magic == b"BM"
}
