//! Image dimension probing from file headers.

use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Most bytes read from the front of an upload when probing.
pub const PROBE_LIMIT: usize = 64 * 1024;

/// Read up to `limit` bytes from the start of `reader`, then rewind it.
pub(crate) async fn read_prefix<R>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let mut prefix = Vec::with_capacity(limit.min(8 * 1024));
    (&mut *reader).take(limit as u64).read_to_end(&mut prefix).await?;
    reader.seek(SeekFrom::Start(0)).await?;
    Ok(prefix)
}

fn be16(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 2)?;
    Some(u32::from(u16::from_be_bytes([b[0], b[1]])))
}

fn le16(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 2)?;
    Some(u32::from(u16::from_le_bytes([b[0], b[1]])))
}

fn be32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le24(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 3)?;
    Some(u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16)
}

fn le_i32(data: &[u8], at: usize) -> Option<i32> {
    let b = data.get(at..at + 4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Width and height of a PNG, GIF, JPEG, WebP or BMP image, if the header
/// can be recognized within `header`.
#[must_use]
pub fn image_dimensions(header: &[u8]) -> Option<(u32, u32)> {
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        png(header)
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        Some((le16(header, 6)?, le16(header, 8)?))
    } else if header.starts_with(&[0xFF, 0xD8]) {
        jpeg(header)
    } else if header.starts_with(b"RIFF") && header.get(8..12) == Some(b"WEBP".as_slice()) {
        webp(header)
    } else if header.starts_with(b"BM") {
        let width = le_i32(header, 18)?.unsigned_abs();
        let height = le_i32(header, 22)?.unsigned_abs();
        Some((width, height))
    } else {
        None
    }
}

fn png(data: &[u8]) -> Option<(u32, u32)> {
    if data.get(12..16) != Some(b"IHDR".as_slice()) {
        return None;
    }
    Some((be32(data, 16)?, be32(data, 20)?))
}

fn jpeg(data: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 1 < data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        match marker {
            // Fill byte
            0xFF => i += 1,
            // Markers without a length
            0x01 | 0xD0..=0xD9 => i += 2,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be16(data, i + 5)?;
                let width = be16(data, i + 7)?;
                return Some((width, height));
            }
            _ => {
                let len = be16(data, i + 2)? as usize;
                i += 2 + len;
            }
        }
    }
    None
}

fn webp(data: &[u8]) -> Option<(u32, u32)> {
    match data.get(12..16)? {
        b"VP8 " => {
            if data.get(23..26) != Some([0x9D, 0x01, 0x2A].as_slice()) {
                return None;
            }
            Some((le16(data, 26)? & 0x3FFF, le16(data, 28)? & 0x3FFF))
        }
        b"VP8L" => {
            if data.get(20) != Some(&0x2F) {
                return None;
            }
            let b = data.get(21..25)?;
            let (b0, b1, b2, b3) = (u32::from(b[0]), u32::from(b[1]), u32::from(b[2]), u32::from(b[3]));
            let width = 1 + (b0 | (b1 & 0x3F) << 8);
            let height = 1 + ((b1 >> 6) | b2 << 2 | (b3 & 0x0F) << 10);
            Some((width, height))
        }
        b"VP8X" => Some((1 + le24(data, 24)?, 1 + le24(data, 27)?)),
        _ => None,
    }
}
