//! MDRV2 `.MDT` loader
//!
//! Layout: two magic bytes, channel count, chip word, then one (location, id) word pair
//! per channel, followed by the FM definition, SSG definition and title locations.

use super::{
    assign_channel_ends, ChannelKind, FmPatch, HeaderReader, ParsedSong, RawChannel, SourceFormat,
};
use crate::error::{Error, Result};

/// FM voice record size
const FM_RECORD: usize = 32;
/// Terminator of the title string
const TITLE_END: u8 = b'$';

/// Map a channel id word to its name, kind and destination channel
pub fn channel_for_id(id: u16) -> Option<(String, ChannelKind, usize)> {
    match id {
        0x80..=0x85 => {
            let n = (id - 0x80) as usize;
            Some((format!("FM-{}", (b'A' + n as u8) as char), ChannelKind::Fm, n))
        }
        0x40..=0x42 => {
            let n = (id - 0x40) as usize;
            Some((format!("SSG-{}", (b'I' + n as u8) as char), ChannelKind::Ssg, 6 + n))
        }
        0x10 => Some(("Rhythm-L".to_string(), ChannelKind::Rhythm, 10)),
        _ => None,
    }
}

/// Load an MDT file image
pub fn load(data: Vec<u8>) -> Result<ParsedSong> {
    let reader = HeaderReader::new(&data);
    let count = reader.u16_at(2)? as usize;
    if count == 0 {
        return Err(Error::MissingChannelTable("MDT header lists no channels".into()));
    }
    let table_end = 6 + count * 4;
    reader.require(table_end + 6)?;

    let mut channels = Vec::new();
    for i in 0..count {
        let location = reader.u16_at(6 + i * 4)? as usize;
        let id = reader.u16_at(8 + i * 4)?;
        let Some((name, kind, dest)) = channel_for_id(id) else {
            tracing::debug!("MDT: skipping channel id {:#06x}", id);
            continue;
        };
        if location < table_end || location >= data.len() {
            return Err(Error::InvalidChannelLocation {
                channel: name,
                offset: location,
                len: data.len(),
            });
        }
        channels.push(RawChannel {
            name,
            kind,
            start: location,
            end: data.len(),
            dest,
        });
    }
    if channels.is_empty() {
        return Err(Error::MissingChannelTable("MDT header has no known channel ids".into()));
    }

    let fm_loc = reader.u16_at(table_end)? as usize;
    let ssg_loc = reader.u16_at(table_end + 2)? as usize;
    let title_loc = reader.u16_at(table_end + 4)? as usize;
    assign_channel_ends(&mut channels, &[fm_loc, ssg_loc, title_loc], data.len());

    let fm_patches = parse_fm_patches(&data, fm_loc, ssg_loc);
    let title = parse_title(&data, title_loc);
    tracing::debug!(
        "MDT: {} channels, {} FM patches, title {:?}",
        channels.len(),
        fm_patches.len(),
        title
    );

    Ok(ParsedSong {
        format: SourceFormat::Mdt,
        title,
        author: String::new(),
        data,
        channels,
        fm_patches,
        rhythm_patterns: Vec::new(),
    })
}

/// 32-byte voice records between the FM and SSG definition offsets
fn parse_fm_patches(data: &[u8], start: usize, end: usize) -> Vec<FmPatch> {
    let end = end.min(data.len());
    let mut patches = Vec::new();
    let mut pos = start;
    while pos + FM_RECORD <= end {
        let raw = &data[pos..pos + FM_RECORD];
        let connection = raw[4] & 0x3F;
        patches.push(FmPatch {
            id: patches.len() as u8,
            algorithm: connection & 7,
            feedback: (connection >> 3) & 7,
            operators: FmPatch::parse_operators(&raw[6..]),
        });
        pos += FM_RECORD;
    }
    patches
}

/// Title bytes up to `$`. The text is Shift-JIS; bytes outside ASCII are replaced.
fn parse_title(data: &[u8], start: usize) -> String {
    let Some(rest) = data.get(start..) else {
        return String::new();
    };
    let raw = match rest.iter().position(|&b| b == TITLE_END) {
        Some(end) => &rest[..end],
        None => rest,
    };
    raw.iter()
        .map(|&b| if b.is_ascii() && !b.is_ascii_control() { b as char } else { '?' })
        .collect::<String>()
        .trim()
        .to_string()
}
