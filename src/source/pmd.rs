//! PMD `.M` loader
//!
//! Layout: one version byte, then twelve 16-bit part pointers (FM A-F, SSG G-I,
//! ADPCM J, rhythm K, rhythm table) and the instrument pointer. Pointers are relative
//! to offset 1.

use super::opcode;
use super::{
    assign_channel_ends, ChannelKind, FmPatch, HeaderReader, ParsedSong, RawChannel, RhythmHit,
    RhythmPattern, SourceFormat,
};
use crate::error::{Error, Result};

/// Part names in header order
const PART_NAMES: [&str; 11] = [
    "FM-A", "FM-B", "FM-C", "FM-D", "FM-E", "FM-F", "SSG-G", "SSG-H", "SSG-I", "ADPCM-J",
    "Rhythm-K",
];

/// Offset of the rhythm table pointer
const RHYTHM_TABLE_POINTER: usize = 1 + 11 * 2;
/// Offset of the instrument pointer
const INSTRUMENT_POINTER: usize = 1 + 12 * 2;
/// Bytes in the fixed header
pub const HEADER_SIZE: usize = INSTRUMENT_POINTER + 2;

/// Instrument record: number byte plus 25 register bytes
const INSTRUMENT_RECORD: usize = 26;
/// Little-endian word that ends the instrument area
const INSTRUMENT_END: u16 = 0xFF00;

/// R pattern slots in the rhythm table
const MAX_RHYTHM_PATTERNS: usize = 128;
/// Events read from one R pattern before giving up
const MAX_RHYTHM_EVENTS: usize = 500;

/// Load a PMD file image
pub fn load(data: Vec<u8>) -> Result<ParsedSong> {
    let reader = HeaderReader::new(&data);
    reader.require(HEADER_SIZE)?;

    let mut channels = Vec::with_capacity(PART_NAMES.len());
    for (i, name) in PART_NAMES.iter().enumerate() {
        let offset = reader.u16_at(1 + i * 2)? as usize + 1;
        if offset >= data.len() {
            return Err(Error::InvalidChannelLocation {
                channel: name.to_string(),
                offset,
                len: data.len(),
            });
        }
        let (kind, dest) = match i {
            0..=5 => (ChannelKind::Fm, i),
            6..=8 => (ChannelKind::Ssg, i),
            9 => (ChannelKind::Sample, 9),
            _ => (ChannelKind::Rhythm, 10),
        };
        channels.push(RawChannel {
            name: name.to_string(),
            kind,
            start: offset,
            end: data.len(),
            dest,
        });
    }

    let rhythm_table = reader.u16_at(RHYTHM_TABLE_POINTER)? as usize + 1;
    let instruments = reader.u16_at(INSTRUMENT_POINTER)? as usize + 1;
    assign_channel_ends(&mut channels, &[rhythm_table, instruments], data.len());

    let fm_patches = parse_instruments(&data, instruments);
    let rhythm_patterns = parse_rhythm_table(&data, rhythm_table);
    tracing::debug!(
        "PMD: {} parts, {} FM patches, {} R patterns",
        channels.len(),
        fm_patches.len(),
        rhythm_patterns.len()
    );

    Ok(ParsedSong {
        format: SourceFormat::Pmd,
        title: String::new(),
        author: String::new(),
        data,
        channels,
        fm_patches,
        rhythm_patterns,
    })
}

/// Read 26-byte instrument records until the end marker
fn parse_instruments(data: &[u8], start: usize) -> Vec<FmPatch> {
    let reader = HeaderReader::new(data);
    let mut patches = Vec::new();
    let mut pos = start;
    while pos + INSTRUMENT_RECORD <= data.len() {
        if reader.try_u16_at(pos) == Some(INSTRUMENT_END) {
            break;
        }
        let record = &data[pos + 1..pos + INSTRUMENT_RECORD];
        patches.push(FmPatch {
            id: data[pos],
            algorithm: record[24] & 7,
            feedback: (record[24] >> 3) & 7,
            operators: FmPatch::parse_operators(record),
        });
        pos += INSTRUMENT_RECORD;
    }
    patches
}

/// Read the R pattern pointer table. The table ends at the first pattern body.
fn parse_rhythm_table(data: &[u8], table: usize) -> Vec<RhythmPattern> {
    let reader = HeaderReader::new(data);
    let mut patterns = Vec::new();
    let mut table_end = data.len();
    for i in 0..MAX_RHYTHM_PATTERNS {
        let slot = table + i * 2;
        if slot >= table_end {
            break;
        }
        let Some(ptr) = reader.try_u16_at(slot) else {
            break;
        };
        if ptr == 0 || ptr as usize + 1 >= data.len() {
            patterns.push(RhythmPattern::default());
            continue;
        }
        let start = ptr as usize + 1;
        if start > table {
            table_end = table_end.min(start);
        }
        patterns.push(parse_rhythm_pattern(data, start));
    }
    patterns
}

/// Parse one R pattern body
///
/// `00-7F` rest of that many ticks, `80-BF` drum hit (6 high mask bits in the
/// command, 8 low bits next, then a length byte), `FF` end, other commands skipped.
pub fn parse_rhythm_pattern(data: &[u8], start: usize) -> RhythmPattern {
    let mut pattern = RhythmPattern::default();
    let mut pos = start;
    for _ in 0..MAX_RHYTHM_EVENTS {
        let Some(&cmd) = data.get(pos) else {
            break;
        };
        match cmd {
            0xFF => break,
            0x00..=0x7F => {
                pattern.length += cmd as u32;
                pos += 1;
            }
            0x80..=0xBF => {
                let (Some(&low), Some(&len)) = (data.get(pos + 1), data.get(pos + 2)) else {
                    break;
                };
                pattern.hits.push(RhythmHit {
                    tick: pattern.length,
                    voices: low as u16 | (((cmd & 0x3F) as u16) << 8),
                });
                pattern.length += len.max(1) as u32;
                pos += 3;
            }
            _ => {
                let arity = opcode::PMD
                    .arity(cmd, &data[pos + 1..], ChannelKind::Rhythm)
                    .unwrap_or(0);
                pos += 1 + arity;
            }
        }
    }
    pattern
}
