//! Source formats: PMD `.M` and MDRV2 `.MDT` loaders
//!
//! The loaders only locate things. They read the channel table, the fixed-size
//! instrument records and the rhythm tables. Interpreting channel bytecode is left to
//! [`crate::convert::decoder`].

pub mod mdt;
pub mod opcode;
pub mod pmd;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported source bytecode formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Pmd,
    Mdt,
}

impl SourceFormat {
    /// Parse a format name (`pmd`, `m`, `mdt`)
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pmd" | "m" => Ok(Self::Pmd),
            "mdt" | "mdrv2" => Ok(Self::Mdt),
            other => Err(Error::UnknownFormat(other.to_string())),
        }
    }

    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| Error::UnknownFormat(path.display().to_string()))?;
        Self::from_name(ext)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pmd => "pmd",
            Self::Mdt => "mdt",
        }
    }
}

/// Channel type, which selects pitch mapping and volume range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Fm,
    Ssg,
    /// ADPCM sample channel
    Sample,
    Rhythm,
}

impl ChannelKind {
    /// Largest volume value the destination channel accepts
    pub fn max_volume(&self) -> u8 {
        match self {
            Self::Fm => 127,
            Self::Ssg => 15,
            Self::Sample => 255,
            Self::Rhythm => 31,
        }
    }

    /// Volume assumed before the first volume command
    pub fn default_volume(&self) -> u8 {
        match self {
            Self::Fm => 100,
            Self::Ssg => 15,
            Self::Sample => 255,
            Self::Rhythm => 31,
        }
    }

    /// Size of one `(`/`)` volume step
    pub fn volume_step(&self) -> u8 {
        match self {
            Self::Fm => 4,
            _ => 1,
        }
    }
}

/// One channel's byte range in the file image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChannel {
    pub name: String,
    pub kind: ChannelKind,
    /// Absolute offset of the first byte
    pub start: usize,
    /// Absolute offset one past the last byte
    pub end: usize,
    /// Destination channel index (rhythm channels use the first rhythm slot)
    pub dest: usize,
}

/// One FM operator in source register order, raw field values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FmOperator {
    /// Detune, chip sign-magnitude encoding (0-7)
    pub dt: u8,
    pub mul: u8,
    pub tl: u8,
    pub ks: u8,
    pub ar: u8,
    pub am: u8,
    pub dr: u8,
    pub sr: u8,
    pub sl: u8,
    pub rr: u8,
}

/// An FM voice definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmPatch {
    /// Source instrument number, as referenced by the instrument opcode
    pub id: u8,
    pub algorithm: u8,
    pub feedback: u8,
    /// Operators in register order (slot 1, slot 3, slot 2, slot 4)
    pub operators: [FmOperator; 4],
}

impl FmPatch {
    /// Parse the operator table shared by both formats: six groups of four bytes
    /// (DT/MUL, TL, KS/AR, AM/DR, SR, SL/RR), each group indexed by operator.
    /// `data` must hold at least 24 bytes.
    pub(crate) fn parse_operators(data: &[u8]) -> [FmOperator; 4] {
        let mut ops = [FmOperator::default(); 4];
        for (s, op) in ops.iter_mut().enumerate() {
            let dt_mul = data[s];
            let ks_ar = data[8 + s];
            let am_dr = data[12 + s];
            let sl_rr = data[20 + s];
            *op = FmOperator {
                dt: (dt_mul >> 4) & 7,
                mul: dt_mul & 15,
                tl: data[4 + s] & 127,
                ks: ks_ar >> 6,
                ar: ks_ar & 31,
                am: am_dr >> 7,
                dr: am_dr & 31,
                sr: data[16 + s] & 31,
                sl: sl_rr >> 4,
                rr: sl_rr & 15,
            };
        }
        ops
    }
}

/// One hit in a PMD rhythm pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RhythmHit {
    /// Tick offset from the start of the pattern
    pub tick: u32,
    /// Drum bitmask (bit 0 bass drum ... bit 10 ride)
    pub voices: u16,
}

/// A PMD R pattern: drum hits and the pattern's total length
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RhythmPattern {
    pub hits: Vec<RhythmHit>,
    pub length: u32,
}

/// Everything the converter needs from a source file
#[derive(Debug, Clone)]
pub struct ParsedSong {
    pub format: SourceFormat,
    pub title: String,
    pub author: String,
    /// The whole file image; channel ranges index into it
    pub data: Vec<u8>,
    pub channels: Vec<RawChannel>,
    pub fm_patches: Vec<FmPatch>,
    pub rhythm_patterns: Vec<RhythmPattern>,
}

impl ParsedSong {
    /// Load a file image in the given format
    pub fn load(data: Vec<u8>, format: SourceFormat) -> Result<Self> {
        match format {
            SourceFormat::Pmd => pmd::load(data),
            SourceFormat::Mdt => mdt::load(data),
        }
    }
}

/// Little-endian reads at absolute offsets with header-truncation errors
pub(crate) struct HeaderReader<'a> {
    data: &'a [u8],
}

impl<'a> HeaderReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Fail unless the first `needed` bytes exist
    pub fn require(&self, needed: usize) -> Result<()> {
        if self.data.len() < needed {
            return Err(Error::TruncatedHeader {
                needed,
                len: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        self.require(offset + 2)?;
        Ok(u16::from_le_bytes([self.data[offset], self.data[offset + 1]]))
    }

    /// u16 at `offset` if it lies inside the file
    pub fn try_u16_at(&self, offset: usize) -> Option<u16> {
        self.u16_at(offset).ok()
    }
}

/// Fill in channel end offsets: each channel runs to the next channel start (or other
/// known table start) after it, bounded by `limit`
pub(crate) fn assign_channel_ends(channels: &mut [RawChannel], boundaries: &[usize], limit: usize) {
    let starts: Vec<usize> = channels.iter().map(|c| c.start).collect();
    for ch in channels.iter_mut() {
        ch.end = starts
            .iter()
            .chain(boundaries.iter())
            .copied()
            .filter(|&b| b > ch.start && b <= limit)
            .min()
            .unwrap_or(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(SourceFormat::from_path(Path::new("song.M")).unwrap(), SourceFormat::Pmd);
        assert_eq!(SourceFormat::from_path(Path::new("a/b/SONG.MDT")).unwrap(), SourceFormat::Mdt);
        assert!(SourceFormat::from_path(Path::new("song.vgm")).is_err());
        assert!(SourceFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn test_channel_ends() {
        let mk = |start| RawChannel {
            name: String::new(),
            kind: ChannelKind::Fm,
            start,
            end: 0,
            dest: 0,
        };
        let mut channels = vec![mk(30), mk(10), mk(20)];
        assign_channel_ends(&mut channels, &[50], 100);
        assert_eq!(channels[0].end, 50);
        assert_eq!(channels[1].end, 20);
        assert_eq!(channels[2].end, 30);
    }

    #[test]
    fn test_header_reader_truncation() {
        let data = [0x34, 0x12, 0x00];
        let reader = HeaderReader::new(&data);
        assert_eq!(reader.u16_at(0).unwrap(), 0x1234);
        assert!(matches!(
            reader.u16_at(2),
            Err(Error::TruncatedHeader { needed: 4, len: 3 })
        ));
        assert_eq!(reader.try_u16_at(2), None);
    }
}
