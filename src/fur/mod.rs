//! Furnace module output: instruments, patterns and the block bundle

pub mod block;
pub mod instrument;
pub mod json;
pub mod pattern;
pub mod reader;

pub use instrument::Instrument;
pub use json::SongReport;
pub use pattern::Pattern;

use crate::convert::timeline::TempoTimeline;
use crate::error::{Recovery, Result};
use crate::source::SourceFormat;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// A converted song
#[derive(Debug, Clone)]
pub struct Song {
    pub title: String,
    pub author: String,
    pub format: SourceFormat,
    /// Tempo at the start of the song
    pub tempo: u16,
    pub tempo_timeline: TempoTimeline,
    pub ticks_per_row: u32,
    pub rows_per_pattern: u32,
    /// Patterns per channel, identical for every channel
    pub order_count: usize,
    /// Order the song loops back to
    pub loop_order: Option<u8>,
    /// Effect columns per channel
    pub effect_columns: Vec<u8>,
    pub instruments: Vec<Instrument>,
    /// Patterns indexed by channel, then order
    pub patterns: Vec<Vec<Pattern>>,
    pub recoveries: Vec<Recovery>,
}

impl Song {
    /// `INS2` blocks in instrument order
    pub fn instrument_blocks(&self) -> Vec<Vec<u8>> {
        self.instruments.iter().map(Instrument::to_block).collect()
    }

    /// `PATN` blocks, channel by channel
    pub fn pattern_blocks(&self) -> Vec<Vec<u8>> {
        self.patterns
            .iter()
            .flatten()
            .map(Pattern::to_block)
            .collect()
    }

    /// Write every instrument block, then every pattern block
    pub fn write_bundle<W: Write>(&self, writer: W, compress: bool) -> Result<()> {
        if compress {
            let mut encoder = ZlibEncoder::new(writer, Compression::default());
            self.write_blocks(&mut encoder)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = writer;
            self.write_blocks(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    fn write_blocks<W: Write>(&self, writer: &mut W) -> Result<()> {
        for block in self.instrument_blocks() {
            writer.write_all(&block)?;
        }
        for block in self.pattern_blocks() {
            writer.write_all(&block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::split_blocks;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn song() -> Song {
        Song {
            title: "t".to_string(),
            author: String::new(),
            format: SourceFormat::Pmd,
            tempo: 75,
            tempo_timeline: TempoTimeline {
                initial: 75,
                changes: Vec::new(),
            },
            ticks_per_row: 3,
            rows_per_pattern: 64,
            order_count: 1,
            loop_order: None,
            effect_columns: vec![1, 1],
            instruments: vec![Instrument::Fm(instrument::FmInstrument::fallback())],
            patterns: vec![vec![Pattern::empty(0, 0)], vec![Pattern::empty(1, 0)]],
            recoveries: Vec::new(),
        }
    }

    #[test]
    fn test_bundle_block_order() {
        let mut out = Vec::new();
        song().write_bundle(&mut out, false).unwrap();
        let tags: Vec<[u8; 4]> = split_blocks(&out).into_iter().map(|(tag, _)| tag).collect();
        assert_eq!(tags, vec![*b"INS2", *b"PATN", *b"PATN"]);
    }

    #[test]
    fn test_compressed_bundle() {
        let mut plain = Vec::new();
        song().write_bundle(&mut plain, false).unwrap();
        let mut packed = Vec::new();
        song().write_bundle(&mut packed, true).unwrap();

        let mut inflated = Vec::new();
        ZlibDecoder::new(packed.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, plain);
    }
}
