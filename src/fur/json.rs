//! JSON report of a converted song

use super::pattern::{is_pitched, Effect};
use super::reader::decode_pattern;
use super::Song;
use crate::convert::note::{NOTE_OFF, NOTE_RELEASE};
use crate::error::{Recovery, Result};
use crate::source::SourceFormat;
use serde::Serialize;

const NOTE_NAMES: [&str; 12] = [
    "C-", "C#", "D-", "D#", "E-", "F-", "F#", "G-", "G#", "A-", "A#", "B-",
];

/// Top-level JSON structure for a converted song
#[derive(Debug, Clone, Serialize)]
pub struct SongReport {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// Source format
    pub format: SourceFormat,
    /// Initial tempo
    pub tempo: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tempo_changes: Vec<TempoChangeJson>,
    pub ticks_per_row: u32,
    pub rows_per_pattern: u32,
    pub order_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_order: Option<u8>,
    pub instruments: Vec<InstrumentJson>,
    /// Channels with at least one row
    pub channels: Vec<ChannelJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recoveries: Vec<Recovery>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TempoChangeJson {
    pub tick: u32,
    pub tempo: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentJson {
    pub index: usize,
    pub name: String,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelJson {
    pub index: usize,
    pub effect_columns: u8,
    pub rows: Vec<RowJson>,
}

/// One non-empty row
#[derive(Debug, Clone, Serialize)]
pub struct RowJson {
    pub order: usize,
    pub row: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    /// Effects as `"E184"` style strings
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<String>,
}

impl SongReport {
    /// Build a report, decoding every pattern back into rows
    pub fn new(song: &Song) -> Result<Self> {
        let mut channels = Vec::new();
        for (index, patterns) in song.patterns.iter().enumerate() {
            let mut rows = Vec::new();
            for (order, pattern) in patterns.iter().enumerate() {
                for (row, data) in decode_pattern(&pattern.data)? {
                    rows.push(RowJson {
                        order,
                        row,
                        note: data.note.map(note_name),
                        instrument: data.instrument,
                        volume: data.volume,
                        effects: data.effects.iter().map(effect_name).collect(),
                    });
                }
            }
            if !rows.is_empty() {
                channels.push(ChannelJson {
                    index,
                    effect_columns: song.effect_columns.get(index).copied().unwrap_or(1),
                    rows,
                });
            }
        }

        Ok(Self {
            title: song.title.clone(),
            author: song.author.clone(),
            format: song.format,
            tempo: song.tempo,
            tempo_changes: song
                .tempo_timeline
                .changes
                .iter()
                .map(|&(tick, tempo)| TempoChangeJson { tick, tempo })
                .collect(),
            ticks_per_row: song.ticks_per_row,
            rows_per_pattern: song.rows_per_pattern,
            order_count: song.order_count,
            loop_order: song.loop_order,
            instruments: song
                .instruments
                .iter()
                .enumerate()
                .map(|(index, ins)| InstrumentJson {
                    index,
                    name: ins.name().to_string(),
                    kind: ins.kind_name(),
                })
                .collect(),
            channels,
            recoveries: song.recoveries.clone(),
        })
    }
}

/// Tracker-style note name, `C-4` for note 108
pub fn note_name(note: u8) -> String {
    match note {
        NOTE_OFF => "OFF".to_string(),
        NOTE_RELEASE => "REL".to_string(),
        n if is_pitched(n) => {
            let octave = n as i32 / 12 - 5;
            format!("{}{}", NOTE_NAMES[n as usize % 12], octave)
        }
        n => format!("?{}", n),
    }
}

fn effect_name(effect: &Effect) -> String {
    format!("{:02X}{:02X}", effect.code, effect.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_names() {
        assert_eq!(note_name(108), "C-4");
        assert_eq!(note_name(121), "C#5");
        assert_eq!(note_name(59), "B--1");
        assert_eq!(note_name(NOTE_OFF), "OFF");
        assert_eq!(note_name(NOTE_RELEASE), "REL");
    }

    #[test]
    fn test_effect_name() {
        assert_eq!(effect_name(&Effect::new(0xE1, 0x84)), "E184");
        assert_eq!(effect_name(&Effect::new(0x0B, 1)), "0B01");
    }
}
