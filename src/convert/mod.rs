//! Conversion pipeline: decode every channel, build timelines, encode patterns
//!
//! [`Converter::convert`] turns a [`ParsedSong`] into a [`Song`]. Channels are
//! processed in source order, which also fixes the order instruments are allocated in.

pub mod channel;
pub mod decoder;
pub mod envelope;
pub mod event;
pub mod note;
pub mod rhythm;
pub mod timeline;

use crate::error::{Error, Recovery, Result};
use crate::fur::pattern::{Pattern, PatternEncoder};
use crate::fur::instrument::InstrumentBank;
use crate::fur::Song;
use crate::source::opcode;
use crate::source::{ChannelKind, ParsedSong, SourceFormat};
use decoder::{ChannelDecoder, DecodedChannel};
use event::{Timeline, TimelineEvent};
use rhythm::{RhythmExpander, FIRST_RHYTHM_CHANNEL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use timeline::{TempoTimeline, TimelineBuilder};

/// Destination channels: FM 0-5, SSG 6-8, ADPCM 9, rhythm 10-15
pub const CHANNEL_COUNT: usize = 16;

/// Conversion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    /// Source ticks quantized into one pattern row
    pub ticks_per_row: u32,
    pub rows_per_pattern: u32,
    /// Pattern ceiling per channel
    pub max_patterns: u32,
    /// Times a zero-count loop is unrolled
    pub infinite_loop_iterations: u32,
    /// Opcodes interpreted per channel before giving up
    pub max_decode_steps: usize,
    pub initial_tempo: u16,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self::for_format(SourceFormat::Pmd)
    }
}

impl ConvertOptions {
    /// Defaults for a source format
    pub fn for_format(format: SourceFormat) -> Self {
        let (ticks_per_row, initial_tempo) = match format {
            SourceFormat::Pmd => (3, 75),
            SourceFormat::Mdt => (6, 120),
        };
        Self {
            ticks_per_row,
            rows_per_pattern: 64,
            max_patterns: 256,
            infinite_loop_iterations: 2,
            max_decode_steps: 100_000,
            initial_tempo,
        }
    }

    /// Read a JSON config file. Missing fields keep the format's defaults.
    pub fn load(path: &Path, format: SourceFormat) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let overrides: serde_json::Value = serde_json::from_str(&text)?;
        let serde_json::Value::Object(overrides) = overrides else {
            return Err(Error::Config(format!(
                "{}: expected a JSON object",
                path.display()
            )));
        };

        let mut merged = serde_json::to_value(Self::for_format(format))?;
        if let serde_json::Value::Object(fields) = &mut merged {
            for (key, value) in overrides {
                if !fields.contains_key(&key) {
                    return Err(Error::Config(format!("unknown option '{}'", key)));
                }
                fields.insert(key, value);
            }
        }
        let options: Self = serde_json::from_value(merged)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject settings the encoder cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.ticks_per_row == 0 {
            return Err(Error::Config("ticks_per_row must be at least 1".to_string()));
        }
        if !(1..=256).contains(&self.rows_per_pattern) {
            return Err(Error::Config(format!(
                "rows_per_pattern must be 1-256, got {}",
                self.rows_per_pattern
            )));
        }
        if !(1..=256).contains(&self.max_patterns) {
            return Err(Error::Config(format!(
                "max_patterns must be 1-256, got {}",
                self.max_patterns
            )));
        }
        if self.initial_tempo == 0 {
            return Err(Error::Config("initial_tempo must be at least 1".to_string()));
        }
        Ok(())
    }

    fn ticks_per_pattern(&self) -> u32 {
        self.ticks_per_row * self.rows_per_pattern
    }
}

/// Song assembler
pub struct Converter {
    options: ConvertOptions,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options }
    }

    /// Convert a loaded song
    pub fn convert(&self, song: &ParsedSong) -> Result<Song> {
        self.options.validate()?;
        let opts = &self.options;
        let table = opcode::table(song.format);

        let mut bank = InstrumentBank::new();
        bank.register_fm_patches(&song.fm_patches);

        let mut recoveries: Vec<Recovery> = Vec::new();
        let decoded: Vec<DecodedChannel> = song
            .channels
            .iter()
            .map(|ch| {
                let out = ChannelDecoder::new(table, &song.data, ch, opts).decode();
                tracing::debug!(
                    "{}: {} events, {} notes, {} ticks",
                    ch.name,
                    out.events.len(),
                    out.note_count(),
                    out.length
                );
                recoveries.extend(out.recoveries.iter().cloned());
                out
            })
            .collect();

        let tempo = TempoTimeline::merge(
            opts.initial_tempo,
            decoded.iter().map(|d| d.tempo_changes.as_slice()),
        );

        let mut timelines: Vec<Timeline> = (0..CHANNEL_COUNT).map(|_| Timeline::new()).collect();
        for (ch, out) in song.channels.iter().zip(&decoded) {
            if ch.kind == ChannelKind::Rhythm {
                if out.note_count() == 0 {
                    continue;
                }
                let expander = RhythmExpander {
                    format: song.format,
                    patterns: &song.rhythm_patterns,
                };
                let instrument = bank.rhythm();
                for (voice, timeline) in expander.expand(out, instrument).into_iter().enumerate() {
                    merge_into(&mut timelines[FIRST_RHYTHM_CHANNEL + voice], timeline);
                }
                continue;
            }
            if ch.dest >= CHANNEL_COUNT {
                tracing::warn!("{}: no destination channel {}", ch.name, ch.dest);
                continue;
            }
            let timeline = TimelineBuilder {
                table,
                kind: ch.kind,
                ticks_per_row: opts.ticks_per_row,
                bank: &mut bank,
            }
            .build(out);
            merge_into(&mut timelines[ch.dest], timeline);
        }

        let loop_order = song
            .channels
            .iter()
            .zip(&decoded)
            .find_map(|(_, out)| out.loop_tick)
            .and_then(|tick| u8::try_from(tick / opts.ticks_per_pattern()).ok());

        if let Some(order) = loop_order {
            self.place_loop_jump(song, &decoded, &mut timelines, order);
        }

        if let Some(first) = timelines.iter_mut().find(|t| !t.is_empty()) {
            for &(tick, tempo) in &tempo.changes {
                first.insert(TimelineEvent::TempoChange { tick, tempo });
            }
        }

        let mut patterns: Vec<Vec<Pattern>> = Vec::with_capacity(CHANNEL_COUNT);
        let mut effect_columns: Vec<u8> = Vec::with_capacity(CHANNEL_COUNT);
        for (index, timeline) in timelines.into_iter().enumerate() {
            let encoder = PatternEncoder {
                channel: index as u8,
                ticks_per_row: opts.ticks_per_row,
                rows_per_pattern: opts.rows_per_pattern,
                max_patterns: opts.max_patterns,
            };
            let encoded = encoder.encode(&timeline.into_vec());
            if let Some(overflow) = encoded.overflow {
                tracing::warn!("{}", overflow);
                recoveries.push(overflow);
            }
            patterns.push(encoded.patterns);
            effect_columns.push(encoded.effect_columns);
        }

        let order_count = patterns.iter().map(Vec::len).max().unwrap_or(0).max(1);
        for (index, channel) in patterns.iter_mut().enumerate() {
            for order in channel.len()..order_count {
                channel.push(Pattern::empty(index as u8, order as u16));
            }
        }

        let instruments = bank.into_instruments();
        tracing::debug!(
            "{} orders, {} instruments, {} recoveries",
            order_count,
            instruments.len(),
            recoveries.len()
        );

        Ok(Song {
            title: song.title.clone(),
            author: song.author.clone(),
            format: song.format,
            tempo: tempo.initial,
            tempo_timeline: tempo,
            ticks_per_row: opts.ticks_per_row,
            rows_per_pattern: opts.rows_per_pattern,
            order_count,
            loop_order,
            effect_columns,
            instruments,
            patterns,
            recoveries,
        })
    }

    /// Jump back to `order` from the row holding the end of the latest-ending channel
    /// that plays notes
    fn place_loop_jump(
        &self,
        song: &ParsedSong,
        decoded: &[DecodedChannel],
        timelines: &mut [Timeline],
        order: u8,
    ) {
        let latest = song
            .channels
            .iter()
            .zip(decoded)
            .filter(|(ch, out)| out.note_count() > 0 && out.length > 0 && ch.dest < CHANNEL_COUNT)
            .max_by_key(|(_, out)| out.length);
        let Some((ch, out)) = latest else {
            return;
        };
        let tpr = self.options.ticks_per_row;
        let tick = (out.length - 1) / tpr * tpr;
        timelines[ch.dest].insert(TimelineEvent::LoopJump { tick, order });
    }
}

fn merge_into(target: &mut Timeline, source: Timeline) {
    for event in source.into_vec() {
        target.insert(event);
    }
}
