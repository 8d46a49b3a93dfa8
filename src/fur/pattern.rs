//! Pattern encoding: quantization, row masks and skip compression

use super::block::BlockWriter;
use crate::convert::event::TimelineEvent;
use crate::convert::note::{MAX_NOTE, NOTE_OFF, NOTE_RELEASE};
use crate::error::Recovery;
use serde::Serialize;
use std::collections::BTreeMap;

/// Effect codes used by the converter
pub mod effect {
    /// `08xy` panning, x left y right
    pub const PAN: u8 = 0x08;
    /// `0Bxx` jump to order
    pub const JUMP: u8 = 0x0B;
    /// `E1xy` slide up y semitones at speed x
    pub const SLIDE_UP: u8 = 0xE1;
    /// `E2xy` slide down
    pub const SLIDE_DOWN: u8 = 0xE2;
    /// `E5xx` fine pitch, 80 centre
    pub const DETUNE: u8 = 0xE5;
    /// `FDxx` virtual tempo numerator
    pub const VIRTUAL_TEMPO: u8 = 0xFD;
}

/// Effects per row
pub const MAX_EFFECTS: usize = 8;
/// Ends a pattern's row data
pub const PATTERN_END: u8 = 0xFF;

/// Effect type and value pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Effect {
    pub code: u8,
    pub value: u8,
}

impl Effect {
    pub fn new(code: u8, value: u8) -> Self {
        Self { code, value }
    }
}

/// One pattern row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Row {
    pub note: Option<u8>,
    pub instrument: Option<u8>,
    pub volume: Option<u8>,
    pub effects: Vec<Effect>,
}

impl Row {
    pub fn is_empty(&self) -> bool {
        self.note.is_none()
            && self.instrument.is_none()
            && self.volume.is_none()
            && self.effects.is_empty()
    }

    fn push_effects(&mut self, effects: &[Effect]) {
        let room = MAX_EFFECTS.saturating_sub(self.effects.len());
        self.effects.extend(effects.iter().take(room));
    }
}

/// Serialize one non-empty row: mask byte(s) then payload
pub fn encode_row(row: &Row, out: &mut Vec<u8>) {
    let effects = &row.effects[..row.effects.len().min(MAX_EFFECTS)];
    let mut mask: u32 = 0;
    if row.note.is_some() {
        mask |= 1;
    }
    if row.instrument.is_some() {
        mask |= 2;
    }
    if row.volume.is_some() {
        mask |= 4;
    }
    match effects.len() {
        0 => {}
        1 => mask |= 8 | 16,
        n => {
            mask |= 8 | 16 | 32;
            if n > 4 {
                mask |= 64;
            }
            for i in 0..n {
                mask |= (256 | 512) << (i * 2);
            }
        }
    }
    let mask_len = if mask & 64 != 0 {
        3
    } else if mask & 32 != 0 {
        2
    } else {
        1
    };
    out.extend_from_slice(&mask.to_le_bytes()[..mask_len]);
    out.extend(row.note);
    out.extend(row.instrument);
    out.extend(row.volume);
    for fx in effects {
        out.push(fx.code);
        out.push(fx.value);
    }
}

/// Write a run of `rows` empty rows
pub fn write_skip(out: &mut Vec<u8>, mut rows: u32) {
    while rows >= 128 {
        out.push(0xFE);
        rows -= 128;
    }
    match rows {
        0 => {}
        1 => out.push(0x00),
        n => out.push(0x80 | (n - 2) as u8),
    }
}

/// Serialized pattern of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub channel: u8,
    pub index: u16,
    /// Row data including the terminator
    pub data: Vec<u8>,
}

impl Pattern {
    /// Pattern with no rows
    pub fn empty(channel: u8, index: u16) -> Self {
        Self {
            channel,
            index,
            data: vec![PATTERN_END],
        }
    }

    /// Serialize as a `PATN` block
    pub fn to_block(&self) -> Vec<u8> {
        let mut body = BlockWriter::new();
        body.write_u8(0) // subsong
            .write_u8(self.channel)
            .write_u16(self.index)
            .write_str("")
            .write_bytes(&self.data);
        body.finish_block(b"PATN")
    }
}

/// Encoder output for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChannel {
    pub patterns: Vec<Pattern>,
    /// Effect columns needed to show every effect
    pub effect_columns: u8,
    pub overflow: Option<Recovery>,
}

/// Quantizes a timeline onto pattern rows
#[derive(Debug, Clone)]
pub struct PatternEncoder {
    pub channel: u8,
    pub ticks_per_row: u32,
    pub rows_per_pattern: u32,
    pub max_patterns: u32,
}

impl PatternEncoder {
    /// Merge events into rows. Events past the pattern ceiling are dropped.
    pub fn quantize(&self, events: &[TimelineEvent]) -> (BTreeMap<u32, Row>, Option<Recovery>) {
        let limit = self.max_patterns * self.rows_per_pattern;
        let mut rows: BTreeMap<u32, Row> = BTreeMap::new();
        let mut overflow = None;

        for event in events {
            let index = event.tick() / self.ticks_per_row.max(1);
            if index >= limit {
                overflow = Some(Recovery::PatternOverflow {
                    channel: self.channel as usize,
                    tick: event.tick(),
                });
                break;
            }
            let row = rows.entry(index).or_default();
            match event {
                TimelineEvent::NoteOn {
                    note,
                    instrument,
                    volume,
                    effects,
                    ..
                } => {
                    row.note = Some(*note);
                    if instrument.is_some() {
                        row.instrument = *instrument;
                    }
                    if volume.is_some() {
                        row.volume = *volume;
                    }
                    row.push_effects(effects);
                }
                TimelineEvent::NoteRelease { .. } => {
                    row.note.get_or_insert(NOTE_RELEASE);
                }
                TimelineEvent::NoteOff { .. } => {
                    row.note.get_or_insert(NOTE_OFF);
                }
                TimelineEvent::SlideEffect { effects, .. } => row.push_effects(effects),
                TimelineEvent::TempoChange { tempo, .. } => {
                    row.push_effects(&[Effect::new(effect::VIRTUAL_TEMPO, (*tempo).min(255) as u8)]);
                }
                TimelineEvent::LoopJump { order, .. } => {
                    row.push_effects(&[Effect::new(effect::JUMP, *order)]);
                }
            }
        }

        // instrument and volume only where they change
        let mut active_instrument = None;
        let mut active_volume = None;
        for row in rows.values_mut() {
            if row.instrument.is_some() {
                if row.instrument == active_instrument {
                    row.instrument = None;
                } else {
                    active_instrument = row.instrument;
                }
            }
            if row.volume.is_some() {
                if row.volume == active_volume {
                    row.volume = None;
                } else {
                    active_volume = row.volume;
                }
            }
        }
        rows.retain(|_, row| !row.is_empty());
        (rows, overflow)
    }

    /// Encode a channel's timeline into patterns
    pub fn encode(&self, events: &[TimelineEvent]) -> EncodedChannel {
        let (rows, overflow) = self.quantize(events);
        let effect_columns = rows
            .values()
            .map(|r| r.effects.len())
            .max()
            .unwrap_or(0)
            .clamp(1, MAX_EFFECTS) as u8;

        let Some(&last_row) = rows.keys().next_back() else {
            return EncodedChannel {
                patterns: Vec::new(),
                effect_columns,
                overflow,
            };
        };

        let rpp = self.rows_per_pattern;
        let pattern_count = last_row / rpp + 1;
        let mut patterns = Vec::with_capacity(pattern_count as usize);
        let mut iter = rows.iter().peekable();
        for index in 0..pattern_count {
            let base = index * rpp;
            let mut data = Vec::new();
            let mut cursor = 0;
            while let Some((&row_index, row)) = iter.next_if(|(&r, _)| r < base + rpp) {
                let local = row_index - base;
                write_skip(&mut data, local - cursor);
                encode_row(row, &mut data);
                cursor = local + 1;
            }
            write_skip(&mut data, rpp - cursor);
            data.push(PATTERN_END);
            patterns.push(Pattern {
                channel: self.channel,
                index: index as u16,
                data,
            });
        }

        EncodedChannel {
            patterns,
            effect_columns,
            overflow,
        }
    }
}

/// True if `note` is a pitched note rather than a release marker
pub fn is_pitched(note: u8) -> bool {
    note <= MAX_NOTE
}
