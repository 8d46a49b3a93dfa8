//! Channel performance state

use crate::source::opcode::OpEffect;
use crate::source::ChannelKind;
use serde::Serialize;

/// Software envelope descriptor (PMD `E al,dd,sr,rr`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Envelope {
    /// Ticks held at full volume
    pub attack: u8,
    /// Level change applied after the attack
    pub decay: i8,
    /// Ticks per decay step, 0 holds the level
    pub sustain: u8,
    /// Ticks per release step, 0 releases instantly
    pub release: u8,
}

impl Envelope {
    /// Full volume until released
    pub const FLAT: Envelope = Envelope {
        attack: 0,
        decay: 0,
        sustain: 0,
        release: 0,
    };
}

/// How much of a note's length sounds before key-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Gate {
    /// Eighths of the note length (8 = full)
    Fraction(u8),
    /// Ticks cut from the end of the note
    CutTicks(u8),
}

impl Default for Gate {
    fn default() -> Self {
        Gate::Fraction(8)
    }
}

impl Gate {
    /// Ticks a note of `length` sounds for
    pub fn sounding_ticks(&self, length: u32) -> u32 {
        match *self {
            Gate::Fraction(q) => length * q.min(8) as u32 / 8,
            Gate::CutTicks(n) => length.saturating_sub(n as u32),
        }
    }
}

/// Pitch as pitch class and octave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pitch {
    pub pitch: u8,
    pub octave: u8,
}

impl Pitch {
    /// Unpack an `octave << 4 | pitch` byte
    pub fn from_packed(byte: u8) -> Self {
        Self {
            pitch: byte & 0x0F,
            octave: byte >> 4,
        }
    }
}

/// Channel state during decoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub kind: ChannelKind,
    /// Octave of the last note
    pub octave: u8,
    pub transpose: i8,
    pub master_transpose: i8,
    pub detune: i16,
    /// Raw pan value, None until set
    pub pan: Option<u8>,
    /// Volume in the destination channel's range, None until set
    pub volume: Option<u8>,
    /// Source instrument number
    pub instrument: Option<u8>,
    pub envelope: Option<Envelope>,
    pub gate: Gate,
    /// Next sounding note continues the previous one
    pub tie: bool,
    pub tempo: u16,
    pub zenlen: u8,
}

impl ChannelState {
    pub fn new(kind: ChannelKind, tempo: u16) -> Self {
        Self {
            kind,
            octave: 4,
            transpose: 0,
            master_transpose: 0,
            detune: 0,
            pan: None,
            volume: None,
            instrument: None,
            envelope: None,
            gate: Gate::default(),
            tie: false,
            tempo,
            zenlen: 96,
        }
    }

    /// Current volume or the channel default
    pub fn current_volume(&self) -> u8 {
        self.volume.unwrap_or_else(|| self.kind.default_volume())
    }

    /// Apply a state-mutating command. `params` has exactly the opcode's arity.
    /// Loop, tempo and note-producing effects are handled by the decoder.
    pub fn apply(&mut self, effect: OpEffect, params: &[u8]) {
        let first = params.first().copied().unwrap_or(0);
        let max = self.kind.max_volume();
        match effect {
            OpEffect::Instrument => self.instrument = Some(first),
            OpEffect::Volume { inverted_on_fm } => {
                let value = if inverted_on_fm && self.kind == ChannelKind::Fm {
                    127u8.saturating_sub(first & 0x7F)
                } else {
                    first
                };
                self.volume = Some(value.min(max));
            }
            OpEffect::VolumeStep { up } => {
                self.step_volume(self.kind.volume_step(), up);
            }
            OpEffect::VolumeBy { up } => self.step_volume(first, up),
            OpEffect::Tie => self.tie = true,
            OpEffect::DetuneWide if params.len() >= 2 => {
                self.detune = i16::from_le_bytes([params[0], params[1]]);
            }
            OpEffect::DetuneNarrow => self.detune = first as i8 as i16,
            OpEffect::Transpose => self.transpose = first as i8,
            OpEffect::RelativeTranspose => {
                self.transpose = self.transpose.saturating_add(first as i8);
            }
            OpEffect::MasterTranspose => self.master_transpose = first as i8,
            OpEffect::SsgEnvelope if params.len() >= 4 => {
                self.envelope = Some(Envelope {
                    attack: params[0],
                    decay: params[1] as i8,
                    sustain: params[2],
                    release: params[3],
                });
            }
            OpEffect::Pan => self.pan = Some(first),
            OpEffect::Zenlen => self.zenlen = first,
            OpEffect::GateCut => {
                // `B1` prefix carries the cut in the following byte
                let cut = if params.len() == 3 { params[1] } else { first };
                self.gate = Gate::CutTicks(cut);
            }
            OpEffect::GateFraction => self.gate = Gate::Fraction(first.min(8)),
            _ => {}
        }
    }

    fn step_volume(&mut self, amount: u8, up: bool) {
        let current = self.current_volume();
        let next = if up {
            current.saturating_add(amount)
        } else {
            current.saturating_sub(amount)
        };
        self.volume = Some(next.min(self.kind.max_volume()));
    }
}
