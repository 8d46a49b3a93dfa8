//! Destination instruments and `INS2` serialization

use super::block::BlockWriter;
use crate::convert::channel::Envelope;
use crate::convert::envelope::envelope_instrument;
use crate::source::{FmOperator, FmPatch};
use std::collections::HashMap;

/// Instrument format version written in each block
pub const INSTRUMENT_VERSION: u16 = 228;

/// Destination operator slot `i` takes source register slot `OPERATOR_ORDER[i]`
pub const OPERATOR_ORDER: [usize; 4] = [0, 2, 1, 3];

/// Instrument type ids
pub mod kind {
    pub const FM_OPN: u16 = 1;
    pub const AY: u16 = 6;
    pub const ADPCM_A: u16 = 37;
}

/// Macro slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MacroKind {
    Volume = 0,
    Arpeggio = 1,
    Duty = 2,
    Waveform = 3,
    Pitch = 4,
}

impl MacroKind {
    /// Arpeggio and pitch macros hold signed values
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Arpeggio | Self::Pitch)
    }
}

/// A macro sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    pub kind: MacroKind,
    pub data: Vec<i8>,
    pub loop_point: Option<u8>,
    pub release_point: Option<u8>,
}

impl Macro {
    fn write(&self, out: &mut BlockWriter) {
        // open flag, word size 8-bit unsigned or signed
        let flags = 1 | if self.kind.is_signed() { 1 << 6 } else { 0 };
        out.write_u8(self.kind as u8)
            .write_u8(self.data.len() as u8)
            .write_u8(self.loop_point.unwrap_or(255))
            .write_u8(self.release_point.unwrap_or(255))
            .write_u8(0) // mode
            .write_u8(flags)
            .write_u8(0) // delay
            .write_u8(1); // speed
        for &v in &self.data {
            out.write_u8(v as u8);
        }
    }
}

/// Destination FM operator, already converted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FurOperator {
    /// Detune in offset-3 encoding (3 = none)
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

impl FurOperator {
    /// Convert a chip operator. Chip detune is sign-magnitude: bit 2 is the sign.
    pub fn from_chip(op: &FmOperator) -> Self {
        let magnitude = (op.dt & 3) as i8;
        let signed = if op.dt & 4 != 0 { -magnitude } else { magnitude };
        Self {
            dt: (3 + signed) as u8,
            mul: op.mul & 15,
            tl: op.tl & 127,
            ks: op.ks & 3,
            ar: op.ar & 31,
            am: op.am & 1,
            dr: op.dr & 31,
            sr: op.sr & 31,
            sl: op.sl & 15,
            rr: op.rr & 15,
        }
    }

    /// Packed 8-byte operator record
    pub fn to_bytes(&self) -> [u8; 8] {
        [
            (self.mul & 15) | ((self.dt & 7) << 4),
            self.tl & 127,
            (self.ar & 31) | ((self.ks & 3) << 6),
            (self.dr & 31) | ((self.am & 1) << 7),
            (self.sr & 31) | (2 << 5),
            (self.rr & 15) | ((self.sl & 15) << 4),
            0,
            0,
        ]
    }
}

/// Four-operator FM voice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmInstrument {
    pub name: String,
    pub algorithm: u8,
    pub feedback: u8,
    /// Operators in destination order
    pub operators: [FurOperator; 4],
}

impl FmInstrument {
    pub fn from_patch(patch: &FmPatch) -> Self {
        let mut operators = [FurOperator::default(); 4];
        for (dest, &src) in operators.iter_mut().zip(OPERATOR_ORDER.iter()) {
            *dest = FurOperator::from_chip(&patch.operators[src]);
        }
        Self {
            name: format!("FM @{}", patch.id),
            algorithm: patch.algorithm & 7,
            feedback: patch.feedback & 7,
            operators,
        }
    }

    /// Single sine carrier, used when a song defines no voices
    pub fn fallback() -> Self {
        let carrier = FurOperator {
            dt: 3,
            mul: 1,
            tl: 0,
            ar: 31,
            dr: 0,
            sl: 0,
            rr: 7,
            ..FurOperator::default()
        };
        let silent = FurOperator { tl: 127, ..carrier };
        Self {
            name: "FM Default".to_string(),
            algorithm: 7,
            feedback: 0,
            operators: [carrier, silent, silent, silent],
        }
    }
}

/// Macro-driven instrument (volume, arpeggio, duty, waveform, pitch)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroInstrument {
    pub name: String,
    pub volume: Option<Macro>,
    pub arpeggio: Option<Macro>,
    pub duty: Option<Macro>,
    pub waveform: Option<Macro>,
    pub pitch: Option<Macro>,
}

impl MacroInstrument {
    pub fn macros(&self) -> impl Iterator<Item = &Macro> {
        [&self.volume, &self.arpeggio, &self.duty, &self.waveform, &self.pitch]
            .into_iter()
            .flatten()
    }

    /// True if some macro stops at a release point
    pub fn has_release(&self) -> bool {
        self.macros().any(|m| m.release_point.is_some())
    }
}

/// Destination instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instrument {
    Fm(FmInstrument),
    Macro(MacroInstrument),
    /// Placeholder voice for rhythm channels
    Rhythm { name: String },
}

impl Instrument {
    pub fn name(&self) -> &str {
        match self {
            Self::Fm(fm) => &fm.name,
            Self::Macro(m) => &m.name,
            Self::Rhythm { name } => name,
        }
    }

    pub fn type_id(&self) -> u16 {
        match self {
            Self::Fm(_) => kind::FM_OPN,
            Self::Macro(_) => kind::AY,
            Self::Rhythm { .. } => kind::ADPCM_A,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Fm(_) => "fm",
            Self::Macro(_) => "ssg",
            Self::Rhythm { .. } => "rhythm",
        }
    }

    /// Serialize as an `INS2` block
    pub fn to_block(&self) -> Vec<u8> {
        let mut body = BlockWriter::new();
        body.write_u16(INSTRUMENT_VERSION).write_u16(self.type_id());

        let mut name = BlockWriter::new();
        name.write_str(self.name());
        body.write_bytes(&name.finish_feature(b"NA"));

        match self {
            Self::Fm(fm) => {
                let mut feature = BlockWriter::new();
                feature
                    .write_u8(4 | (0x0F << 4)) // 4 operators, all enabled
                    .write_u8((fm.feedback & 7) | ((fm.algorithm & 7) << 4))
                    .write_u8(0)
                    .write_u8(0)
                    .write_u8(0);
                for op in &fm.operators {
                    feature.write_bytes(&op.to_bytes());
                }
                body.write_bytes(&feature.finish_feature(b"FM"));
            }
            Self::Macro(m) => {
                let mut feature = BlockWriter::new();
                feature.write_u16(8);
                for mac in m.macros() {
                    mac.write(&mut feature);
                }
                feature.write_u8(255);
                body.write_bytes(&feature.finish_feature(b"MA"));
            }
            Self::Rhythm { .. } => {}
        }

        body.write_bytes(b"EN");
        body.finish_block(b"INS2")
    }
}

/// Instrument list with source-id lookup and envelope deduplication
#[derive(Debug, Clone, Default)]
pub struct InstrumentBank {
    instruments: Vec<Instrument>,
    fm_ids: HashMap<u8, u8>,
    fm_fallback: Option<u8>,
    envelopes: HashMap<Envelope, u8>,
    rhythm: Option<u8>,
}

impl InstrumentBank {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, instrument: Instrument) -> Option<u8> {
        let index = u8::try_from(self.instruments.len()).ok()?;
        self.instruments.push(instrument);
        Some(index)
    }

    /// Add every FM patch in file order. A repeated source id keeps its first patch.
    pub fn register_fm_patches(&mut self, patches: &[FmPatch]) {
        for patch in patches {
            if self.fm_ids.contains_key(&patch.id) {
                continue;
            }
            match self.push(Instrument::Fm(FmInstrument::from_patch(patch))) {
                Some(index) => {
                    self.fm_ids.insert(patch.id, index);
                }
                None => {
                    tracing::warn!("instrument limit reached, FM @{} dropped", patch.id);
                    break;
                }
            }
        }
    }

    /// Instrument for a source FM voice number. Songs without voices share one fallback.
    pub fn fm(&mut self, source_id: Option<u8>) -> Option<u8> {
        if let Some(index) = source_id.and_then(|id| self.fm_ids.get(&id)) {
            return Some(*index);
        }
        if !self.fm_ids.is_empty() {
            return None;
        }
        if self.fm_fallback.is_none() {
            self.fm_fallback = self.push(Instrument::Fm(FmInstrument::fallback()));
        }
        self.fm_fallback
    }

    /// Instrument for an envelope tuple, created on first use
    pub fn envelope(&mut self, env: Envelope) -> Option<u8> {
        if let Some(&index) = self.envelopes.get(&env) {
            return Some(index);
        }
        let index = self.push(Instrument::Macro(envelope_instrument(&env)))?;
        self.envelopes.insert(env, index);
        Some(index)
    }

    /// Shared rhythm voice
    pub fn rhythm(&mut self) -> Option<u8> {
        if self.rhythm.is_none() {
            self.rhythm = self.push(Instrument::Rhythm {
                name: "Rhythm".to_string(),
            });
        }
        self.rhythm
    }

    pub fn get(&self, index: u8) -> Option<&Instrument> {
        self.instruments.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn into_instruments(self) -> Vec<Instrument> {
        self.instruments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(id: u8) -> FmPatch {
        let mut operators = [FmOperator::default(); 4];
        for (i, op) in operators.iter_mut().enumerate() {
            op.tl = i as u8 * 10;
            op.mul = 1;
        }
        operators[0].dt = 6;
        FmPatch {
            id,
            algorithm: 4,
            feedback: 5,
            operators,
        }
    }

    #[test]
    fn test_operator_permutation() {
        let fm = FmInstrument::from_patch(&patch(1));
        let tls: Vec<u8> = fm.operators.iter().map(|op| op.tl).collect();
        assert_eq!(tls, vec![0, 20, 10, 30]);
    }

    #[test]
    fn test_detune_conversion() {
        let mut op = FmOperator::default();
        for (raw, expected) in [(0, 3), (1, 4), (3, 6), (4, 3), (5, 2), (7, 0)] {
            op.dt = raw;
            assert_eq!(FurOperator::from_chip(&op).dt, expected, "dt {}", raw);
        }
    }

    #[test]
    fn test_operator_bytes() {
        let op = FurOperator {
            dt: 4,
            mul: 2,
            tl: 35,
            ks: 1,
            ar: 31,
            am: 1,
            dr: 10,
            sr: 3,
            sl: 5,
            rr: 7,
        };
        assert_eq!(op.to_bytes(), [0x42, 35, 0x5F, 0x8A, 0x43, 0x57, 0, 0]);
    }

    #[test]
    fn test_fm_block_layout() {
        let block = Instrument::Fm(FmInstrument::from_patch(&patch(3))).to_block();
        assert_eq!(&block[..4], b"INS2");
        let len = u32::from_le_bytes([block[4], block[5], block[6], block[7]]) as usize;
        assert_eq!(len, block.len() - 8);
        assert_eq!(&block[8..12], &[228, 0, 1, 0]);
        // NA feature: "FM @3\0"
        assert_eq!(&block[12..14], b"NA");
        assert_eq!(&block[16..22], b"FM @3\0");
        assert_eq!(&block[22..24], b"FM");
        assert_eq!(u16::from_le_bytes([block[24], block[25]]), 5 + 32);
        assert_eq!(block[27], 5 | (4 << 4));
        assert_eq!(&block[block.len() - 2..], b"EN");
    }

    #[test]
    fn test_macro_block() {
        let ins = Instrument::Macro(envelope_instrument(&Envelope::FLAT));
        let block = ins.to_block();
        assert_eq!(&block[8..12], &[228, 0, 6, 0]);
        let ma = block.windows(2).position(|w| w == b"MA").unwrap();
        // header size, then volume macro: code 0, len 3, no loop, release 1
        assert_eq!(&block[ma + 4..ma + 6], &[8, 0]);
        assert_eq!(&block[ma + 6..ma + 14], &[0, 3, 255, 1, 0, 1, 0, 1]);
        assert_eq!(&block[ma + 14..ma + 18], &[15, 15, 0, 255]);
    }

    #[test]
    fn test_envelope_dedup() {
        let mut bank = InstrumentBank::new();
        let env = Envelope {
            attack: 2,
            decay: -2,
            sustain: 4,
            release: 8,
        };
        let first = bank.envelope(env);
        let second = bank.envelope(env);
        assert_eq!(first, second);
        assert_eq!(bank.len(), 1);
        let other = bank.envelope(Envelope { release: 9, ..env });
        assert_ne!(first, other);
        assert_eq!(bank.len(), 2);
    }

    #[test]
    fn test_fm_lookup() {
        let mut bank = InstrumentBank::new();
        bank.register_fm_patches(&[patch(5), patch(2), patch(5)]);
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.fm(Some(2)), Some(1));
        assert_eq!(bank.fm(Some(9)), None);
        assert_eq!(bank.fm(None), None);
    }

    #[test]
    fn test_fm_fallback() {
        let mut bank = InstrumentBank::new();
        assert_eq!(bank.fm(Some(0)), Some(0));
        assert_eq!(bank.fm(None), Some(0));
        assert_eq!(bank.len(), 1);
        assert_eq!(bank.get(0).map(|i| i.name()), Some("FM Default"));
    }

    #[test]
    fn test_has_release() {
        assert!(envelope_instrument(&Envelope::FLAT).has_release());
        assert!(!MacroInstrument::default().has_release());
    }
}
