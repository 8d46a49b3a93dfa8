//! Opcode tables for the PMD and MDRV2 bytecode formats
//!
//! Every command byte maps to an [`OpcodeSpec`]: how many parameter bytes follow it
//! and what it does to the channel state. A few commands read a sub-opcode to decide
//! their own length; those carry an [`Arity::Resolved`] function instead of a fixed count.

use super::{ChannelKind, SourceFormat};

/// Resolves the parameter count of a data-dependent opcode from the bytes after it
pub type ArityResolver = fn(rest: &[u8], kind: ChannelKind) -> usize;

/// Parameter layout of an opcode
#[derive(Clone, Copy)]
pub enum Arity {
    Fixed(usize),
    Resolved(ArityResolver),
}

impl std::fmt::Debug for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "Fixed({})", n),
            Self::Resolved(_) => f.write_str("Resolved"),
        }
    }
}

impl Arity {
    pub fn resolve(&self, rest: &[u8], kind: ChannelKind) -> usize {
        match self {
            Self::Fixed(n) => *n,
            Self::Resolved(f) => f(rest, kind),
        }
    }
}

/// State mutation selected by an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEffect {
    /// End of channel data
    End,
    /// Rest with an explicit length parameter
    Rest,
    Instrument,
    /// Absolute volume; `inverted_on_fm` means FM channels store attenuation
    Volume { inverted_on_fm: bool },
    /// One volume step (FM 4, SSG 1)
    VolumeStep { up: bool },
    /// Volume change by the parameter
    VolumeBy { up: bool },
    Tempo,
    Tie,
    /// Signed 16-bit little-endian detune
    DetuneWide,
    /// Signed 8-bit detune
    DetuneNarrow,
    /// Loop start; the iteration count is parameter `count_param` if present
    LoopStart { count_param: Option<usize> },
    /// Loop end; the iteration count is parameter `count_param` if present
    LoopEnd { count_param: Option<usize> },
    LoopBreak,
    /// Song loop-back marker at the current position
    LoopMarker,
    /// Song loop-back to the address in the parameters; ends the channel
    LoopTarget,
    Transpose,
    RelativeTranspose,
    MasterTranspose,
    SsgEnvelope,
    Pan,
    Zenlen,
    Portamento,
    /// Gate as ticks cut from the end of each note
    GateCut,
    /// Gate as eighths of each note
    GateFraction,
    /// Immediate key-off
    NoteOff,
    /// Recorded but no tracked state
    Other,
}

/// One row of an opcode table
#[derive(Debug, Clone, Copy)]
pub struct OpcodeSpec {
    pub code: u8,
    pub mnemonic: &'static str,
    pub arity: Arity,
    pub effect: OpEffect,
}

const fn op(code: u8, mnemonic: &'static str, arity: usize, effect: OpEffect) -> OpcodeSpec {
    OpcodeSpec {
        code,
        mnemonic,
        arity: Arity::Fixed(arity),
        effect,
    }
}

const fn op_resolved(
    code: u8,
    mnemonic: &'static str,
    resolver: ArityResolver,
    effect: OpEffect,
) -> OpcodeSpec {
    OpcodeSpec {
        code,
        mnemonic,
        arity: Arity::Resolved(resolver),
        effect,
    }
}

/// Per-format decoding table
#[derive(Debug)]
pub struct FormatTable {
    pub format: SourceFormat,
    /// Bytes below this value are note data (pitch/octave byte plus length byte)
    pub command_threshold: u8,
    /// Pitch nibble that marks an inline rest, if the format has one
    pub rest_nibble: Option<u8>,
    pub opcodes: &'static [OpcodeSpec],
}

impl FormatTable {
    pub fn lookup(&self, code: u8) -> Option<&'static OpcodeSpec> {
        self.opcodes.iter().find(|spec| spec.code == code)
    }

    /// Exact parameter count of `code` given the bytes that follow it
    pub fn arity(&self, code: u8, rest: &[u8], kind: ChannelKind) -> Option<usize> {
        self.lookup(code).map(|spec| spec.arity.resolve(rest, kind))
    }

    pub fn is_note(&self, byte: u8) -> bool {
        byte < self.command_threshold
    }
}

/// Get the table for a format
pub fn table(format: SourceFormat) -> &'static FormatTable {
    match format {
        SourceFormat::Pmd => &PMD,
        SourceFormat::Mdt => &MDT,
    }
}

// =============================================================================
// PMD
// =============================================================================

/// `q`: one byte, or `B1` followed by two more
fn pmd_gate_arity(rest: &[u8], _kind: ChannelKind) -> usize {
    match rest.first() {
        Some(0xB1) => 3,
        _ => 1,
    }
}

/// `t`/`T`: sub-opcodes `FD`..`FF` take a value byte
fn pmd_tempo_arity(rest: &[u8], _kind: ChannelKind) -> usize {
    match rest.first() {
        Some(&sub) if sub >= 0xFD => 2,
        _ => 1,
    }
}

/// Part mask: sub-opcodes `F5` and above take a value byte
fn pmd_mask_arity(rest: &[u8], _kind: ChannelKind) -> usize {
    match rest.first() {
        Some(&sub) if sub >= 0xF5 => 2,
        _ => 1,
    }
}

pub static PMD: FormatTable = FormatTable {
    format: SourceFormat::Pmd,
    command_threshold: 0x80,
    rest_nibble: Some(0x0F),
    opcodes: &PMD_OPCODES,
};

static PMD_OPCODES: [OpcodeSpec; 79] = [
    op(0x80, "end", 0, OpEffect::End),
    op(0xFF, "@", 1, OpEffect::Instrument),
    op_resolved(0xFE, "q", pmd_gate_arity, OpEffect::GateCut),
    op(0xFD, "V", 1, OpEffect::Volume { inverted_on_fm: false }),
    op_resolved(0xFC, "t", pmd_tempo_arity, OpEffect::Tempo),
    op(0xFB, "&", 0, OpEffect::Tie),
    op(0xFA, "D", 2, OpEffect::DetuneWide),
    op(0xF9, "[", 2, OpEffect::LoopStart { count_param: None }),
    op(0xF8, "]", 4, OpEffect::LoopEnd { count_param: Some(0) }),
    op(0xF7, ":", 2, OpEffect::LoopBreak),
    op(0xF6, "L", 0, OpEffect::LoopMarker),
    op(0xF5, "_", 1, OpEffect::Transpose),
    op(0xF4, ")", 0, OpEffect::VolumeStep { up: true }),
    op(0xF3, "(", 0, OpEffect::VolumeStep { up: false }),
    op(0xF2, "M", 4, OpEffect::Other),
    op(0xF1, "*", 1, OpEffect::Other),
    op(0xF0, "E", 4, OpEffect::SsgEnvelope),
    op(0xEF, "y", 2, OpEffect::Other),
    op(0xEE, "w", 1, OpEffect::Other),
    op(0xED, "P", 1, OpEffect::Other),
    op(0xEC, "p", 1, OpEffect::Pan),
    op(0xEB, "\\key", 1, OpEffect::Other),
    op(0xEA, "\\v", 1, OpEffect::Other),
    op(0xE9, "\\pan", 1, OpEffect::Other),
    op(0xE8, "\\V", 1, OpEffect::Other),
    op(0xE7, "__", 1, OpEffect::RelativeTranspose),
    op(0xE6, "\\V+", 1, OpEffect::Other),
    op(0xE5, "\\v+", 2, OpEffect::Other),
    op(0xE4, "#D", 1, OpEffect::Other),
    op(0xE3, ")n", 1, OpEffect::VolumeBy { up: true }),
    op(0xE2, "(n", 1, OpEffect::VolumeBy { up: false }),
    op(0xE1, "#", 1, OpEffect::Other),
    op(0xE0, "##", 1, OpEffect::Other),
    op(0xDF, "C", 1, OpEffect::Zenlen),
    op(0xDE, ")%", 1, OpEffect::VolumeBy { up: true }),
    op(0xDD, "(%", 1, OpEffect::VolumeBy { up: false }),
    op(0xDC, "~", 1, OpEffect::Other),
    op(0xDB, "~+", 1, OpEffect::Other),
    op(0xDA, "{}", 3, OpEffect::Portamento),
    op(0xD9, "#w", 1, OpEffect::Other),
    op(0xD8, "#a", 1, OpEffect::Other),
    op(0xD7, "#f", 1, OpEffect::Other),
    op(0xD6, "MD", 2, OpEffect::Other),
    op(0xD5, "DD", 2, OpEffect::Other),
    op(0xD4, "n", 1, OpEffect::Other),
    op(0xD3, "N", 1, OpEffect::Other),
    op(0xD2, "F", 1, OpEffect::Other),
    op(0xD1, "?", 1, OpEffect::Other),
    op(0xD0, "w+", 1, OpEffect::Other),
    op(0xCF, "s", 1, OpEffect::Other),
    op(0xCE, "@@", 6, OpEffect::Other),
    op(0xCD, "EX", 5, OpEffect::Other),
    op(0xCC, "DX", 1, OpEffect::Other),
    op(0xCB, "MW", 1, OpEffect::Other),
    op(0xCA, "MX", 1, OpEffect::Other),
    op(0xC9, "EE", 1, OpEffect::Other),
    op(0xC8, "sd", 3, OpEffect::Other),
    op(0xC7, "sdd", 3, OpEffect::Other),
    op(0xC6, "FM3", 6, OpEffect::Other),
    op(0xC5, "sk", 1, OpEffect::Other),
    op(0xC4, "Q", 1, OpEffect::GateFraction),
    op(0xC3, "px", 2, OpEffect::Other),
    op(0xC2, "MD#", 1, OpEffect::Other),
    op(0xC1, "&&", 0, OpEffect::Other),
    op_resolved(0xC0, "m", pmd_mask_arity, OpEffect::Other),
    op(0xBF, "MB", 4, OpEffect::Other),
    op(0xBE, "*B", 1, OpEffect::Other),
    op(0xBD, "MDB", 2, OpEffect::Other),
    op(0xBC, "MWB", 1, OpEffect::Other),
    op(0xBB, "MXB", 1, OpEffect::Other),
    op(0xBA, "skB", 1, OpEffect::Other),
    op(0xB9, "MD#B", 1, OpEffect::Other),
    op(0xB8, "O", 2, OpEffect::Other),
    op(0xB7, "MDC", 1, OpEffect::Other),
    op(0xB6, "FB", 1, OpEffect::Other),
    op(0xB5, "sk#", 2, OpEffect::Other),
    op(0xB4, "PPZ", 16, OpEffect::Other),
    op(0xB3, "q#", 1, OpEffect::Other),
    op(0xB2, "_M", 1, OpEffect::MasterTranspose),
];

// =============================================================================
// MDRV2
// =============================================================================

/// Rhythm volume: a flagged single value, or a full set of six voice levels
fn mdt_volume_arity(rest: &[u8], kind: ChannelKind) -> usize {
    if kind != ChannelKind::Rhythm {
        return 1;
    }
    match rest.first() {
        Some(&first) if first & 0x80 != 0 => 2,
        _ => 7,
    }
}

fn mdt_pan_arity(_rest: &[u8], kind: ChannelKind) -> usize {
    if kind == ChannelKind::Rhythm {
        2
    } else {
        1
    }
}

pub static MDT: FormatTable = FormatTable {
    format: SourceFormat::Mdt,
    command_threshold: 0x80,
    rest_nibble: None,
    opcodes: &MDT_OPCODES,
};

static MDT_OPCODES: [OpcodeSpec; 33] = [
    op(0xFF, "end", 0, OpEffect::End),
    op(0x90, "r", 1, OpEffect::Rest),
    op(0x91, "&", 0, OpEffect::Tie),
    op(0xE0, "|:", 1, OpEffect::LoopStart { count_param: Some(0) }),
    op(0xE1, ":", 0, OpEffect::LoopBreak),
    op(0xE2, ":|", 0, OpEffect::LoopEnd { count_param: None }),
    op(0xE3, "k", 0, OpEffect::NoteOff),
    op(0xE4, "[", 1, OpEffect::LoopStart { count_param: Some(0) }),
    op(0xE5, "]", 0, OpEffect::LoopEnd { count_param: None }),
    op(0xE6, "D", 1, OpEffect::DetuneNarrow),
    op(0xE7, "K", 1, OpEffect::Transpose),
    op(0xE8, "MA", 4, OpEffect::Other),
    op(0xE9, "t", 1, OpEffect::Tempo),
    op(0xEA, "q", 1, OpEffect::GateFraction),
    op(0xEB, "@", 1, OpEffect::Instrument),
    op_resolved(0xEC, "v", mdt_volume_arity, OpEffect::Volume { inverted_on_fm: true }),
    op(0xED, "MP", 4, OpEffect::Other),
    op(0xEE, "y", 2, OpEffect::Other),
    op(0xEF, "w", 1, OpEffect::Other),
    op(0xF0, "F", 1, OpEffect::Other),
    op_resolved(0xF1, "p", mdt_pan_arity, OpEffect::Pan),
    op(0xF2, "{}", 4, OpEffect::Other),
    op(0xF3, "L", 2, OpEffect::LoopTarget),
    op(0xF4, ")", 1, OpEffect::VolumeBy { up: true }),
    op(0xF5, "(", 1, OpEffect::VolumeBy { up: false }),
    op(0xF6, "[:", 3, OpEffect::LoopStart { count_param: Some(0) }),
    op(0xF7, ":]", 3, OpEffect::LoopEnd { count_param: None }),
    op(0xF8, "S", 1, OpEffect::Other),
    op(0xF9, "|", 2, OpEffect::LoopBreak),
    op(0xFA, "call", 2, OpEffect::Other),
    op(0xFB, "MPS", 4, OpEffect::Other),
    op(0xFC, "MAS", 4, OpEffect::Other),
    op(0xFD, "LFO", 4, OpEffect::Other),
];
