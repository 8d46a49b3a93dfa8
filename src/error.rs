use std::io;

/// Hard failures that abort a whole conversion.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Channel table missing: {0}")]
    MissingChannelTable(String),

    #[error("Invalid channel location for {channel}: {offset:#06x} (file is {len} bytes)")]
    InvalidChannelLocation {
        channel: String,
        offset: usize,
        len: usize,
    },

    #[error("Truncated header: need {needed} bytes, have {len}")]
    TruncatedHeader { needed: usize, len: usize },

    #[error("Unknown source format: {0}")]
    UnknownFormat(String),

    #[error("Malformed pattern data at byte {offset}")]
    MalformedPattern { offset: usize },

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Problems a single channel recovers from. The rest of the song keeps converting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recovery {
    #[error("{channel}: unknown opcode {opcode:#04x} at {offset:#06x}, skipped")]
    MalformedOpcode {
        channel: String,
        offset: usize,
        opcode: u8,
    },

    #[error("{channel}: stream truncated at {offset:#06x}")]
    TruncatedStream { channel: String, offset: usize },

    #[error("{channel}: infinite loop at {offset:#06x} unrolled {iterations} times")]
    UnboundedLoop {
        channel: String,
        offset: usize,
        iterations: u32,
    },

    #[error("{channel}: decode step limit reached at {offset:#06x}")]
    StepLimit { channel: String, offset: usize },

    #[error("channel {channel}: pattern ceiling reached at tick {tick}, remaining events dropped")]
    PatternOverflow { channel: usize, tick: u32 },
}
