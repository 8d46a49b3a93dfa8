pub mod convert;
pub mod error;
pub mod fur;
pub mod source;

pub use convert::{ConvertOptions, Converter};
pub use error::{Error, Recovery, Result};
pub use fur::{Song, SongReport};
pub use source::{ParsedSong, SourceFormat};
