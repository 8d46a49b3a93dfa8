//! Pattern row data decoder

use super::pattern::{Effect, Row, PATTERN_END};
use crate::error::{Error, Result};

/// Byte cursor over pattern row data
struct RowReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RowReader<'a> {
    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(Error::MalformedPattern { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }
}

/// Decode row data into `(row index, row)` pairs for every non-empty row
pub fn decode_pattern(data: &[u8]) -> Result<Vec<(u32, Row)>> {
    let mut reader = RowReader { data, pos: 0 };
    let mut rows = Vec::new();
    let mut row_index = 0u32;

    loop {
        let mask = reader.read_u8()?;
        if mask == PATTERN_END {
            break;
        }
        if mask & 0x80 != 0 {
            row_index += (mask & 0x7F) as u32 + 2;
            continue;
        }
        if mask == 0 {
            row_index += 1;
            continue;
        }

        let low = if mask & 32 != 0 { reader.read_u8()? } else { 0 };
        let high = if mask & 64 != 0 { reader.read_u8()? } else { 0 };
        let mut effect_mask = low as u16 | (high as u16) << 8;
        if mask & 8 != 0 {
            effect_mask |= 1;
        }
        if mask & 16 != 0 {
            effect_mask |= 2;
        }

        let mut row = Row::default();
        if mask & 1 != 0 {
            row.note = Some(reader.read_u8()?);
        }
        if mask & 2 != 0 {
            row.instrument = Some(reader.read_u8()?);
        }
        if mask & 4 != 0 {
            row.volume = Some(reader.read_u8()?);
        }
        for i in 0..8 {
            let has_code = effect_mask & (1 << (i * 2)) != 0;
            let has_value = effect_mask & (2 << (i * 2)) != 0;
            if !has_code && !has_value {
                continue;
            }
            let code = if has_code { reader.read_u8()? } else { 0 };
            let value = if has_value { reader.read_u8()? } else { 0 };
            row.effects.push(Effect::new(code, value));
        }
        rows.push((row_index, row));
        row_index += 1;
    }

    Ok(rows)
}
