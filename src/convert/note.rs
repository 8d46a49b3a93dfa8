//! Pitch mapping and note-borne effects

use crate::fur::pattern::{effect, Effect};
use crate::source::ChannelKind;

/// Destination note cut value
pub const NOTE_OFF: u8 = 180;
/// Destination note release value
pub const NOTE_RELEASE: u8 = 181;
/// Highest playable destination note
pub const MAX_NOTE: u8 = 179;
/// Note written on rhythm channels (C-4)
pub const RHYTHM_NOTE: u8 = 108;

/// Octave offset of the destination note numbering for a channel kind
fn octave_offset(kind: ChannelKind) -> i32 {
    match kind {
        ChannelKind::Ssg => 6,
        _ => 5,
    }
}

/// Map a source pitch to a destination note, or None when out of range
pub fn destination_note(kind: ChannelKind, pitch: u8, octave: u8, transpose: i32) -> Option<u8> {
    let value = (octave as i32 + octave_offset(kind)) * 12 + pitch as i32 + transpose;
    if (0..=MAX_NOTE as i32).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}

/// Pitch slide effect for a portamento from `from` to `to` over `duration` ticks
///
/// `E1xy`/`E2xy` with x the slide speed and y the semitone distance (max 15).
pub fn slide_effect(from: u8, to: u8, duration: u32, ticks_per_row: u32) -> Option<Effect> {
    if from == to {
        return None;
    }
    let rows = (duration / ticks_per_row.max(1)).max(1);
    let speed = (32 / rows).clamp(1, 15) as u8;
    let semitones = from.abs_diff(to).min(15);
    let code = if to > from {
        effect::SLIDE_UP
    } else {
        effect::SLIDE_DOWN
    };
    Some(Effect::new(code, (speed << 4) | semitones))
}

/// Stop an active slide
pub fn stop_slide() -> Effect {
    Effect::new(effect::SLIDE_DOWN, 0)
}

/// Panning effect: 1 right, 2 left, 3 both, 0 muted
pub fn pan_effect(pan: u8) -> Effect {
    let value = match pan & 3 {
        1 => 0x0F,
        2 => 0xF0,
        3 => 0xFF,
        _ => 0x00,
    };
    Effect::new(effect::PAN, value)
}

/// Fine pitch effect, 0x80 is centre; four chip units per step
pub fn detune_effect(detune: i16) -> Effect {
    let value = (0x80 + (detune as i32).div_euclid(4)).clamp(0, 255);
    Effect::new(effect::DETUNE, value as u8)
}
