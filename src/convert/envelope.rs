//! Software envelope to volume macro synthesis
//!
//! The macro holds full volume for the attack, steps down from `15 + decay` once
//! every `sustain` ticks (or holds that level when `sustain` is 0), and stops at the
//! release point until the note is released. The release part steps down once every
//! `release` ticks, or cuts at once when `release` is 0.

use super::channel::Envelope;
use crate::fur::instrument::{Macro, MacroInstrument, MacroKind};

/// Longest macro the destination accepts
pub const MAX_MACRO_LEN: usize = 127;
/// SSG volume ceiling
const MAX_LEVEL: i8 = 15;
const MAX_ATTACK: usize = 32;
const MAX_DECAY: usize = 64;

/// Build the volume macro for an envelope
pub fn volume_macro(env: &Envelope) -> Macro {
    let mut data: Vec<i8> = Vec::with_capacity(MAX_MACRO_LEN);

    let attack = (env.attack as usize).clamp(1, MAX_ATTACK);
    data.resize(attack, MAX_LEVEL);

    let start = (MAX_LEVEL as i32 + env.decay as i32).clamp(0, MAX_LEVEL as i32) as i8;
    let hold = if env.sustain == 0 {
        data.push(start);
        start
    } else {
        let budget = attack + MAX_DECAY;
        let mut level = start;
        while level > 0 && data.len() < budget {
            for _ in 0..env.sustain {
                if data.len() >= budget {
                    break;
                }
                data.push(level);
            }
            level -= 1;
        }
        data.push(0);
        0
    };
    let release_point = data.len() - 1;

    if env.release == 0 || hold == 0 {
        data.push(0);
    } else {
        let steps = hold as usize;
        let room = MAX_MACRO_LEN - data.len();
        let repeat = (env.release as usize).clamp(1, (room / steps).max(1));
        for level in (0..hold).rev() {
            for _ in 0..repeat {
                data.push(level);
            }
        }
    }

    data.truncate(MAX_MACRO_LEN);
    if let Some(last) = data.last_mut() {
        *last = 0;
    }

    Macro {
        kind: MacroKind::Volume,
        data,
        loop_point: None,
        release_point: Some(release_point as u8),
    }
}

/// Display name of an envelope instrument
pub fn envelope_name(env: &Envelope) -> String {
    format!(
        "SSG E{},{},{},{}",
        env.attack, env.decay, env.sustain, env.release
    )
}

/// SSG instrument carrying the envelope's volume macro
pub fn envelope_instrument(env: &Envelope) -> MacroInstrument {
    MacroInstrument {
        name: envelope_name(env),
        volume: Some(volume_macro(env)),
        ..MacroInstrument::default()
    }
}
