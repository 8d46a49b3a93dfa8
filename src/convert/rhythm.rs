//! Rhythm expansion onto the six rhythm channels
//!
//! PMD K-part notes select R patterns whose drum bitmasks trigger rhythm voices.
//! MDT rhythm notes trigger voice `pitch % 6` directly.

use super::decoder::DecodedChannel;
use super::event::{PerformanceEvent, Timeline, TimelineEvent};
use super::note::RHYTHM_NOTE;
use crate::source::{RhythmPattern, SourceFormat};

/// Rhythm voices: bass drum, snare, top cymbal, hi-hat, tom, rim shot
pub const RHYTHM_VOICES: usize = 6;
/// Destination channel of the first rhythm voice
pub const FIRST_RHYTHM_CHANNEL: usize = 10;

/// Drum bit to rhythm voice
const DRUM_VOICES: [(u16, usize); 11] = [
    (1, 0),    // bass drum
    (2, 1),    // snare 1
    (4, 4),    // low tom
    (8, 4),    // mid tom
    (16, 4),   // high tom
    (32, 5),   // rim shot
    (64, 1),   // snare 2
    (128, 3),  // closed hi-hat
    (256, 3),  // open hi-hat
    (512, 2),  // crash
    (1024, 2), // ride
];

/// Voices triggered by a drum bitmask, each once, in voice order
pub fn voices_for_mask(mask: u16) -> Vec<usize> {
    let mut hit = [false; RHYTHM_VOICES];
    for (bit, voice) in DRUM_VOICES {
        if mask & bit != 0 {
            hit[voice] = true;
        }
    }
    (0..RHYTHM_VOICES).filter(|&v| hit[v]).collect()
}

/// Expands a decoded rhythm channel into one timeline per voice
pub struct RhythmExpander<'a> {
    pub format: SourceFormat,
    pub patterns: &'a [RhythmPattern],
}

impl<'a> RhythmExpander<'a> {
    pub fn expand(&self, decoded: &DecodedChannel, instrument: Option<u8>) -> Vec<Timeline> {
        let mut voices: Vec<Timeline> = (0..RHYTHM_VOICES).map(|_| Timeline::new()).collect();
        let hit = |tick| TimelineEvent::NoteOn {
            tick,
            note: RHYTHM_NOTE,
            instrument,
            volume: None,
            effects: Vec::new(),
        };

        for ev in &decoded.events {
            let PerformanceEvent::Note {
                pitch,
                octave,
                rest: false,
                ..
            } = ev.event
            else {
                continue;
            };
            match self.format {
                SourceFormat::Pmd => {
                    let index = octave as usize * 12 + pitch as usize;
                    let Some(pattern) = self.patterns.get(index) else {
                        tracing::debug!("rhythm pattern R{} not defined", index);
                        continue;
                    };
                    for drum in &pattern.hits {
                        for voice in voices_for_mask(drum.voices) {
                            voices[voice].insert(hit(ev.tick + drum.tick));
                        }
                    }
                }
                SourceFormat::Mdt => {
                    voices[pitch as usize % RHYTHM_VOICES].insert(hit(ev.tick));
                }
            }
        }
        voices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::channel::ChannelState;
    use crate::convert::event::DecodedEvent;
    use crate::source::{ChannelKind, RhythmHit};

    fn note(tick: u32, pitch: u8, octave: u8) -> DecodedEvent {
        DecodedEvent {
            tick,
            offset: 0,
            event: PerformanceEvent::Note {
                pitch,
                octave,
                duration: 24,
                rest: false,
                tied: false,
            },
            state: ChannelState::new(ChannelKind::Rhythm, 75),
        }
    }

    fn ticks(timeline: &Timeline) -> Vec<u32> {
        timeline.iter().map(|e| e.tick()).collect()
    }

    #[test]
    fn test_voice_mapping() {
        assert_eq!(voices_for_mask(1), vec![0]);
        assert_eq!(voices_for_mask(129), vec![0, 3]);
        assert_eq!(voices_for_mask(2 | 64), vec![1]);
        assert_eq!(voices_for_mask(4 | 512 | 32), vec![2, 4, 5]);
        assert!(voices_for_mask(0).is_empty());
    }

    #[test]
    fn test_pmd_pattern_expansion() {
        let patterns = vec![
            RhythmPattern::default(),
            RhythmPattern {
                hits: vec![
                    RhythmHit { tick: 0, voices: 1 | 128 },
                    RhythmHit { tick: 12, voices: 2 },
                ],
                length: 24,
            },
        ];
        let decoded = DecodedChannel {
            events: vec![note(0, 1, 0), note(24, 1, 0), note(48, 0, 0)],
            length: 72,
            ..DecodedChannel::default()
        };
        let expander = RhythmExpander {
            format: SourceFormat::Pmd,
            patterns: &patterns,
        };
        let voices = expander.expand(&decoded, Some(3));
        assert_eq!(ticks(&voices[0]), vec![0, 24]);
        assert_eq!(ticks(&voices[1]), vec![12, 36]);
        assert_eq!(ticks(&voices[3]), vec![0, 24]);
        assert!(voices[2].is_empty());
    }

    #[test]
    fn test_mdt_voice_by_pitch() {
        let decoded = DecodedChannel {
            events: vec![note(0, 0, 4), note(6, 7, 4), note(12, 3, 4)],
            length: 18,
            ..DecodedChannel::default()
        };
        let expander = RhythmExpander {
            format: SourceFormat::Mdt,
            patterns: &[],
        };
        let voices = expander.expand(&decoded, None);
        assert_eq!(ticks(&voices[0]), vec![0]);
        assert_eq!(ticks(&voices[1]), vec![6]);
        assert_eq!(ticks(&voices[3]), vec![12]);
    }
}
