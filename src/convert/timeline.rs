//! Decoded events to destination timelines, and the song-wide tempo merge

use super::channel::{ChannelState, Envelope};
use super::decoder::DecodedChannel;
use super::event::{PerformanceEvent, Timeline, TimelineEvent};
use super::note::{destination_note, detune_effect, pan_effect, slide_effect, stop_slide};
use crate::fur::instrument::{Instrument, InstrumentBank};
use crate::fur::pattern::Effect;
use crate::source::opcode::{FormatTable, OpEffect};
use crate::source::ChannelKind;
use serde::Serialize;
use std::collections::BTreeMap;

/// Builds one destination channel's timeline from a decoded melodic channel
pub struct TimelineBuilder<'a> {
    pub table: &'static FormatTable,
    pub kind: ChannelKind,
    pub ticks_per_row: u32,
    pub bank: &'a mut InstrumentBank,
}

/// Tracking state while walking a channel's events
#[derive(Debug, Default)]
struct NoteTracker {
    /// Release scheduled for the sounding note
    pending: Option<TimelineEvent>,
    /// A note sounds with no release scheduled
    open: bool,
    last_note: Option<u8>,
    /// Instrument of the sounding note has a release macro
    release_macro: bool,
    sliding: bool,
    last_pan: Option<u8>,
    last_detune: i16,
}

impl<'a> TimelineBuilder<'a> {
    pub fn build(&mut self, decoded: &DecodedChannel) -> Timeline {
        let mut timeline = Timeline::new();
        let mut t = NoteTracker::default();

        for ev in &decoded.events {
            let state = &ev.state;
            let transpose = state.transpose as i32 + state.master_transpose as i32;
            match &ev.event {
                PerformanceEvent::Note { rest: true, .. } => {
                    if t.open {
                        timeline.insert(release_event(t.release_macro, ev.tick));
                        t.open = false;
                    }
                    if let Some(p) = t.pending.take() {
                        timeline.insert(p);
                    }
                    t.last_note = None;
                }
                PerformanceEvent::Note {
                    pitch,
                    octave,
                    duration,
                    tied,
                    ..
                } => {
                    let Some(note) = destination_note(self.kind, *pitch, *octave, transpose) else {
                        tracing::debug!("note out of range at tick {}", ev.tick);
                        continue;
                    };
                    if *tied && t.last_note == Some(note) {
                        t.pending = None;
                        schedule_release(&mut t, ev.tick, *duration, state);
                        continue;
                    }
                    if let Some(p) = t.pending.take() {
                        timeline.insert(p);
                    }
                    let mut effects = self.note_effects(&mut t, state);
                    if t.sliding {
                        effects.insert(0, stop_slide());
                        t.sliding = false;
                    }
                    let instrument = self.instrument(state);
                    t.release_macro = self.has_release_macro(instrument);
                    timeline.insert(TimelineEvent::NoteOn {
                        tick: ev.tick,
                        note,
                        instrument,
                        volume: self.volume(state),
                        effects,
                    });
                    t.last_note = Some(note);
                    schedule_release(&mut t, ev.tick, *duration, state);
                }
                PerformanceEvent::Portamento {
                    start,
                    end,
                    duration,
                    tied,
                } => {
                    let from = destination_note(self.kind, start.pitch, start.octave, transpose);
                    let to = destination_note(self.kind, end.pitch, end.octave, transpose);
                    let (Some(from), Some(to)) = (from, to) else {
                        continue;
                    };
                    let slide = slide_effect(from, to, *duration, self.ticks_per_row);
                    if *tied && t.last_note.is_some() {
                        t.pending = None;
                        if let Some(fx) = slide {
                            timeline.insert(TimelineEvent::SlideEffect {
                                tick: ev.tick,
                                effects: vec![fx],
                            });
                        }
                    } else {
                        if let Some(p) = t.pending.take() {
                            timeline.insert(p);
                        }
                        let mut effects = self.note_effects(&mut t, state);
                        effects.extend(slide);
                        let instrument = self.instrument(state);
                        t.release_macro = self.has_release_macro(instrument);
                        timeline.insert(TimelineEvent::NoteOn {
                            tick: ev.tick,
                            note: from,
                            instrument,
                            volume: self.volume(state),
                            effects,
                        });
                    }
                    t.sliding = slide.is_some();
                    t.last_note = Some(to);
                    schedule_release(&mut t, ev.tick, *duration, state);
                }
                PerformanceEvent::Command { opcode, .. } => {
                    let is_note_off = self
                        .table
                        .lookup(*opcode)
                        .is_some_and(|spec| spec.effect == OpEffect::NoteOff);
                    if is_note_off {
                        t.pending = None;
                        if t.last_note.is_some() {
                            timeline.insert(TimelineEvent::NoteOff { tick: ev.tick });
                        }
                        t.open = false;
                        t.last_note = None;
                    }
                }
            }
        }

        if let Some(p) = t.pending.take() {
            timeline.insert(p);
        }
        timeline.suppress_masked_releases();
        timeline
    }

    /// Pan and detune effects, only where they changed since the last note
    fn note_effects(&self, t: &mut NoteTracker, state: &ChannelState) -> Vec<Effect> {
        let mut effects = Vec::new();
        if state.pan != t.last_pan {
            match state.pan {
                Some(pan) if self.kind != ChannelKind::Ssg => effects.push(pan_effect(pan)),
                _ => {}
            }
            t.last_pan = state.pan;
        }
        if state.detune != t.last_detune {
            effects.push(detune_effect(state.detune));
            t.last_detune = state.detune;
        }
        effects
    }

    fn instrument(&mut self, state: &ChannelState) -> Option<u8> {
        match self.kind {
            ChannelKind::Fm => self.bank.fm(state.instrument),
            ChannelKind::Ssg => self.bank.envelope(state.envelope.unwrap_or(Envelope::FLAT)),
            ChannelKind::Rhythm => self.bank.rhythm(),
            ChannelKind::Sample => None,
        }
    }

    fn has_release_macro(&self, instrument: Option<u8>) -> bool {
        matches!(
            instrument.and_then(|i| self.bank.get(i)),
            Some(Instrument::Macro(m)) if m.has_release()
        )
    }

    fn volume(&self, state: &ChannelState) -> Option<u8> {
        state.volume.filter(|&v| v <= self.kind.max_volume())
    }
}

/// Schedule the key-off of a note starting at `tick`, replacing any pending one
fn schedule_release(t: &mut NoteTracker, tick: u32, duration: u32, state: &ChannelState) {
    let sounding = state.gate.sounding_ticks(duration);
    if sounding < duration {
        t.pending = Some(release_event(t.release_macro, tick + sounding));
        t.open = false;
    } else {
        t.pending = None;
        t.open = true;
    }
}

fn release_event(release_macro: bool, tick: u32) -> TimelineEvent {
    if release_macro {
        TimelineEvent::NoteRelease { tick }
    } else {
        TimelineEvent::NoteOff { tick }
    }
}

/// Song-wide tempo changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TempoTimeline {
    /// Tempo at tick 0
    pub initial: u16,
    /// `(tick, tempo)` after tick 0, each a real change
    pub changes: Vec<(u32, u16)>,
}

impl TempoTimeline {
    /// Merge per-channel tempo changes. At equal ticks the later channel wins.
    pub fn merge<'c>(initial: u16, channels: impl IntoIterator<Item = &'c [(u32, u16)]>) -> Self {
        let mut merged: BTreeMap<u32, u16> = BTreeMap::new();
        for changes in channels {
            for &(tick, tempo) in changes {
                merged.insert(tick, tempo);
            }
        }

        let mut start = initial;
        let mut active = initial;
        let mut changes = Vec::new();
        for (tick, tempo) in merged {
            if tempo == active {
                continue;
            }
            if tick == 0 {
                start = tempo;
            } else {
                changes.push((tick, tempo));
            }
            active = tempo;
        }
        Self {
            initial: start,
            changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::channel::{Gate, Pitch};
    use crate::convert::event::DecodedEvent;
    use crate::source::opcode::{MDT, PMD};

    fn state(kind: ChannelKind) -> ChannelState {
        ChannelState::new(kind, 75)
    }

    fn note_ev(tick: u32, pitch: u8, duration: u32, tied: bool, state: &ChannelState) -> DecodedEvent {
        DecodedEvent {
            tick,
            offset: 0,
            event: PerformanceEvent::Note {
                pitch,
                octave: 4,
                duration,
                rest: false,
                tied,
            },
            state: state.clone(),
        }
    }

    fn rest_ev(tick: u32, duration: u32, state: &ChannelState) -> DecodedEvent {
        DecodedEvent {
            tick,
            offset: 0,
            event: PerformanceEvent::Note {
                pitch: 0,
                octave: 4,
                duration,
                rest: true,
                tied: false,
            },
            state: state.clone(),
        }
    }

    fn build(kind: ChannelKind, events: Vec<DecodedEvent>, bank: &mut InstrumentBank) -> Vec<TimelineEvent> {
        let decoded = DecodedChannel {
            events,
            ..DecodedChannel::default()
        };
        TimelineBuilder {
            table: &PMD,
            kind,
            ticks_per_row: 3,
            bank,
        }
        .build(&decoded)
        .into_vec()
    }

    #[test]
    fn test_half_gate_release() {
        let mut s = state(ChannelKind::Fm);
        s.gate = Gate::Fraction(4);
        let mut bank = InstrumentBank::new();
        let events = build(ChannelKind::Fm, vec![note_ev(100, 0, 24, false, &s)], &mut bank);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], TimelineEvent::NoteOff { tick: 112 });
    }

    #[test]
    fn test_ssg_gets_note_release() {
        let mut s = state(ChannelKind::Ssg);
        s.gate = Gate::CutTicks(6);
        s.envelope = Some(Envelope {
            attack: 2,
            decay: -2,
            sustain: 4,
            release: 8,
        });
        let mut bank = InstrumentBank::new();
        let events = build(ChannelKind::Ssg, vec![note_ev(0, 0, 24, false, &s)], &mut bank);
        assert!(matches!(events[0], TimelineEvent::NoteOn { note: 120, instrument: Some(0), .. }));
        assert_eq!(events[1], TimelineEvent::NoteRelease { tick: 18 });
    }

    #[test]
    fn test_tie_cancels_release() {
        let mut s = state(ChannelKind::Fm);
        s.gate = Gate::Fraction(6);
        let mut bank = InstrumentBank::new();
        let events = build(
            ChannelKind::Fm,
            vec![note_ev(0, 0, 24, false, &s), note_ev(24, 0, 24, true, &s)],
            &mut bank,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TimelineEvent::NoteOn { tick: 0, .. }));
        assert_eq!(events[1], TimelineEvent::NoteOff { tick: 42 });
    }

    #[test]
    fn test_tie_to_other_pitch_retriggers() {
        let s = state(ChannelKind::Fm);
        let mut bank = InstrumentBank::new();
        let events = build(
            ChannelKind::Fm,
            vec![note_ev(0, 0, 12, false, &s), note_ev(12, 2, 12, true, &s)],
            &mut bank,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TimelineEvent::NoteOn { tick: 12, note: 110, .. }));
    }

    #[test]
    fn test_rest_keys_off_full_note() {
        let s = state(ChannelKind::Fm);
        let mut bank = InstrumentBank::new();
        let events = build(
            ChannelKind::Fm,
            vec![note_ev(0, 0, 12, false, &s), rest_ev(12, 12, &s), rest_ev(24, 12, &s)],
            &mut bank,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], TimelineEvent::NoteOff { tick: 12 });
    }

    #[test]
    fn test_release_masked_by_next_note() {
        let mut s = state(ChannelKind::Fm);
        s.gate = Gate::Fraction(8);
        let mut bank = InstrumentBank::new();
        let events = build(
            ChannelKind::Fm,
            vec![note_ev(0, 0, 12, false, &s), rest_ev(12, 0, &s), note_ev(12, 4, 12, false, &s)],
            &mut bank,
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.is_release()));
    }

    #[test]
    fn test_pan_and_detune_only_on_change() {
        let mut s = state(ChannelKind::Fm);
        s.pan = Some(2);
        s.detune = 8;
        let mut bank = InstrumentBank::new();
        let events = build(
            ChannelKind::Fm,
            vec![note_ev(0, 0, 6, false, &s), note_ev(6, 0, 6, false, &s)],
            &mut bank,
        );
        let effects: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                TimelineEvent::NoteOn { effects, .. } => Some(effects.len()),
                _ => None,
            })
            .collect();
        assert_eq!(effects, vec![2, 0]);
    }

    #[test]
    fn test_portamento_and_stop() {
        let s = state(ChannelKind::Fm);
        let mut bank = InstrumentBank::new();
        let slide = DecodedEvent {
            tick: 0,
            offset: 0,
            event: PerformanceEvent::Portamento {
                start: Pitch { pitch: 0, octave: 4 },
                end: Pitch { pitch: 4, octave: 4 },
                duration: 12,
                tied: false,
            },
            state: s.clone(),
        };
        let events = build(
            ChannelKind::Fm,
            vec![slide, note_ev(12, 7, 12, false, &s)],
            &mut bank,
        );
        match &events[0] {
            TimelineEvent::NoteOn { note, effects, .. } => {
                assert_eq!(*note, 108);
                assert_eq!(effects, &vec![Effect::new(0xE1, 0x84)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[1] {
            TimelineEvent::NoteOn { effects, .. } => assert_eq!(effects[0], stop_slide()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tied_portamento_is_effect_only() {
        let s = state(ChannelKind::Fm);
        let mut bank = InstrumentBank::new();
        let slide = DecodedEvent {
            tick: 12,
            offset: 0,
            event: PerformanceEvent::Portamento {
                start: Pitch { pitch: 0, octave: 4 },
                end: Pitch { pitch: 0, octave: 3 },
                duration: 12,
                tied: true,
            },
            state: s.clone(),
        };
        let events = build(ChannelKind::Fm, vec![note_ev(0, 0, 12, false, &s), slide], &mut bank);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], TimelineEvent::SlideEffect { tick: 12, effects } if effects[0].code == 0xE2));
    }

    #[test]
    fn test_mdt_forced_note_off() {
        let s = state(ChannelKind::Fm);
        let mut bank = InstrumentBank::new();
        let off = DecodedEvent {
            tick: 6,
            offset: 0,
            event: PerformanceEvent::Command {
                opcode: 0xE3,
                params: Vec::new(),
            },
            state: s.clone(),
        };
        let decoded = DecodedChannel {
            events: vec![note_ev(0, 0, 6, false, &s), off],
            ..DecodedChannel::default()
        };
        let events = TimelineBuilder {
            table: &MDT,
            kind: ChannelKind::Fm,
            ticks_per_row: 6,
            bank: &mut bank,
        }
        .build(&decoded)
        .into_vec();
        assert_eq!(events[1], TimelineEvent::NoteOff { tick: 6 });
    }

    #[test]
    fn test_tempo_merge() {
        let a: Vec<(u32, u16)> = vec![(0, 80), (96, 100), (192, 100)];
        let b: Vec<(u32, u16)> = vec![(96, 120), (288, 120)];
        let tempo = TempoTimeline::merge(75, [a.as_slice(), b.as_slice()]);
        assert_eq!(tempo.initial, 80);
        assert_eq!(tempo.changes, vec![(96, 120), (192, 100), (288, 120)]);
    }

    #[test]
    fn test_tempo_merge_drops_noops() {
        let a: Vec<(u32, u16)> = vec![(0, 75), (48, 75)];
        let tempo = TempoTimeline::merge(75, [a.as_slice()]);
        assert_eq!(tempo.initial, 75);
        assert!(tempo.changes.is_empty());
    }
}
