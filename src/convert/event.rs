//! Decoded performance events and the per-channel timeline

use super::channel::{ChannelState, Pitch};
use crate::fur::pattern::Effect;
use std::collections::BTreeMap;

/// One decoded bytecode event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformanceEvent {
    Note {
        /// Pitch class 0-11
        pitch: u8,
        octave: u8,
        duration: u32,
        rest: bool,
        /// Continues the previous note
        tied: bool,
    },
    /// A command that produced no sound, with its parameter bytes
    Command { opcode: u8, params: Vec<u8> },
    /// Pitch slide from `start` to `end` over `duration` ticks
    Portamento {
        start: Pitch,
        end: Pitch,
        duration: u32,
        tied: bool,
    },
}

impl PerformanceEvent {
    /// Ticks this event advances the channel
    pub fn duration(&self) -> u32 {
        match self {
            Self::Note { duration, .. } | Self::Portamento { duration, .. } => *duration,
            Self::Command { .. } => 0,
        }
    }

    pub fn is_sounding(&self) -> bool {
        matches!(
            self,
            Self::Note { rest: false, .. } | Self::Portamento { .. }
        )
    }
}

/// Event with timing, source position and the state it was decoded under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Start tick
    pub tick: u32,
    /// Byte offset of the opcode in the file image
    pub offset: usize,
    pub event: PerformanceEvent,
    pub state: ChannelState,
}

/// Event placed on a destination channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    NoteOn {
        tick: u32,
        note: u8,
        instrument: Option<u8>,
        volume: Option<u8>,
        effects: Vec<Effect>,
    },
    /// Enter the instrument's release phase
    NoteRelease { tick: u32 },
    /// Cut the note
    NoteOff { tick: u32 },
    /// Effects with no note
    SlideEffect { tick: u32, effects: Vec<Effect> },
    TempoChange { tick: u32, tempo: u16 },
    /// Jump to an order
    LoopJump { tick: u32, order: u8 },
}

impl TimelineEvent {
    pub fn tick(&self) -> u32 {
        match self {
            Self::NoteOn { tick, .. }
            | Self::NoteRelease { tick }
            | Self::NoteOff { tick }
            | Self::SlideEffect { tick, .. }
            | Self::TempoChange { tick, .. }
            | Self::LoopJump { tick, .. } => *tick,
        }
    }

    /// Order among events at the same tick: effects, then notes, then releases
    pub fn priority(&self) -> u8 {
        match self {
            Self::SlideEffect { .. } | Self::TempoChange { .. } | Self::LoopJump { .. } => 0,
            Self::NoteOn { .. } => 1,
            Self::NoteRelease { .. } | Self::NoteOff { .. } => 2,
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self, Self::NoteRelease { .. } | Self::NoteOff { .. })
    }
}

/// Tick-sorted event list. Events with equal tick and priority keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: BTreeMap<(u32, u8), Vec<TimelineEvent>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event into the timeline
    pub fn insert(&mut self, event: TimelineEvent) {
        self.events
            .entry((event.tick(), event.priority()))
            .or_default()
            .push(event);
    }

    /// Get all events in order
    pub fn iter(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events.values().flatten()
    }

    /// Drop releases that land on a tick where a note starts
    pub fn suppress_masked_releases(&mut self) {
        let note_ticks: Vec<u32> = self
            .events
            .keys()
            .filter(|(_, priority)| *priority == 1)
            .map(|(tick, _)| *tick)
            .collect();
        for tick in note_ticks {
            self.events.remove(&(tick, 2));
        }
    }

    /// Check if the timeline has no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of NoteOn events
    pub fn note_count(&self) -> usize {
        self.iter()
            .filter(|e| matches!(e, TimelineEvent::NoteOn { .. }))
            .count()
    }

    /// Get the last event tick
    pub fn last_tick(&self) -> Option<u32> {
        self.events.keys().next_back().map(|(tick, _)| *tick)
    }

    pub fn into_vec(self) -> Vec<TimelineEvent> {
        self.events.into_values().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(tick: u32, note: u8) -> TimelineEvent {
        TimelineEvent::NoteOn {
            tick,
            note,
            instrument: None,
            volume: None,
            effects: Vec::new(),
        }
    }

    #[test]
    fn test_same_tick_ordering() {
        let mut timeline = Timeline::new();
        timeline.insert(TimelineEvent::NoteOff { tick: 12 });
        timeline.insert(note(12, 60));
        timeline.insert(TimelineEvent::TempoChange { tick: 12, tempo: 90 });
        timeline.insert(note(0, 48));
        let order: Vec<u8> = timeline.iter().map(|e| e.priority()).collect();
        assert_eq!(order, vec![1, 0, 1, 2]);
        assert_eq!(timeline.last_tick(), Some(12));
    }

    #[test]
    fn test_insertion_order_kept() {
        let mut timeline = Timeline::new();
        timeline.insert(note(6, 50));
        timeline.insert(note(6, 51));
        let notes: Vec<u8> = timeline
            .iter()
            .filter_map(|e| match e {
                TimelineEvent::NoteOn { note, .. } => Some(*note),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![50, 51]);
    }

    #[test]
    fn test_release_masked_by_note() {
        let mut timeline = Timeline::new();
        timeline.insert(note(0, 60));
        timeline.insert(TimelineEvent::NoteRelease { tick: 24 });
        timeline.insert(note(24, 62));
        timeline.insert(TimelineEvent::NoteOff { tick: 30 });
        timeline.suppress_masked_releases();
        let events = timeline.into_vec();
        assert_eq!(events.len(), 3);
        assert!(!events[1].is_release());
        assert_eq!(events[2], TimelineEvent::NoteOff { tick: 30 });
    }

    #[test]
    fn test_event_durations() {
        let ev = PerformanceEvent::Note {
            pitch: 0,
            octave: 4,
            duration: 12,
            rest: true,
            tied: false,
        };
        assert_eq!(ev.duration(), 12);
        assert!(!ev.is_sounding());
        let cmd = PerformanceEvent::Command {
            opcode: 0xFF,
            params: vec![1],
        };
        assert_eq!(cmd.duration(), 0);
    }
}
