//! Channel bytecode decoder
//!
//! Walks one channel's byte range with the format's opcode table, unrolls loops and
//! produces [`DecodedEvent`]s with absolute start ticks. Problems in the stream are
//! recorded as [`Recovery`] values; decoding never fails outright.

use super::channel::{ChannelState, Pitch};
use super::event::{DecodedEvent, PerformanceEvent};
use super::ConvertOptions;
use crate::error::Recovery;
use crate::source::opcode::{FormatTable, OpEffect};
use crate::source::RawChannel;
use std::collections::HashMap;

/// An active loop during decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopFrame {
    /// Cursor just after the loop-start opcode
    pub start: usize,
    /// Cursor of the matching loop-end opcode
    pub end: usize,
    /// Cursor just after the matching loop-end
    pub after: usize,
    pub total: u32,
    pub done: u32,
}

/// Matching loop-end found by the pre-scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoopEnd {
    at: usize,
    after: usize,
    count: Option<u8>,
}

/// Result of decoding one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedChannel {
    pub events: Vec<DecodedEvent>,
    /// Tick after the last event
    pub length: u32,
    /// Song loop-back tick, if the channel has a loop marker
    pub loop_tick: Option<u32>,
    /// `(tick, tempo)` in decode order
    pub tempo_changes: Vec<(u32, u16)>,
    pub recoveries: Vec<Recovery>,
}

impl DecodedChannel {
    /// Number of sounding notes
    pub fn note_count(&self) -> usize {
        self.events.iter().filter(|e| e.event.is_sounding()).count()
    }
}

/// Decoder for one channel
pub struct ChannelDecoder<'a> {
    table: &'static FormatTable,
    data: &'a [u8],
    channel: &'a RawChannel,
    options: &'a ConvertOptions,
}

impl<'a> ChannelDecoder<'a> {
    pub fn new(
        table: &'static FormatTable,
        data: &'a [u8],
        channel: &'a RawChannel,
        options: &'a ConvertOptions,
    ) -> Self {
        Self {
            table,
            data,
            channel,
            options,
        }
    }

    fn end(&self) -> usize {
        self.channel.end.min(self.data.len())
    }

    /// Decode the whole channel
    pub fn decode(&self) -> DecodedChannel {
        let end = self.end();
        let kind = self.channel.kind;
        let mut out = DecodedChannel::default();
        let mut state = ChannelState::new(kind, self.options.initial_tempo);
        let mut loops: Vec<LoopFrame> = Vec::new();
        let mut visited: HashMap<usize, u32> = HashMap::new();
        let mut cursor = self.channel.start;
        let mut tick = 0u32;
        let mut steps = 0usize;

        while cursor < end {
            steps += 1;
            if steps > self.options.max_decode_steps {
                self.recover(
                    &mut out,
                    Recovery::StepLimit {
                        channel: self.channel.name.clone(),
                        offset: cursor,
                    },
                );
                break;
            }
            visited.entry(cursor).or_insert(tick);
            let byte = self.data[cursor];

            if self.table.is_note(byte) {
                let Some(&length) = self.data.get(cursor + 1).filter(|_| cursor + 1 < end) else {
                    self.truncated(&mut out, cursor);
                    break;
                };
                let pitch = byte & 0x0F;
                let octave = (byte >> 4) & 0x07;
                let rest = self.table.rest_nibble == Some(pitch) || pitch > 11;
                let tied = state.tie && !rest;
                if !rest {
                    state.octave = octave;
                    state.tie = false;
                }
                let event = PerformanceEvent::Note {
                    pitch: if rest { 0 } else { pitch },
                    octave,
                    duration: length as u32,
                    rest,
                    tied,
                };
                self.push(&mut out, tick, cursor, event, &state);
                tick += length as u32;
                cursor += 2;
                continue;
            }

            let Some(spec) = self.table.lookup(byte) else {
                self.recover(
                    &mut out,
                    Recovery::MalformedOpcode {
                        channel: self.channel.name.clone(),
                        offset: cursor,
                        opcode: byte,
                    },
                );
                cursor += 1;
                continue;
            };
            let arity = spec.arity.resolve(&self.data[cursor + 1..end], kind);
            let next = cursor + 1 + arity;
            if next > end {
                self.truncated(&mut out, cursor);
                break;
            }
            let params = &self.data[cursor + 1..next];

            match spec.effect {
                OpEffect::End => break,
                OpEffect::Rest => {
                    let length = params.first().copied().unwrap_or(0) as u32;
                    let event = PerformanceEvent::Note {
                        pitch: 0,
                        octave: state.octave,
                        duration: length,
                        rest: true,
                        tied: false,
                    };
                    self.push(&mut out, tick, cursor, event, &state);
                    tick += length;
                    cursor = next;
                }
                OpEffect::LoopStart { count_param } => {
                    cursor = next;
                    let Some(loop_end) = self.find_loop_end(next) else {
                        tracing::debug!("{}: unmatched loop start at {:#06x}", self.channel.name, cursor);
                        continue;
                    };
                    let count = count_param
                        .and_then(|i| params.get(i).copied())
                        .or(loop_end.count)
                        .unwrap_or(0);
                    let total = if count == 0 {
                        let iterations = self.options.infinite_loop_iterations.max(1);
                        self.recover(
                            &mut out,
                            Recovery::UnboundedLoop {
                                channel: self.channel.name.clone(),
                                offset: cursor - 1 - arity,
                                iterations,
                            },
                        );
                        iterations
                    } else {
                        count as u32
                    };
                    loops.push(LoopFrame {
                        start: next,
                        end: loop_end.at,
                        after: loop_end.after,
                        total,
                        done: 0,
                    });
                }
                OpEffect::LoopEnd { .. } => {
                    cursor = next;
                    if let Some(frame) = loops.last_mut() {
                        frame.done += 1;
                        if frame.done < frame.total {
                            cursor = frame.start;
                        } else {
                            loops.pop();
                        }
                    }
                }
                OpEffect::LoopBreak => {
                    cursor = next;
                    if let Some(frame) = loops.last() {
                        if frame.done + 1 >= frame.total {
                            cursor = frame.after;
                            loops.pop();
                        }
                    }
                }
                OpEffect::LoopMarker => {
                    out.loop_tick.get_or_insert(tick);
                    cursor = next;
                }
                OpEffect::LoopTarget => {
                    let target = u16::from_le_bytes([params[0], params[1]]) as usize;
                    let loop_tick = visited.get(&target).copied().unwrap_or(0);
                    out.loop_tick.get_or_insert(loop_tick);
                    break;
                }
                OpEffect::Tempo => {
                    let tempo = next_tempo(params, state.tempo);
                    state.tempo = tempo;
                    out.tempo_changes.push((tick, tempo));
                    let event = PerformanceEvent::Command {
                        opcode: byte,
                        params: params.to_vec(),
                    };
                    self.push(&mut out, tick, cursor, event, &state);
                    cursor = next;
                }
                OpEffect::Portamento => {
                    let duration = params[2] as u32;
                    let event = PerformanceEvent::Portamento {
                        start: Pitch::from_packed(params[0]),
                        end: Pitch::from_packed(params[1]),
                        duration,
                        tied: state.tie,
                    };
                    state.tie = false;
                    state.octave = Pitch::from_packed(params[1]).octave;
                    self.push(&mut out, tick, cursor, event, &state);
                    tick += duration;
                    cursor = next;
                }
                effect => {
                    state.apply(effect, params);
                    let event = PerformanceEvent::Command {
                        opcode: byte,
                        params: params.to_vec(),
                    };
                    self.push(&mut out, tick, cursor, event, &state);
                    cursor = next;
                }
            }
        }

        out.length = tick;
        out
    }

    /// Scan forward from `from` for the loop-end matching an already-read loop-start
    fn find_loop_end(&self, from: usize) -> Option<LoopEnd> {
        let end = self.end();
        let mut depth = 1u32;
        let mut pos = from;
        while pos < end {
            let byte = self.data[pos];
            if self.table.is_note(byte) {
                pos += 2;
                continue;
            }
            let Some(spec) = self.table.lookup(byte) else {
                pos += 1;
                continue;
            };
            let next = pos + 1 + spec.arity.resolve(&self.data[pos + 1..end], self.channel.kind);
            if next > end {
                return None;
            }
            match spec.effect {
                OpEffect::LoopStart { .. } => depth += 1,
                OpEffect::LoopEnd { count_param } => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(LoopEnd {
                            at: pos,
                            after: next,
                            count: count_param.map(|i| self.data[pos + 1 + i]),
                        });
                    }
                }
                OpEffect::End | OpEffect::LoopTarget => return None,
                _ => {}
            }
            pos = next;
        }
        None
    }

    fn push(
        &self,
        out: &mut DecodedChannel,
        tick: u32,
        offset: usize,
        event: PerformanceEvent,
        state: &ChannelState,
    ) {
        out.events.push(DecodedEvent {
            tick,
            offset,
            event,
            state: state.clone(),
        });
    }

    fn truncated(&self, out: &mut DecodedChannel, offset: usize) {
        self.recover(
            out,
            Recovery::TruncatedStream {
                channel: self.channel.name.clone(),
                offset,
            },
        );
    }

    fn recover(&self, out: &mut DecodedChannel, recovery: Recovery) {
        tracing::warn!("{}", recovery);
        out.recoveries.push(recovery);
    }
}

/// Tempo after a tempo command. Sub-opcode `FF` sets the value, `FE`/`FD` add a
/// signed amount. A single parameter is an absolute value.
fn next_tempo(params: &[u8], current: u16) -> u16 {
    let value = match params {
        [0xFF, value] => *value as i32,
        [0xFE | 0xFD, delta] => current as i32 + *delta as i8 as i32,
        [value, ..] => *value as i32,
        [] => current as i32,
    };
    value.clamp(1, 255) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::opcode::{MDT, PMD};
    use crate::source::ChannelKind;

    fn channel(data: &[u8], kind: ChannelKind) -> RawChannel {
        RawChannel {
            name: "test".to_string(),
            kind,
            start: 0,
            end: data.len(),
            dest: 0,
        }
    }

    fn decode(table: &'static FormatTable, data: &[u8]) -> DecodedChannel {
        decode_with(table, data, &ConvertOptions::default())
    }

    fn decode_with(table: &'static FormatTable, data: &[u8], options: &ConvertOptions) -> DecodedChannel {
        let ch = channel(data, ChannelKind::Fm);
        ChannelDecoder::new(table, data, &ch, options).decode()
    }

    /// (tick, pitch, duration) of sounding notes
    fn notes(decoded: &DecodedChannel) -> Vec<(u32, u8, u32)> {
        decoded
            .events
            .iter()
            .filter_map(|e| match e.event {
                PerformanceEvent::Note { pitch, duration, rest: false, .. } => {
                    Some((e.tick, pitch, duration))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_loop_unrolling() {
        // C4 12, [ D 6 ]3, E 6
        let data = [0x40, 12, 0xF9, 0, 0, 0x42, 6, 0xF8, 3, 0, 0, 0, 0x44, 6, 0x80];
        let decoded = decode(&PMD, &data);
        assert_eq!(
            notes(&decoded),
            vec![(0, 0, 12), (12, 2, 6), (18, 2, 6), (24, 2, 6), (30, 4, 6)]
        );
        assert_eq!(decoded.length, 36);
        assert!(decoded.recoveries.is_empty());
    }

    #[test]
    fn test_timeline_continuity() {
        let data = [0x40, 12, 0x4F, 6, 0xFD, 100, 0xF9, 0, 0, 0x42, 6, 0x0F, 3, 0xF8, 2, 0, 0, 0, 0x80];
        let decoded = decode(&PMD, &data);
        for pair in decoded.events.windows(2) {
            assert_eq!(pair[0].tick + pair[0].event.duration(), pair[1].tick);
        }
        let last = decoded.events.last().unwrap();
        assert_eq!(last.tick + last.event.duration(), decoded.length);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let data = [0xFF, 1, 0x40, 12, 0xF9, 0, 0, 0x42, 6, 0xF7, 0, 0, 0x43, 6, 0xF8, 0, 0, 0, 0, 0x80];
        let first = decode(&PMD, &data);
        let second = decode(&PMD, &data);
        assert_eq!(first, second);
    }

    #[test]
    fn test_loop_break_skips_tail() {
        // [ C 6 : D 6 ]3 -> C D C D C
        let data = [0xF9, 0, 0, 0x40, 6, 0xF7, 0, 0, 0x42, 6, 0xF8, 3, 0, 0, 0, 0x80];
        let pitches: Vec<u8> = notes(&decode(&PMD, &data)).iter().map(|n| n.1).collect();
        assert_eq!(pitches, vec![0, 2, 0, 2, 0]);
    }

    #[test]
    fn test_nested_loops() {
        // [ [ C 6 ]2 D 6 ]2
        let data = [
            0xF9, 0, 0, 0xF9, 0, 0, 0x40, 6, 0xF8, 2, 0, 0, 0, 0x42, 6, 0xF8, 2, 0, 0, 0, 0x80,
        ];
        let pitches: Vec<u8> = notes(&decode(&PMD, &data)).iter().map(|n| n.1).collect();
        assert_eq!(pitches, vec![0, 0, 2, 0, 0, 2]);
    }

    #[test]
    fn test_zero_count_loop_uses_policy() {
        let data = [0xF9, 0, 0, 0x40, 6, 0xF8, 0, 0, 0, 0, 0x80];
        let decoded = decode(&PMD, &data);
        assert_eq!(notes(&decoded).len(), 2);
        assert!(matches!(
            decoded.recoveries[0],
            Recovery::UnboundedLoop { iterations: 2, .. }
        ));

        let options = ConvertOptions {
            infinite_loop_iterations: 4,
            ..ConvertOptions::default()
        };
        assert_eq!(notes(&decode_with(&PMD, &data, &options)).len(), 4);
    }

    #[test]
    fn test_unknown_opcode_skipped() {
        let data = [0x40, 6, 0x81, 0x42, 6, 0x80];
        let decoded = decode(&PMD, &data);
        assert_eq!(notes(&decoded).len(), 2);
        assert_eq!(
            decoded.recoveries,
            vec![Recovery::MalformedOpcode {
                channel: "test".to_string(),
                offset: 2,
                opcode: 0x81
            }]
        );
    }

    #[test]
    fn test_truncated_stream() {
        let data = [0x40, 6, 0xFA, 0x01];
        let decoded = decode(&PMD, &data);
        assert_eq!(notes(&decoded).len(), 1);
        assert!(matches!(
            decoded.recoveries[0],
            Recovery::TruncatedStream { offset: 2, .. }
        ));
    }

    #[test]
    fn test_step_limit() {
        let data = [0x40, 6, 0x42, 6, 0x44, 6, 0x80];
        let options = ConvertOptions {
            max_decode_steps: 2,
            ..ConvertOptions::default()
        };
        let decoded = decode_with(&PMD, &data, &options);
        assert_eq!(notes(&decoded).len(), 2);
        assert!(matches!(decoded.recoveries[0], Recovery::StepLimit { offset: 4, .. }));
    }

    #[test]
    fn test_tie_and_rest() {
        // C 6 & C 6, rest 6
        let data = [0x40, 6, 0xFB, 0x40, 6, 0x0F, 6, 0x80];
        let decoded = decode(&PMD, &data);
        let flags: Vec<(bool, bool)> = decoded
            .events
            .iter()
            .filter_map(|e| match e.event {
                PerformanceEvent::Note { rest, tied, .. } => Some((rest, tied)),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![(false, false), (false, true), (true, false)]);
        assert_eq!(decoded.length, 18);
    }

    #[test]
    fn test_state_snapshot() {
        let data = [0xFF, 3, 0xFD, 90, 0xF5, 0xFE, 0x40, 6, 0x80];
        let decoded = decode(&PMD, &data);
        let note = decoded.events.last().unwrap();
        assert_eq!(note.state.instrument, Some(3));
        assert_eq!(note.state.volume, Some(90));
        assert_eq!(note.state.transpose, -2);
        assert_eq!(note.offset, 6);
    }

    #[test]
    fn test_pmd_loop_marker_and_tempo() {
        let data = [0x40, 24, 0xF6, 0xFC, 0xFF, 120, 0x42, 24, 0xFC, 0xFE, 0xF6, 0x80];
        let decoded = decode(&PMD, &data);
        assert_eq!(decoded.loop_tick, Some(24));
        assert_eq!(decoded.tempo_changes, vec![(24, 120), (48, 110)]);
    }

    #[test]
    fn test_mdt_rest_and_loops() {
        // E4 count 2: C 6, E5; rest 12; F3 back to the loop body
        let data = [0xE4, 2, 0x40, 6, 0xE5, 0x90, 12, 0xF3, 2, 0];
        let decoded = decode(&MDT, &data);
        assert_eq!(notes(&decoded), vec![(0, 0, 6), (6, 0, 6)]);
        assert_eq!(decoded.length, 24);
        assert_eq!(decoded.loop_tick, Some(0));
    }

    #[test]
    fn test_mdt_lfo_parameters_skipped() {
        // C 6, hardware LFO with four parameter bytes, D 6
        let data = [0x40, 6, 0xFD, 1, 2, 3, 4, 0x42, 6, 0xFF];
        let decoded = decode(&MDT, &data);
        assert_eq!(notes(&decoded), vec![(0, 0, 6), (6, 2, 6)]);
        assert_eq!(decoded.length, 12);
        assert!(decoded.recoveries.is_empty());
    }

    #[test]
    fn test_mdt_loop_target_unvisited() {
        let data = [0x40, 6, 0xF3, 0x00, 0x10];
        let decoded = decode(&MDT, &data);
        assert_eq!(decoded.loop_tick, Some(0));
        let data = [0x40, 6, 0x42, 6, 0xF3, 0x02, 0x00];
        assert_eq!(decode(&MDT, &data).loop_tick, Some(6));
    }

    #[test]
    fn test_portamento() {
        let data = [0xDA, 0x40, 0x44, 12, 0x80];
        let decoded = decode(&PMD, &data);
        assert_eq!(
            decoded.events[0].event,
            PerformanceEvent::Portamento {
                start: Pitch { pitch: 0, octave: 4 },
                end: Pitch { pitch: 4, octave: 4 },
                duration: 12,
                tied: false,
            }
        );
        assert_eq!(decoded.length, 12);
    }

    #[test]
    fn test_next_tempo() {
        assert_eq!(next_tempo(&[200], 75), 200);
        assert_eq!(next_tempo(&[0xFF, 90], 75), 90);
        assert_eq!(next_tempo(&[0xFD, 0xFB], 75), 70);
        assert_eq!(next_tempo(&[0xFE, 0x80], 75), 1);
    }
}
