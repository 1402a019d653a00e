//! Streaming decoder for the list-mode event stream.
//!
//! The stream is a sequence of big-endian 32-bit words whose top nibble is
//! the event tag. Bytes may arrive in arbitrary chunks, and the stream may be
//! corrupt or start mid-packet. On any inconsistency the decoder reports an
//! [`LmEvent::Error`] and then skips byte by byte until it sees the
//! stream-alignment word, where decoding resumes.

use log::warn;
use std::fmt::Write as _;

pub const STREAM_ALIGN_WORD: u32 = 0x7071_7273;
pub const MAX_PACKET_WORDS: usize = 16;
pub const MAX_POSITION_AXES: usize = 6;

/// Pending bytes past which the decoder throws its backlog away and resyncs.
pub const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

const TAG_PULSE: u32 = 0x0;
const TAG_PULSE_TOA: u32 = 0x1;
const TAG_ALIGN: u32 = 0x7;
const TAG_SYNC: u32 = 0x8;
const TAG_GATED_STATS: u32 = 0xa;
const TAG_SPATIAL_STATS: u32 = 0xb;
const TAG_POSITION: u32 = 0xc;
const TAG_GATE: u32 = 0xd;
const TAG_PERIODIC_STATS: u32 = 0xe;
const TAG_EXTENDED: u32 = 0xf;

const SUBTYPE_END: u32 = 0xf;
const EXT_ANALOG_STATUS: u32 = 0x0;
const EXT_BUFFER_OVERFLOW: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfArrival {
    /// 12-bit coarse timestamp.
    pub timestamp: u16,
    pub subsample: u8,
    pub in_marked_range: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub amplitude: i32,
    pub invalid: bool,
    pub toa: Option<TimeOfArrival>,
}

/// Body of the three statistics packet kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LmStats {
    pub time_elapsed: u64,
    pub samples_detected: u64,
    pub samples_erased: u64,
    pub pulses_accepted: u32,
    pub pulses_rejected: u32,
    pub input_count_rate: u32,
    pub output_count_rate: u32,
    pub veto_samples: u32,
    /// Fraction scaled by 2^24.
    pub dead_time: u32,
    pub gate_state: Option<bool>,
    pub timestamp: u32,
}

impl LmStats {
    fn apply(&mut self, subtype: u32, payload: u32) {
        let low = |field: &mut u64| *field = (*field & !0xff_ffff) | u64::from(payload);
        let high = |field: &mut u64| *field = (*field & 0xff_ffff) | (u64::from(payload) << 24);
        match subtype {
            0x0 => low(&mut self.time_elapsed),
            0x1 => high(&mut self.time_elapsed),
            0x2 => low(&mut self.samples_detected),
            0x3 => high(&mut self.samples_detected),
            0x4 => low(&mut self.samples_erased),
            0x5 => high(&mut self.samples_erased),
            0x6 => self.pulses_accepted = payload,
            0x7 => self.pulses_rejected = payload,
            0x8 => self.input_count_rate = payload,
            0x9 => self.output_count_rate = payload,
            0xa => self.veto_samples = payload,
            0xb => self.dead_time = payload,
            0xc => self.gate_state = Some(payload & 1 != 0),
            0xf => self.timestamp = payload,
            _ => {}
        }
    }

    pub fn dead_time_fraction(&self) -> f64 {
        f64::from(self.dead_time) / f64::from(1u32 << 24)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub axes: [Option<i32>; MAX_POSITION_AXES],
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LmEvent {
    StreamAlign(u32),
    Pulse(Pulse),
    Sync { timestamp: u32 },
    GatedStats(LmStats),
    SpatialStats(LmStats),
    PeriodicStats(LmStats),
    SpatialPosition(Position),
    GateState { high: bool, timestamp: u32 },
    AnalogStatus { ready: bool, status: u32 },
    InternalBufferOverflow { lost: u32 },
    Error(String),
}

fn tag(word: u32) -> u32 {
    word >> 28
}

fn subtype(word: u32) -> u32 {
    (word >> 24) & 0xf
}

fn payload(word: u32) -> u32 {
    word & 0xff_ffff
}

fn sign_extend_24(value: u32) -> i32 {
    ((value << 8) as i32) >> 8
}

pub fn pulse_word(amplitude: i32, invalid: bool) -> u32 {
    (((amplitude as u32) & 0xff_ffff) << 3) | (u32::from(invalid) << 27)
}

pub fn toa_word(timestamp: u16, subsample: u8, in_marked_range: bool) -> u32 {
    (TAG_PULSE_TOA << 28)
        | (u32::from(in_marked_range) << 20)
        | ((u32::from(timestamp) & 0xfff) << 8)
        | u32::from(subsample)
}

pub fn sync_word(timestamp: u32) -> u32 {
    (TAG_SYNC << 28) | (timestamp & 0xff_ffff)
}

pub fn gate_word(high: bool, timestamp: u32) -> u32 {
    (TAG_GATE << 28) | (u32::from(high) << 24) | (timestamp & 0xff_ffff)
}

/// Builds one numbered packet of kind `tag` (0xa, 0xb, 0xc or 0xe).
pub fn numbered_packet(tag: u32, fields: &[(u32, u32)], timestamp: u32) -> Vec<u32> {
    fields
        .iter()
        .map(|&(sub, value)| (tag << 28) | ((sub & 0xf) << 24) | (value & 0xff_ffff))
        .chain(std::iter::once(
            (tag << 28) | (SUBTYPE_END << 24) | (timestamp & 0xff_ffff),
        ))
        .collect()
}

pub fn stats_packet(tag: u32, stats: &LmStats) -> Vec<u32> {
    let mut fields = vec![
        (0x0, (stats.time_elapsed & 0xff_ffff) as u32),
        (0x1, (stats.time_elapsed >> 24) as u32),
        (0x2, (stats.samples_detected & 0xff_ffff) as u32),
        (0x3, (stats.samples_detected >> 24) as u32),
        (0x4, (stats.samples_erased & 0xff_ffff) as u32),
        (0x5, (stats.samples_erased >> 24) as u32),
        (0x6, stats.pulses_accepted),
        (0x7, stats.pulses_rejected),
        (0x8, stats.input_count_rate),
        (0x9, stats.output_count_rate),
        (0xa, stats.veto_samples),
        (0xb, stats.dead_time),
    ];
    if let Some(gate) = stats.gate_state {
        fields.push((0xc, u32::from(gate)));
    }
    numbered_packet(tag, &fields, stats.timestamp)
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

enum Step {
    Event(LmEvent, usize),
    Corrupt(usize, &'static str),
    NeedMore,
}

/// Incremental list-mode decoder.
#[derive(Debug, Default)]
pub struct LmDecoder {
    buf: Vec<u8>,
    start: usize,
    /// Stream offset of `buf[0]`.
    base: u64,
    scanning: bool,
    end_of_stream: bool,
    errors: u64,
}

impl LmDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.base += self.start as u64;
            self.start = 0;
        }
        if self.pending() + bytes.len() > MAX_PENDING_BYTES {
            warn!(
                "list-mode backlog over {} bytes, discarding and resyncing",
                MAX_PENDING_BYTES
            );
            self.base += self.buf.len() as u64;
            self.buf.clear();
            self.start = 0;
            self.scanning = true;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Declares that no more bytes will arrive; a trailing pulse is then
    /// emitted without waiting for a time-of-arrival suffix.
    pub fn finish(&mut self) {
        self.end_of_stream = true;
    }

    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Stream offset of the next undecoded byte.
    pub fn position(&self) -> u64 {
        self.base + self.start as u64
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Next decoded record, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Option<LmEvent> {
        loop {
            if self.scanning && !self.scan_for_align() {
                return None;
            }
            match self.step() {
                Step::Event(event, used) => {
                    self.start += used;
                    return Some(event);
                }
                Step::NeedMore => return None,
                Step::Corrupt(words, reason) => return Some(self.corrupt(words, reason)),
            }
        }
    }

    /// Pushes `bytes` and collects every record that became available.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<LmEvent> {
        self.push(bytes);
        std::iter::from_fn(|| self.next_event()).collect()
    }

    /// Moves to the next alignment word. Returns false if none is buffered.
    fn scan_for_align(&mut self) -> bool {
        let avail = &self.buf[self.start..];
        let target = STREAM_ALIGN_WORD.to_be_bytes();
        match avail.windows(4).position(|w| w == target) {
            Some(i) => {
                self.start += i;
                self.scanning = false;
                true
            }
            None => {
                self.start += avail.len().saturating_sub(3);
                false
            }
        }
    }

    fn word(&self, index: usize) -> Option<u32> {
        let at = self.start + index * 4;
        let bytes = self.buf.get(at..at + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn corrupt(&mut self, words: usize, reason: &str) -> LmEvent {
        let avail = &self.buf[self.start..];
        let dump = &avail[..(words * 4).min(avail.len())];
        let message = format!(
            "list-mode stream corrupt at offset {} ({}): {}",
            self.position(),
            reason,
            hex_dump(dump)
        );
        warn!("{}", message);
        self.errors += 1;
        self.scanning = true;
        // the bad word cannot itself be an alignment word
        self.start += 1;
        LmEvent::Error(message)
    }

    fn step(&self) -> Step {
        let Some(w0) = self.word(0) else {
            return Step::NeedMore;
        };
        match tag(w0) {
            TAG_PULSE => self.pulse(w0),
            TAG_PULSE_TOA => Step::Corrupt(1, "time of arrival without a pulse"),
            TAG_ALIGN if w0 == STREAM_ALIGN_WORD => Step::Event(LmEvent::StreamAlign(w0), 4),
            TAG_ALIGN => Step::Corrupt(1, "bad alignment word"),
            TAG_SYNC => Step::Event(
                LmEvent::Sync {
                    timestamp: payload(w0),
                },
                4,
            ),
            TAG_GATE => Step::Event(
                LmEvent::GateState {
                    high: w0 & (1 << 24) != 0,
                    timestamp: payload(w0),
                },
                4,
            ),
            TAG_GATED_STATS | TAG_SPATIAL_STATS | TAG_POSITION | TAG_PERIODIC_STATS => {
                self.numbered(tag(w0))
            }
            TAG_EXTENDED => match subtype(w0) {
                EXT_ANALOG_STATUS => Step::Event(
                    LmEvent::AnalogStatus {
                        ready: w0 & 1 != 0,
                        status: payload(w0),
                    },
                    4,
                ),
                EXT_BUFFER_OVERFLOW => Step::Event(
                    LmEvent::InternalBufferOverflow {
                        lost: payload(w0),
                    },
                    4,
                ),
                _ => Step::Corrupt(1, "unknown extended event"),
            },
            _ => Step::Corrupt(1, "unknown event tag"),
        }
    }

    fn pulse(&self, w0: u32) -> Step {
        let mut pulse = Pulse {
            amplitude: sign_extend_24((w0 >> 3) & 0xff_ffff),
            invalid: w0 & (1 << 27) != 0,
            toa: None,
        };
        match self.word(1) {
            Some(w1) if tag(w1) == TAG_PULSE_TOA => {
                pulse.toa = Some(TimeOfArrival {
                    timestamp: ((w1 >> 8) & 0xfff) as u16,
                    subsample: (w1 & 0xff) as u8,
                    in_marked_range: w1 & (1 << 20) != 0,
                });
                Step::Event(LmEvent::Pulse(pulse), 8)
            }
            Some(_) => Step::Event(LmEvent::Pulse(pulse), 4),
            None if self.end_of_stream => Step::Event(LmEvent::Pulse(pulse), 4),
            None => Step::NeedMore,
        }
    }

    fn numbered(&self, kind: u32) -> Step {
        let mut stats = LmStats::default();
        let mut position = Position::default();
        for i in 0..MAX_PACKET_WORDS {
            let Some(w) = self.word(i) else {
                if self.end_of_stream {
                    return Step::Corrupt(i, "truncated packet");
                }
                return Step::NeedMore;
            };
            if tag(w) != kind {
                return Step::Corrupt(i + 1, "tag changed inside packet");
            }
            let sub = subtype(w);
            if kind == TAG_POSITION {
                if sub == SUBTYPE_END {
                    position.timestamp = payload(w);
                } else if (sub as usize) < MAX_POSITION_AXES {
                    position.axes[sub as usize] = Some(sign_extend_24(payload(w)));
                } else {
                    return Step::Corrupt(i + 1, "position axis out of range");
                }
            } else {
                stats.apply(sub, payload(w));
            }
            if sub == SUBTYPE_END {
                let event = match kind {
                    TAG_GATED_STATS => LmEvent::GatedStats(stats),
                    TAG_SPATIAL_STATS => LmEvent::SpatialStats(stats),
                    TAG_PERIODIC_STATS => LmEvent::PeriodicStats(stats),
                    _ => LmEvent::SpatialPosition(position),
                };
                return Step::Event(event, (i + 1) * 4);
            }
        }
        Step::Corrupt(MAX_PACKET_WORDS, "packet without terminator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(words: &[u32]) -> Vec<LmEvent> {
        let mut dec = LmDecoder::new();
        dec.push(&words_to_bytes(words));
        dec.finish();
        std::iter::from_fn(|| dec.next_event()).collect()
    }

    #[test]
    fn happy_path_stream() {
        let events = decode_all(&[
            STREAM_ALIGN_WORD,
            0x0000_0320,
            0x0000_0640,
            0x1000_0000,
            0x8000_00ff,
        ]);
        assert_eq!(
            events,
            vec![
                LmEvent::StreamAlign(STREAM_ALIGN_WORD),
                LmEvent::Pulse(Pulse {
                    amplitude: 100,
                    invalid: false,
                    toa: None
                }),
                LmEvent::Pulse(Pulse {
                    amplitude: 200,
                    invalid: false,
                    toa: Some(TimeOfArrival {
                        timestamp: 0,
                        subsample: 0,
                        in_marked_range: false
                    })
                }),
                LmEvent::Sync { timestamp: 255 },
            ]
        );
    }

    #[test]
    fn resync_after_corrupt_prefix() {
        let mut bytes = vec![0x12, 0x34, 0x56];
        bytes.extend(words_to_bytes(&[STREAM_ALIGN_WORD, pulse_word(1, false)]));
        let mut dec = LmDecoder::new();
        dec.push(&bytes);
        dec.finish();
        let events: Vec<_> = std::iter::from_fn(|| dec.next_event()).collect();

        assert_eq!(events.len(), 3);
        match &events[0] {
            LmEvent::Error(msg) => {
                assert!(msg.contains("at offset 0"), "{}", msg);
                assert!(msg.contains("12 34 56"), "{}", msg);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(events[1], LmEvent::StreamAlign(STREAM_ALIGN_WORD));
        assert!(matches!(events[2], LmEvent::Pulse(Pulse { amplitude: 1, .. })));
        assert_eq!(dec.errors(), 1);
    }

    #[test]
    fn pulse_flags_and_negative_amplitude() {
        let events = decode_all(&[
            pulse_word(-5, true),
            toa_word(0xabc, 0x12, true),
            pulse_word(0x7f_ffff, false),
        ]);
        assert_eq!(
            events[0],
            LmEvent::Pulse(Pulse {
                amplitude: -5,
                invalid: true,
                toa: Some(TimeOfArrival {
                    timestamp: 0xabc,
                    subsample: 0x12,
                    in_marked_range: true
                })
            })
        );
        assert!(matches!(
            events[1],
            LmEvent::Pulse(Pulse {
                amplitude: 0x7f_ffff,
                toa: None,
                ..
            })
        ));
    }

    #[test]
    fn trailing_pulse_waits_for_possible_suffix() {
        let mut dec = LmDecoder::new();
        dec.push(&words_to_bytes(&[pulse_word(9, false)]));
        assert_eq!(dec.next_event(), None);
        dec.push(&words_to_bytes(&[toa_word(3, 4, false)]));
        match dec.next_event() {
            Some(LmEvent::Pulse(p)) => assert_eq!(p.toa.unwrap().timestamp, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stats_packet_any_order() {
        let words = numbered_packet(
            TAG_GATED_STATS,
            &[(0x6, 77), (0x0, 0x10), (0x1, 0x2), (0xa, 5), (0xc, 1)],
            0x1234,
        );
        let events = decode_all(&words);
        match &events[0] {
            LmEvent::GatedStats(s) => {
                assert_eq!(s.pulses_accepted, 77);
                assert_eq!(s.time_elapsed, (0x2 << 24) | 0x10);
                assert_eq!(s.veto_samples, 5);
                assert_eq!(s.gate_state, Some(true));
                assert_eq!(s.timestamp, 0x1234);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stats_packet_survives_builder() {
        let stats = LmStats {
            time_elapsed: 0x0123_4567_89,
            samples_detected: 1 << 30,
            samples_erased: 12,
            pulses_accepted: 1000,
            pulses_rejected: 20,
            input_count_rate: 5000,
            output_count_rate: 4800,
            veto_samples: 0,
            dead_time: 1 << 22,
            gate_state: None,
            timestamp: 99,
        };
        let events = decode_all(&stats_packet(TAG_PERIODIC_STATS, &stats));
        assert_eq!(events, vec![LmEvent::PeriodicStats(stats)]);
        assert!((stats.dead_time_fraction() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn position_packet() {
        let words = numbered_packet(TAG_POSITION, &[(0, 10), (2, 0xff_fffe)], 7);
        let events = decode_all(&words);
        let mut axes = [None; MAX_POSITION_AXES];
        axes[0] = Some(10);
        axes[2] = Some(-2);
        assert_eq!(
            events,
            vec![LmEvent::SpatialPosition(Position { axes, timestamp: 7 })]
        );
    }

    #[test]
    fn packet_without_terminator_is_corrupt() {
        let mut words: Vec<u32> = (0..16).map(|i| 0xa000_0000 | ((i % 15) << 24)).collect();
        words.push(STREAM_ALIGN_WORD);
        let events = decode_all(&words);
        assert!(matches!(events[0], LmEvent::Error(_)));
        assert_eq!(events.last(), Some(&LmEvent::StreamAlign(STREAM_ALIGN_WORD)));
        assert_eq!(
            events.iter().filter(|e| matches!(e, LmEvent::Error(_))).count(),
            1
        );
    }

    #[test]
    fn tag_change_inside_packet_is_corrupt() {
        let words = [0xa600_0001, 0xe000_0002, STREAM_ALIGN_WORD];
        let events = decode_all(&words);
        assert!(matches!(events[0], LmEvent::Error(_)));
        assert_eq!(events[1], LmEvent::StreamAlign(STREAM_ALIGN_WORD));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn partial_packet_does_not_advance() {
        let words = numbered_packet(TAG_SPATIAL_STATS, &[(0x6, 1), (0x7, 2)], 3);
        let bytes = words_to_bytes(&words);
        let mut dec = LmDecoder::new();
        dec.push(&bytes[..9]);
        assert_eq!(dec.next_event(), None);
        assert_eq!(dec.position(), 0);
        dec.push(&bytes[9..]);
        assert!(matches!(dec.next_event(), Some(LmEvent::SpatialStats(_))));
        assert_eq!(dec.position(), bytes.len() as u64);
    }

    #[test]
    fn extended_events() {
        let events = decode_all(&[0xf000_0001, 0xf100_0010, 0xf200_0000, STREAM_ALIGN_WORD]);
        assert_eq!(
            events[0],
            LmEvent::AnalogStatus {
                ready: true,
                status: 1
            }
        );
        assert_eq!(events[1], LmEvent::InternalBufferOverflow { lost: 16 });
        assert!(matches!(events[2], LmEvent::Error(_)));
        assert_eq!(events[3], LmEvent::StreamAlign(STREAM_ALIGN_WORD));
    }

    #[test]
    fn error_offsets_are_stream_offsets() {
        let mut dec = LmDecoder::new();
        let good = words_to_bytes(&[STREAM_ALIGN_WORD; 64]);
        for _ in 0..4 {
            assert_eq!(dec.decode(&good).len(), 64);
        }
        let events = dec.decode(&[0x20, 0, 0, 0]);
        match &events[..] {
            [LmEvent::Error(msg)] => assert!(msg.contains("at offset 1024"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }
}
