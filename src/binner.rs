//! Turns a decoded list-mode stream into mapping pixels.

use crate::codec::HistogramStats;
use crate::listmode::{LmDecoder, LmEvent, LmStats};
use crate::stats::{seconds_to_ticks, PixelStats, Stats};
use crate::{PslError, PslResult};
use log::{debug, warn};

pub const FLAG_GATE_HIGH: u32 = 1 << 0;
pub const FLAG_GATE_TRIGGERED: u32 = 1 << 16;
pub const FLAG_STATS_VALID: u32 = 1 << 17;

/// Default ADC sample rate used when the card has not reported one.
pub const DEFAULT_SAMPLE_RATE: f64 = 250.0e6;

/// One pixel produced by the binner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinnedPixel {
    pub stats: PixelStats,
    pub spectrum: Vec<u32>,
}

/// Converts a list-mode statistics record into histogram statistics.
pub fn lm_to_histogram_stats(stats: &LmStats, sample_rate: f64) -> HistogramStats {
    let elapsed = if sample_rate > 0.0 {
        stats.time_elapsed as f64 / sample_rate
    } else {
        0.0
    };
    HistogramStats {
        time_elapsed: elapsed,
        samples_detected: stats.samples_detected,
        samples_erased: stats.samples_erased,
        pulses_accepted: u64::from(stats.pulses_accepted),
        pulses_rejected: u64::from(stats.pulses_rejected),
        input_count_rate: f64::from(stats.input_count_rate),
        output_count_rate: f64::from(stats.output_count_rate),
        dead_time: stats.dead_time_fraction(),
        gate_state: stats.gate_state.unwrap_or(false),
        ..Default::default()
    }
}

#[derive(Debug)]
pub struct Binner {
    bins: Vec<u64>,
    out_of_range: u64,
    invalid_pulses: u64,
    flags: u32,
    timestamp: u32,
    pending: LmStats,
    latest_periodic: Option<LmStats>,
    sample_rate: f64,
    decoder: LmDecoder,
}

impl Binner {
    pub fn new(num_bins: usize, sample_rate: f64) -> PslResult<Self> {
        if num_bins == 0 {
            return Err(PslError::InvalidValue);
        }
        Ok(Self {
            bins: vec![0; num_bins],
            out_of_range: 0,
            invalid_pulses: 0,
            flags: 0,
            timestamp: 0,
            pending: LmStats::default(),
            latest_periodic: None,
            sample_rate,
            decoder: LmDecoder::new(),
        })
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn gate_high(&self) -> bool {
        self.flags & FLAG_GATE_HIGH != 0
    }

    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn out_of_range(&self) -> u64 {
        self.out_of_range
    }

    pub fn invalid_pulses(&self) -> u64 {
        self.invalid_pulses
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Channel statistics from the most recent periodic statistics packet.
    pub fn latest_stats(&self) -> Option<Stats> {
        let periodic = self.latest_periodic.as_ref()?;
        let hist = lm_to_histogram_stats(periodic, self.sample_rate);
        let mut stats = Stats::from_histogram(&hist, &[]);
        stats.mca_events = self.bins.iter().sum::<u64>() as f64;
        Some(stats)
    }

    /// Decodes `bytes` and returns every pixel they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<BinnedPixel> {
        self.decoder.push(bytes);
        self.drain()
    }

    /// Flushes a held trailing pulse at end of run.
    pub fn finish(&mut self) -> Vec<BinnedPixel> {
        self.decoder.finish();
        self.drain()
    }

    fn drain(&mut self) -> Vec<BinnedPixel> {
        let mut pixels = Vec::new();
        while let Some(event) = self.decoder.next_event() {
            if let Some(pixel) = self.handle(&event) {
                pixels.push(pixel);
            }
        }
        pixels
    }

    /// Applies one decoded record; returns a pixel if it completed one.
    pub fn handle(&mut self, event: &LmEvent) -> Option<BinnedPixel> {
        match event {
            LmEvent::Pulse(pulse) => {
                if pulse.invalid {
                    self.invalid_pulses += 1;
                } else {
                    match usize::try_from(pulse.amplitude) {
                        Ok(bin) if bin < self.bins.len() => self.bins[bin] += 1,
                        _ => self.out_of_range += 1,
                    }
                }
                None
            }
            LmEvent::Sync { timestamp } => {
                self.timestamp = *timestamp;
                None
            }
            LmEvent::GatedStats(stats) | LmEvent::SpatialStats(stats) => {
                self.pending = *stats;
                self.timestamp = stats.timestamp;
                self.flags |= FLAG_STATS_VALID;
                self.try_emit()
            }
            LmEvent::PeriodicStats(stats) => {
                self.latest_periodic = Some(*stats);
                None
            }
            LmEvent::GateState { high, timestamp } => {
                self.timestamp = *timestamp;
                if *high != self.gate_high() {
                    self.flags ^= FLAG_GATE_HIGH;
                    self.flags |= FLAG_GATE_TRIGGERED;
                }
                self.try_emit()
            }
            LmEvent::SpatialPosition(position) => {
                self.timestamp = position.timestamp;
                self.flags |= FLAG_GATE_TRIGGERED;
                self.try_emit()
            }
            LmEvent::InternalBufferOverflow { lost } => {
                warn!("card list-mode buffer overflowed, {} events lost", lost);
                None
            }
            LmEvent::AnalogStatus { ready, status } => {
                debug!("analog status ready={} status={:#08x}", ready, status);
                None
            }
            LmEvent::StreamAlign(_) | LmEvent::Error(_) => None,
        }
    }

    fn try_emit(&mut self) -> Option<BinnedPixel> {
        let needed = FLAG_GATE_TRIGGERED | FLAG_STATS_VALID;
        if self.flags & needed != needed {
            return None;
        }
        self.flags &= !needed;
        let hist = lm_to_histogram_stats(&self.pending, self.sample_rate);
        let realtime = hist.time_elapsed;
        let stats = PixelStats {
            realtime: seconds_to_ticks(realtime),
            livetime: seconds_to_ticks(realtime * (1.0 - hist.dead_time.clamp(0.0, 1.0))),
            triggers: self
                .pending
                .pulses_accepted
                .saturating_add(self.pending.pulses_rejected),
            output_events: self.pending.pulses_accepted,
        };
        let spectrum = self
            .bins
            .iter_mut()
            .map(|b| u32::try_from(std::mem::take(b)).unwrap_or(u32::MAX))
            .collect();
        Some(BinnedPixel { stats, spectrum })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listmode::{
        gate_word, numbered_packet, pulse_word, stats_packet, words_to_bytes, STREAM_ALIGN_WORD,
    };

    fn gated_stats(accepted: u32) -> Vec<u32> {
        stats_packet(
            0xa,
            &LmStats {
                time_elapsed: 250_000,
                pulses_accepted: accepted,
                pulses_rejected: 2,
                dead_time: 1 << 22,
                ..Default::default()
            },
        )
    }

    #[test]
    fn pixel_needs_trigger_and_stats() {
        let mut binner = Binner::new(16, 250.0e6).unwrap();
        let mut words = vec![STREAM_ALIGN_WORD, pulse_word(3, false), pulse_word(3, false)];
        words.push(pulse_word(40, false));
        words.push(pulse_word(5, true));
        words.push(gate_word(true, 10));
        assert!(binner.feed(&words_to_bytes(&words)).is_empty());
        assert_eq!(binner.flags(), FLAG_GATE_HIGH | FLAG_GATE_TRIGGERED);

        let pixels = binner.feed(&words_to_bytes(&gated_stats(2)));
        assert_eq!(pixels.len(), 1);
        let pixel = &pixels[0];
        assert_eq!(pixel.spectrum[3], 2);
        assert_eq!(pixel.spectrum.iter().sum::<u32>(), 2);
        // 1 ms realtime, a quarter dead
        assert_eq!(pixel.stats.realtime, 3125);
        assert_eq!(pixel.stats.livetime, 2344);
        assert_eq!(pixel.stats.triggers, 4);
        assert_eq!(pixel.stats.output_events, 2);
        assert_eq!(binner.out_of_range(), 1);
        assert_eq!(binner.invalid_pulses(), 1);
        assert_eq!(binner.flags(), FLAG_GATE_HIGH);
        assert!(binner.bins().iter().all(|&b| b == 0));
    }

    #[test]
    fn repeated_gate_level_is_not_a_transition() {
        let mut binner = Binner::new(4, 250.0e6).unwrap();
        binner.handle(&LmEvent::GateState {
            high: false,
            timestamp: 0,
        });
        assert_eq!(binner.flags(), 0);
        let words = [STREAM_ALIGN_WORD, gate_word(true, 1), gate_word(true, 2)];
        binner.feed(&words_to_bytes(&words));
        assert_eq!(binner.flags(), FLAG_GATE_HIGH | FLAG_GATE_TRIGGERED);
    }

    #[test]
    fn spatial_position_triggers_pixel() {
        let mut binner = Binner::new(8, 250.0e6).unwrap();
        let mut words = vec![STREAM_ALIGN_WORD];
        words.extend(numbered_packet(0xb, &[(0x6, 1)], 5));
        words.push(pulse_word(1, false));
        words.extend(numbered_packet(0xc, &[(0, 100)], 6));
        let pixels = binner.feed(&words_to_bytes(&words));
        assert_eq!(pixels.len(), 1);
        assert_eq!(pixels[0].spectrum[1], 1);
        assert_eq!(binner.timestamp(), 6);
    }

    #[test]
    fn periodic_stats_feed_channel_stats() {
        let mut binner = Binner::new(8, 1.0e6).unwrap();
        assert!(binner.latest_stats().is_none());
        let packet = stats_packet(
            0xe,
            &LmStats {
                time_elapsed: 2_000_000,
                pulses_accepted: 10,
                pulses_rejected: 5,
                input_count_rate: 15,
                ..Default::default()
            },
        );
        binner.feed(&words_to_bytes(&packet));
        let stats = binner.latest_stats().unwrap();
        assert_eq!(stats.time_elapsed, 2.0);
        assert_eq!(stats.triggers, 15.0);
        assert_eq!(stats.trigger_livetime, 1.0);
    }

    #[test]
    fn zero_bins_rejected() {
        assert_eq!(
            Binner::new(0, DEFAULT_SAMPLE_RATE).unwrap_err(),
            PslError::InvalidValue
        );
    }
}
