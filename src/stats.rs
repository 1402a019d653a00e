use crate::codec::HistogramStats;

pub const STATS_COUNT: usize = 14;

/// Length of one pixel statistics tick in seconds (16 cycles of 50 MHz).
pub const PIXEL_TICK_SECONDS: f64 = 0.32e-6;

/// Slot order of [`Stats::to_array`].
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatSlot {
    TimeElapsed = 0,
    TriggerLivetime = 1,
    EnergyLivetime = 2,
    Triggers = 3,
    McaEvents = 4,
    InputCountRate = 5,
    OutputCountRate = 6,
    Underflows = 7,
    Overflows = 8,
    SamplesDetected = 9,
    SamplesErased = 10,
    PulsesAccepted = 11,
    PulsesRejected = 12,
    Deadtime = 13,
}

/// Per-channel statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    pub time_elapsed: f64,
    pub trigger_livetime: f64,
    pub energy_livetime: f64,
    pub triggers: f64,
    pub mca_events: f64,
    pub input_count_rate: f64,
    pub output_count_rate: f64,
    pub underflows: f64,
    pub overflows: f64,
    pub samples_detected: f64,
    pub samples_erased: f64,
    pub pulses_accepted: f64,
    pub pulses_rejected: f64,
    /// Percent.
    pub deadtime: f64,
}

impl Stats {
    /// Derives the snapshot from the stats block of a histogram push.
    pub fn from_histogram(stats: &HistogramStats, accepted: &[u32]) -> Self {
        let triggers = (stats.pulses_accepted + stats.pulses_rejected) as f64;
        let trigger_livetime = if stats.input_count_rate > 0.0 {
            triggers / stats.input_count_rate
        } else {
            0.0
        };
        let dead = stats.dead_time.clamp(0.0, 1.0);
        Self {
            time_elapsed: stats.time_elapsed,
            trigger_livetime,
            energy_livetime: stats.time_elapsed * (1.0 - dead),
            triggers,
            mca_events: accepted.iter().map(|&c| f64::from(c)).sum(),
            input_count_rate: stats.input_count_rate,
            output_count_rate: stats.output_count_rate,
            underflows: stats.underflows as f64,
            overflows: stats.overflows as f64,
            samples_detected: stats.samples_detected as f64,
            samples_erased: stats.samples_erased as f64,
            pulses_accepted: stats.pulses_accepted as f64,
            pulses_rejected: stats.pulses_rejected as f64,
            deadtime: dead * 100.0,
        }
    }

    pub fn to_array(&self) -> [f64; STATS_COUNT] {
        [
            self.time_elapsed,
            self.trigger_livetime,
            self.energy_livetime,
            self.triggers,
            self.mca_events,
            self.input_count_rate,
            self.output_count_rate,
            self.underflows,
            self.overflows,
            self.samples_detected,
            self.samples_erased,
            self.pulses_accepted,
            self.pulses_rejected,
            self.deadtime,
        ]
    }

    pub fn get(&self, slot: StatSlot) -> f64 {
        self.to_array()[slot as usize]
    }

    /// The nine values `module_statistics_2` reports per channel.
    pub fn module_statistics(&self) -> [f64; 9] {
        [
            self.time_elapsed,
            self.trigger_livetime,
            self.energy_livetime,
            self.triggers,
            self.mca_events,
            self.input_count_rate,
            self.output_count_rate,
            self.underflows,
            self.overflows,
        ]
    }

    pub fn pixel_stats(&self) -> PixelStats {
        PixelStats {
            realtime: seconds_to_ticks(self.time_elapsed),
            livetime: seconds_to_ticks(self.energy_livetime),
            triggers: saturate(self.triggers),
            output_events: saturate(self.pulses_accepted),
        }
    }
}

/// Statistics words written into each mapping pixel header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PixelStats {
    /// In 0.32 µs ticks.
    pub realtime: u32,
    /// In 0.32 µs ticks.
    pub livetime: u32,
    pub triggers: u32,
    pub output_events: u32,
}

fn saturate(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value.round() as u32
    }
}

pub fn seconds_to_ticks(seconds: f64) -> u32 {
    saturate(seconds / PIXEL_TICK_SECONDS)
}
