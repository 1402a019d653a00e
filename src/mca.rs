//! Mapping mode 0: a single rolling MCA image per channel.

use crate::buffer::BufferPair;
use crate::codec::Histogram;
use crate::stats::{Stats, STATS_COUNT};
use crate::{PslError, PslResult};

/// Histogram lengths the card bins into.
pub const MCA_BIN_COUNTS: [usize; 4] = [1024, 2048, 4096, 8192];
pub const MAX_MCA_CHANNELS: usize = 8192;

pub fn check_mca_channels(mca_channels: usize) -> PslResult<()> {
    if MCA_BIN_COUNTS.contains(&mca_channels) {
        Ok(())
    } else {
        Err(PslError::InvalidValue)
    }
}

/// Keeps the latest histogram push as one consistent image:
/// accepted spectrum, rejected spectrum, then the stats rounded to words.
#[derive(Debug, Clone)]
pub struct McaFormatter {
    mca_channels: usize,
    pair: BufferPair,
    stats: Stats,
    updates: u64,
}

impl McaFormatter {
    pub fn new(mca_channels: usize) -> PslResult<Self> {
        check_mca_channels(mca_channels)?;
        Ok(Self {
            mca_channels,
            pair: BufferPair::new(2 * mca_channels + STATS_COUNT, 0),
            stats: Stats::default(),
            updates: 0,
        })
    }

    pub fn mca_channels(&self) -> usize {
        self.mca_channels
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Replaces the image with a new histogram push. Spectra longer than the
    /// configured channel count are truncated, shorter ones zero padded.
    pub fn update(&mut self, histogram: &Histogram) -> PslResult<Stats> {
        let n = self.mca_channels;
        let mut words = Vec::with_capacity(2 * n + STATS_COUNT);
        for spectrum in [&histogram.accepted, &histogram.rejected] {
            words.extend(spectrum.iter().take(n));
            words.resize(words.len() + n.saturating_sub(spectrum.len()), 0);
        }
        let counted = n.min(histogram.accepted.len());
        self.stats = Stats::from_histogram(&histogram.stats, &histogram.accepted[..counted]);
        words.extend(
            self.stats
                .to_array()
                .iter()
                .map(|v| v.clamp(0.0, f64::from(u32::MAX)).round() as u32),
        );
        self.pair.active_mut().rewrite(&words)?;
        self.updates += 1;
        Ok(self.stats)
    }

    /// The accepted spectrum of the latest image.
    pub fn spectrum(&self) -> Vec<u32> {
        let words = self.pair.active().words();
        if words.len() < self.mca_channels {
            return vec![0; self.mca_channels];
        }
        words[..self.mca_channels].to_vec()
    }

    pub fn rejected(&self) -> Vec<u32> {
        let words = self.pair.active().words();
        if words.len() < 2 * self.mca_channels {
            return vec![0; self.mca_channels];
        }
        words[self.mca_channels..2 * self.mca_channels].to_vec()
    }

    /// Streams the image out in chunks of `count` words (0 = everything left).
    pub fn read(&mut self, count: usize) -> Vec<u32> {
        self.pair.read_active(count)
    }

    pub fn image_len(&self) -> usize {
        self.pair.active().level()
    }
}
