//! Mapping-mode output: mode selection and the full-spectrum (MM1) formatter.
//!
//! An MM1 buffer is a 256-word buffer header followed by pixels, each a
//! 256-word pixel header and the spectrum. Header words are 16 bits, packed
//! two per 32-bit buffer word, low half first, so each header takes 128
//! buffer words.

use crate::binner::{BinnedPixel, Binner};
use crate::buffer::{BufferLabel, BufferPair};
use crate::codec::Histogram;
use crate::mca::{check_mca_channels, McaFormatter};
use crate::stats::{PixelStats, Stats};
use crate::{PslError, PslResult};
use log::{debug, info, warn};

pub const HEADER_WORDS: usize = 256;
/// 32-bit buffer words taken by one packed header.
pub const PACKED_HEADER_WORDS: usize = HEADER_WORDS / 2;
pub const BUFFER_TAG: [u16; 2] = [0x55aa, 0xaa55];
pub const PIXEL_TAG: [u16; 2] = [0x33cc, 0xcc33];
pub const FULL_SPECTRUM_MODE: u16 = 1;

/// 16-bit offset of the pixel count in the buffer header.
pub const BUFFER_PIXEL_COUNT_WORD: usize = 8;
/// 16-bit offset of channel 0's statistics in the pixel header.
pub const PIXEL_STATS_WORD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMode {
    Mca,
    FullSpectrum,
    Sca,
    List,
}

impl MappingMode {
    pub fn from_value(value: f64) -> PslResult<Self> {
        match value.round() as i64 {
            0 => Ok(Self::Mca),
            1 => Ok(Self::FullSpectrum),
            2 => Ok(Self::Sca),
            3 => Ok(Self::List),
            _ => Err(PslError::InvalidValue),
        }
    }

    pub fn value(self) -> f64 {
        match self {
            Self::Mca => 0.0,
            Self::FullSpectrum => 1.0,
            Self::Sca => 2.0,
            Self::List => 3.0,
        }
    }
}

/// 32-bit word count of one full MM1 buffer half.
pub fn full_spectrum_buffer_len(mca_channels: usize, pixels_per_buffer: u32) -> usize {
    PACKED_HEADER_WORDS + pixels_per_buffer as usize * (PACKED_HEADER_WORDS + mca_channels)
}

/// Packs 16-bit header words two per 32-bit word.
fn pack(half_words: &[u16]) -> Vec<u32> {
    half_words
        .chunks(2)
        .map(|pair| u32::from(pair[0]) | (u32::from(*pair.get(1).unwrap_or(&0)) << 16))
        .collect()
}

fn split(value: u32) -> [u16; 2] {
    [(value & 0xffff) as u16, (value >> 16) as u16]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FullSpectrumConfig {
    pub detector_channel: u16,
    pub run_number: u32,
    pub mca_channels: usize,
    pub pixels_per_buffer: u32,
    /// 0 runs until stopped.
    pub num_pixels: u32,
    pub list_mode: bool,
    pub sample_rate: f64,
}

#[derive(Debug)]
pub struct FullSpectrumFormatter {
    config: FullSpectrumConfig,
    pair: BufferPair,
    binner: Option<Binner>,
    stats: Stats,
    dropped_pixels: u64,
}

impl FullSpectrumFormatter {
    pub fn new(config: FullSpectrumConfig) -> PslResult<Self> {
        check_mca_channels(config.mca_channels)?;
        if config.pixels_per_buffer == 0 {
            return Err(PslError::InvalidValue);
        }
        let size = full_spectrum_buffer_len(config.mca_channels, config.pixels_per_buffer);
        let binner = if config.list_mode {
            Some(Binner::new(config.mca_channels, config.sample_rate)?)
        } else {
            None
        };
        info!(
            "mapping channel {}: {} bins, {} pixels per buffer, {} words per buffer{}",
            config.detector_channel,
            config.mca_channels,
            config.pixels_per_buffer,
            size,
            if config.list_mode { ", list mode" } else { "" }
        );
        Ok(Self {
            config,
            pair: BufferPair::new(size, config.num_pixels),
            binner,
            stats: Stats::default(),
            dropped_pixels: 0,
        })
    }

    pub fn config(&self) -> &FullSpectrumConfig {
        &self.config
    }

    pub fn pair(&self) -> &BufferPair {
        &self.pair
    }

    pub fn binner(&self) -> Option<&Binner> {
        self.binner.as_ref()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn dropped_pixels(&self) -> u64 {
        self.dropped_pixels
    }

    fn buffer_header(&self) -> Vec<u32> {
        let mut words = [0u16; HEADER_WORDS];
        words[0..2].copy_from_slice(&BUFFER_TAG);
        words[2] = HEADER_WORDS as u16;
        words[3] = FULL_SPECTRUM_MODE;
        words[4] = (self.config.run_number & 0xffff) as u16;
        words[5..7].copy_from_slice(&split(self.pair.buffer_number()));
        words[7] = self.pair.active_label().index() as u16;
        words[9..11].copy_from_slice(&split(self.pair.pixel_count()));
        words[11] = 0;
        words[12] = self.config.detector_channel;
        pack(&words)
    }

    fn pixel_header(&self, stats: &PixelStats) -> Vec<u32> {
        let spectrum = 2 * self.config.mca_channels as u32;
        let mut words = [0u16; HEADER_WORDS];
        words[0..2].copy_from_slice(&PIXEL_TAG);
        words[2] = HEADER_WORDS as u16;
        words[3] = FULL_SPECTRUM_MODE;
        words[4..6].copy_from_slice(&split(self.pair.pixel_count()));
        words[6..8].copy_from_slice(&split(HEADER_WORDS as u32 + spectrum));
        words[8] = spectrum as u16;
        let at = PIXEL_STATS_WORD;
        for (i, value) in [
            stats.realtime,
            stats.livetime,
            stats.triggers,
            stats.output_events,
        ]
        .into_iter()
        .enumerate()
        {
            words[at + 2 * i..at + 2 * i + 2].copy_from_slice(&split(value));
        }
        pack(&words)
    }

    /// Appends one pixel (and the buffer header, for the first pixel of a
    /// buffer). A pixel that finds both halves occupied is counted as an
    /// overrun and dropped.
    pub fn write_pixel(&mut self, stats: &PixelStats, spectrum: &[u32]) -> PslResult<()> {
        if self.pair.target_reached() {
            return Err(PslError::TooMany);
        }
        if self.pair.is_blocked() {
            return Err(self.pair.refuse());
        }
        let n = self.config.mca_channels;
        let starts_buffer = self.pair.active().level() == 0;
        let mut words = if starts_buffer {
            self.buffer_header()
        } else {
            Vec::new()
        };
        words.extend(self.pixel_header(stats));
        words.extend(spectrum.iter().take(n));
        words.resize(words.len() + n.saturating_sub(spectrum.len()), 0);

        let active = self.pair.active_mut();
        if starts_buffer {
            active.set_marker();
        }
        active.copy_in(&words)?;
        let room = active.size() - active.level();
        self.pair.add_pixel();

        if self.pair.active().pixels() >= self.config.pixels_per_buffer
            || self.pair.target_reached()
            || room < PACKED_HEADER_WORDS + n
        {
            self.complete_buffer()?;
        }
        Ok(())
    }

    /// Rewrites the pixel count, marks the active half full and toggles if
    /// the reader has released the other half.
    fn complete_buffer(&mut self) -> PslResult<()> {
        let active = self.pair.active_mut();
        let pixels = active.pixels();
        let at = 2 * active.marker() + BUFFER_PIXEL_COUNT_WORD;
        active.set_u16(at, (pixels & 0xffff) as u16)?;
        debug!(
            "buffer {} complete with {} pixels",
            self.pair.active_label().as_char(),
            pixels
        );
        self.pair.mark_full();
        self.pair.update();
        Ok(())
    }

    /// Closes a partially filled buffer at end of run.
    pub fn flush(&mut self) -> PslResult<()> {
        if let Some(binner) = self.binner.as_mut() {
            let pixels = binner.finish();
            self.write_binned(pixels);
        }
        let active = self.pair.active();
        if active.level() > 0 && !active.is_full() {
            self.complete_buffer()?;
        }
        Ok(())
    }

    /// Histogram push in MM1. Pixels are appended only for pushes that close
    /// a gated or spatial pixel.
    pub fn update_histogram(&mut self, histogram: &Histogram) -> PslResult<Stats> {
        let counted = self.config.mca_channels.min(histogram.accepted.len());
        self.stats = Stats::from_histogram(&histogram.stats, &histogram.accepted[..counted]);
        if histogram.stats.pixel_complete {
            let pixel_stats = self.stats.pixel_stats();
            match self.write_pixel(&pixel_stats, &histogram.accepted) {
                Ok(()) => {}
                Err(PslError::TooMany) => debug!("pixel past run target dropped"),
                Err(PslError::InternalBufferOverrun) => self.dropped_pixels += 1,
                Err(err) => return Err(err),
            }
        }
        Ok(self.stats)
    }

    /// Feeds a list-mode block through the binner. Returns the number of
    /// pixels written.
    pub fn feed_list_mode(&mut self, bytes: &[u8]) -> PslResult<usize> {
        let Some(binner) = self.binner.as_mut() else {
            return Err(PslError::ListModeNotRunning);
        };
        let pixels = binner.feed(bytes);
        if let Some(stats) = binner.latest_stats() {
            self.stats = stats;
        }
        Ok(self.write_binned(pixels))
    }

    fn write_binned(&mut self, pixels: Vec<BinnedPixel>) -> usize {
        let mut written = 0;
        for pixel in pixels {
            match self.write_pixel(&pixel.stats, &pixel.spectrum) {
                Ok(()) => written += 1,
                Err(PslError::TooMany) => {}
                Err(err) => {
                    self.dropped_pixels += 1;
                    warn!("list-mode pixel dropped: {}", err);
                }
            }
        }
        written
    }

    pub fn buffer_full(&mut self, label: BufferLabel) -> bool {
        self.pair.update();
        self.pair.is_ready(label)
    }

    pub fn read_buffer(&mut self, label: BufferLabel) -> PslResult<Vec<u32>> {
        self.pair.read(label)
    }

    pub fn buffer_done(&mut self, label: BufferLabel) -> PslResult<()> {
        self.pair.done(label)
    }

    pub fn current_pixel(&self) -> u32 {
        self.pair.pixel_count()
    }

    /// Words in a buffer that holds `pixels_per_buffer` pixels.
    pub fn buffer_len(&self) -> usize {
        self.pair.size()
    }
}

/// The per-channel output formatter selected for the current run.
#[derive(Debug, Default)]
pub enum MappingModeControl {
    #[default]
    None,
    Mca(McaFormatter),
    FullSpectrum(FullSpectrumFormatter),
}

impl MappingModeControl {
    pub fn open_mca(mca_channels: usize) -> PslResult<Self> {
        Ok(Self::Mca(McaFormatter::new(mca_channels)?))
    }

    pub fn open_full_spectrum(config: FullSpectrumConfig) -> PslResult<Self> {
        Ok(Self::FullSpectrum(FullSpectrumFormatter::new(config)?))
    }

    pub fn mode(&self) -> Option<MappingMode> {
        match self {
            Self::None => None,
            Self::Mca(_) => Some(MappingMode::Mca),
            Self::FullSpectrum(_) => Some(MappingMode::FullSpectrum),
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::FullSpectrum(_))
    }

    pub fn mca(&self) -> Option<&McaFormatter> {
        match self {
            Self::Mca(mca) => Some(mca),
            _ => None,
        }
    }

    pub fn full_spectrum(&self) -> Option<&FullSpectrumFormatter> {
        match self {
            Self::FullSpectrum(fs) => Some(fs),
            _ => None,
        }
    }

    pub fn full_spectrum_mut(&mut self) -> PslResult<&mut FullSpectrumFormatter> {
        match self {
            Self::FullSpectrum(fs) => Ok(fs),
            _ => Err(PslError::InvalidValue),
        }
    }

    /// Routes a histogram push to whichever formatter is live.
    pub fn update_histogram(&mut self, histogram: &Histogram) -> PslResult<Option<Stats>> {
        match self {
            Self::None => Ok(None),
            Self::Mca(mca) => mca.update(histogram).map(Some),
            Self::FullSpectrum(fs) => fs.update_histogram(histogram).map(Some),
        }
    }

    pub fn feed_list_mode(&mut self, bytes: &[u8]) -> PslResult<usize> {
        self.full_spectrum_mut()
            .map_err(|_| PslError::ListModeNotRunning)?
            .feed_list_mode(bytes)
    }

    pub fn flush(&mut self) -> PslResult<()> {
        match self {
            Self::FullSpectrum(fs) => fs.flush(),
            _ => Ok(()),
        }
    }
}
