//! Double-buffered output for mapping runs.
//!
//! The receiver thread appends to the active half while the host reads the
//! other one. Halves swap only once the active half is full and the host has
//! released the inactive half with `buffer_done`.

use crate::{PslError, PslResult};
use log::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferLabel {
    A,
    B,
}

impl BufferLabel {
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            Self::A
        } else {
            Self::B
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
        }
    }
}

impl TryFrom<char> for BufferLabel {
    type Error = PslError;

    fn try_from(c: char) -> PslResult<Self> {
        match c.to_ascii_uppercase() {
            'A' => Ok(Self::A),
            'B' => Ok(Self::B),
            _ => Err(PslError::InvalidValue),
        }
    }
}

/// One half of a [`BufferPair`], addressed in 32-bit words.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u32>,
    level: usize,
    next: usize,
    pixels: u32,
    marker: usize,
    full: bool,
    done: bool,
}

impl Buffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            level: 0,
            next: 0,
            pixels: 0,
            marker: 0,
            full: false,
            done: true,
        }
    }

    fn reset(&mut self) {
        self.level = 0;
        self.next = 0;
        self.pixels = 0;
        self.marker = 0;
        self.full = false;
        self.done = false;
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn next(&self) -> usize {
        self.next
    }

    pub fn pixels(&self) -> u32 {
        self.pixels
    }

    pub fn marker(&self) -> usize {
        self.marker
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Words written so far.
    pub fn words(&self) -> &[u32] {
        &self.data[..self.level]
    }

    pub fn copy_in(&mut self, words: &[u32]) -> PslResult<()> {
        let end = self.level + words.len();
        if end > self.data.len() {
            return Err(PslError::InvalidValue);
        }
        self.data[self.level..end].copy_from_slice(words);
        self.level = end;
        Ok(())
    }

    /// Copies up to `count` unread words (all of them when `count` is 0).
    pub fn copy_out(&mut self, count: usize) -> Vec<u32> {
        let available = self.level - self.next;
        let n = if count == 0 {
            available
        } else {
            count.min(available)
        };
        let out = self.data[self.next..self.next + n].to_vec();
        self.next += n;
        out
    }

    /// Overwrites the buffer contents from the start. Used by formatters that
    /// keep a single rolling image instead of appending.
    pub fn rewrite(&mut self, words: &[u32]) -> PslResult<()> {
        if words.len() > self.data.len() {
            return Err(PslError::InvalidValue);
        }
        self.data[..words.len()].copy_from_slice(words);
        self.level = words.len();
        self.next = 0;
        Ok(())
    }

    /// Sets 16-bit word `index` (two per 32-bit word, low half first).
    pub fn set_u16(&mut self, index: usize, value: u16) -> PslResult<()> {
        let word = self.data.get_mut(index / 2).ok_or(PslError::InvalidValue)?;
        if index % 2 == 0 {
            *word = (*word & 0xffff_0000) | u32::from(value);
        } else {
            *word = (*word & 0x0000_ffff) | (u32::from(value) << 16);
        }
        Ok(())
    }

    pub fn get_u16(&self, index: usize) -> Option<u16> {
        let word = self.data.get(index / 2)?;
        Some(if index % 2 == 0 {
            (*word & 0xffff) as u16
        } else {
            (*word >> 16) as u16
        })
    }

    /// Remembers the current level as the start of the buffer header.
    pub(crate) fn set_marker(&mut self) {
        self.marker = self.level;
    }
}

#[derive(Debug, Clone)]
pub struct BufferPair {
    buffers: [Buffer; 2],
    active: usize,
    buffer_number: u32,
    pixel_target: u32,
    pixel_count: u32,
    overruns: u32,
}

impl BufferPair {
    /// A pixel target of 0 means the run has no pixel limit.
    pub fn new(size: usize, pixel_target: u32) -> Self {
        let mut buffers = [Buffer::new(size), Buffer::new(size)];
        buffers[0].reset();
        Self {
            buffers,
            active: 0,
            buffer_number: 0,
            pixel_target,
            pixel_count: 0,
            overruns: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.buffers[0].size()
    }

    pub fn active_label(&self) -> BufferLabel {
        BufferLabel::from_index(self.active)
    }

    pub fn active(&self) -> &Buffer {
        &self.buffers[self.active]
    }

    pub fn active_mut(&mut self) -> &mut Buffer {
        &mut self.buffers[self.active]
    }

    pub fn inactive(&self) -> &Buffer {
        &self.buffers[self.active ^ 1]
    }

    pub fn buffer(&self, label: BufferLabel) -> &Buffer {
        &self.buffers[label.index()]
    }

    pub fn buffer_number(&self) -> u32 {
        self.buffer_number
    }

    pub fn pixel_count(&self) -> u32 {
        self.pixel_count
    }

    pub fn pixel_target(&self) -> u32 {
        self.pixel_target
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    pub fn target_reached(&self) -> bool {
        self.pixel_target != 0 && self.pixel_count >= self.pixel_target
    }

    /// Records one more complete pixel in the active half.
    pub fn add_pixel(&mut self) {
        self.buffers[self.active].pixels += 1;
        self.pixel_count += 1;
    }

    fn refresh_full(&mut self) {
        let target_reached = self.target_reached();
        let active = &mut self.buffers[self.active];
        if active.level >= active.size() || (target_reached && active.level > 0) {
            active.full = true;
        }
    }

    pub fn mark_full(&mut self) {
        self.buffers[self.active].full = true;
    }

    fn toggle(&mut self) -> bool {
        if !self.buffers[self.active].full || !self.buffers[self.active ^ 1].done {
            return false;
        }
        self.active ^= 1;
        self.buffers[self.active].reset();
        self.buffer_number = self.buffer_number.wrapping_add(1);
        debug!(
            "buffer toggle: now filling {} (buffer #{})",
            self.active_label().as_char(),
            self.buffer_number
        );
        true
    }

    /// Refreshes the active half's fullness and swaps halves when possible.
    /// Returns true if a swap happened.
    pub fn update(&mut self) -> bool {
        self.refresh_full();
        self.toggle()
    }

    /// True when the producer has nowhere to write.
    pub fn is_blocked(&mut self) -> bool {
        self.update();
        self.buffers[self.active].full
    }

    /// Appends to the active half. Refused with `InternalBufferOverrun`, and
    /// counted, when both halves are occupied.
    pub fn append(&mut self, words: &[u32]) -> PslResult<()> {
        if self.is_blocked() {
            return Err(self.refuse());
        }
        self.buffers[self.active].copy_in(words)?;
        self.update();
        Ok(())
    }

    /// Counts a write that found both halves occupied.
    pub fn refuse(&mut self) -> PslError {
        self.overruns += 1;
        warn!("mapping buffer overrun #{}", self.overruns);
        PslError::InternalBufferOverrun
    }

    /// A completed half the host has not released yet.
    pub fn is_ready(&self, label: BufferLabel) -> bool {
        let buffer = self.buffer(label);
        label.index() != self.active && buffer.full && !buffer.done
    }

    /// Copies out the whole unread payload of a completed half.
    pub fn read(&mut self, label: BufferLabel) -> PslResult<Vec<u32>> {
        if label.index() == self.active {
            return Err(PslError::InvalidValue);
        }
        Ok(self.buffers[label.index()].copy_out(0))
    }

    /// Copies from the active half; the single-image MCA formatter reads this
    /// way.
    pub fn read_active(&mut self, count: usize) -> Vec<u32> {
        self.buffers[self.active].copy_out(count)
    }

    /// Releases a half the host has consumed and lets the producer move on.
    pub fn done(&mut self, label: BufferLabel) -> PslResult<()> {
        if label.index() == self.active {
            return Err(PslError::InvalidValue);
        }
        self.buffers[label.index()].done = true;
        self.update();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_then_overrun_then_recover() {
        let mut pair = BufferPair::new(4, 0);
        assert_eq!(pair.active_label(), BufferLabel::A);

        pair.append(&[1, 2, 3, 4]).unwrap();
        assert_eq!(pair.active_label(), BufferLabel::B);
        assert!(pair.is_ready(BufferLabel::A));
        assert_eq!(pair.buffer_number(), 1);

        pair.append(&[5, 6, 7, 8]).unwrap();
        assert!(pair.active().is_full());
        assert_eq!(pair.active_label(), BufferLabel::B);

        assert_eq!(pair.append(&[9]), Err(PslError::InternalBufferOverrun));
        assert_eq!(pair.overruns(), 1);

        assert_eq!(pair.read(BufferLabel::A).unwrap(), vec![1, 2, 3, 4]);
        pair.done(BufferLabel::A).unwrap();
        assert_eq!(pair.active_label(), BufferLabel::A);
        pair.append(&[9]).unwrap();
        assert_eq!(pair.active().words(), &[9]);
        assert_eq!(pair.overruns(), 1);
    }

    #[test]
    fn reading_the_active_half_is_refused() {
        let mut pair = BufferPair::new(8, 0);
        pair.append(&[1]).unwrap();
        assert_eq!(pair.read(BufferLabel::A), Err(PslError::InvalidValue));
        assert_eq!(pair.done(BufferLabel::A), Err(PslError::InvalidValue));
        assert!(!pair.is_ready(BufferLabel::A));
        assert!(!pair.is_ready(BufferLabel::B));
    }

    #[test]
    fn copy_in_past_capacity_is_invalid() {
        let mut pair = BufferPair::new(4, 0);
        pair.append(&[1, 2]).unwrap();
        assert_eq!(pair.append(&[3, 4, 5]), Err(PslError::InvalidValue));
        assert_eq!(pair.overruns(), 0);
        assert_eq!(pair.active().level(), 2);
    }

    #[test]
    fn pixel_target_closes_a_partial_buffer() {
        let mut pair = BufferPair::new(100, 2);
        pair.append(&[1]).unwrap();
        pair.add_pixel();
        assert!(!pair.update());
        pair.append(&[2]).unwrap();
        pair.add_pixel();
        assert!(pair.update());
        assert!(pair.is_ready(BufferLabel::A));
        assert_eq!(pair.buffer(BufferLabel::A).pixels(), 2);
    }

    #[test]
    fn copy_out_is_incremental() {
        let mut pair = BufferPair::new(8, 0);
        pair.append(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(pair.read_active(2), vec![1, 2]);
        assert_eq!(pair.read_active(0), vec![3, 4, 5]);
        assert!(pair.read_active(0).is_empty());
    }

    #[test]
    fn half_words_pack_little_endian() {
        let mut pair = BufferPair::new(2, 0);
        let buf = pair.active_mut();
        buf.set_u16(0, 0x55aa).unwrap();
        buf.set_u16(1, 0xaa55).unwrap();
        buf.set_u16(3, 0x1234).unwrap();
        assert_eq!(buf.get_u16(0), Some(0x55aa));
        assert_eq!(buf.get_u16(1), Some(0xaa55));
        assert_eq!(buf.get_u16(3), Some(0x1234));
        assert_eq!(buf.set_u16(4, 1), Err(PslError::InvalidValue));
    }
}
