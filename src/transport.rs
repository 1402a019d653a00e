//! Length-prefixed framing over a byte stream.
//!
//! A frame is an unsigned LEB128 byte count followed by that many body bytes.
//! The card side and the host side both speak it over one TCP connection per
//! module. The same framing runs over an in-process loopback pair, which is
//! what the integration tests drive a module with.

use crate::{PslError, PslResult};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, warn};
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

pub const DEFAULT_PORT: u16 = 8756;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Send side of a connection. Owned by whichever caller holds the module
/// send lock.
pub trait FrameWriter: Send {
    /// Writes one complete frame carrying `body`.
    fn send(&mut self, body: &[u8]) -> PslResult<()>;

    fn shutdown(&mut self) {}
}

/// Receive side of a connection. Owned by the receiver thread.
pub trait FrameReader: Send {
    /// Waits until a complete frame is buffered. `0` polls, a negative
    /// timeout blocks, anything else waits up to that many milliseconds.
    fn poll_ready(&mut self, timeout_ms: i32) -> PslResult<bool>;

    /// Returns the next complete frame body, blocking until one arrives.
    fn read_frame(&mut self) -> PslResult<Vec<u8>>;
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a varint from the front of `buf`. `Ok(None)` means more bytes are
/// needed; the second tuple field is the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> PslResult<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(PslError::FormatError);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 10 {
        return Err(PslError::FormatError);
    }
    Ok(None)
}

pub fn encode_frame(body: &[u8]) -> PslResult<Vec<u8>> {
    if body.len() > MAX_FRAME_LEN {
        return Err(PslError::InvalidValue);
    }
    let mut frame = Vec::with_capacity(body.len() + 5);
    encode_varint(body.len() as u64, &mut frame);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Accumulates stream bytes and cuts them into frame bodies.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    start: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // compact before growing so a long-lived connection does not creep
        if self.start > 0 && self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > READ_CHUNK {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn frame_bounds(&self) -> PslResult<Option<(usize, usize)>> {
        match decode_varint(self.pending())? {
            None => Ok(None),
            Some((len, header)) => {
                let len = usize::try_from(len).map_err(|_| PslError::TooBig)?;
                if len > MAX_FRAME_LEN {
                    return Err(PslError::TooBig);
                }
                if self.buffered() < header + len {
                    Ok(None)
                } else {
                    Ok(Some((header, len)))
                }
            }
        }
    }

    pub fn has_frame(&self) -> bool {
        matches!(self.frame_bounds(), Ok(Some(_)) | Err(_))
    }

    pub fn next_frame(&mut self) -> PslResult<Option<Vec<u8>>> {
        match self.frame_bounds()? {
            None => Ok(None),
            Some((header, len)) => {
                let begin = self.start + header;
                let body = self.buf[begin..begin + len].to_vec();
                self.start = begin + len;
                Ok(Some(body))
            }
        }
    }
}

fn map_io_error(err: &io::Error, fallback: PslError) -> PslError {
    match err.raw_os_error() {
        Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => return PslError::HostUnreachable,
        Some(libc::ENOMEM) | Some(libc::ENOBUFS) => return PslError::OutOfMemory,
        Some(libc::EMFILE) | Some(libc::ENFILE) => return PslError::OutOfResources,
        _ => {}
    }
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => PslError::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => PslError::SocketClosed,
        io::ErrorKind::OutOfMemory => PslError::OutOfMemory,
        _ => fallback,
    }
}

/// Opens the TCP connection to a card and splits it into the two halves.
pub fn connect(host: &str, port: u16, timeout: Duration) -> PslResult<(TcpReader, TcpWriter)> {
    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        warn!("cannot resolve {}:{}: {}", host, port, e);
        PslError::HostUnreachable
    })?;

    let mut last = PslError::ConnectFailed;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!("connected to {}", addr);
                let _ = stream.set_nodelay(true);
                let read_half = stream
                    .try_clone()
                    .map_err(|e| map_io_error(&e, PslError::OutOfResources))?;
                return Ok((TcpReader::new(read_half), TcpWriter { stream }));
            }
            Err(e) => {
                warn!("connect to {} failed: {}", addr, e);
                last = match map_io_error(&e, PslError::ConnectFailed) {
                    PslError::Timeout => PslError::ConnectFailed,
                    other => other,
                };
            }
        }
    }
    Err(last)
}

pub struct TcpWriter {
    stream: TcpStream,
}

impl FrameWriter for TcpWriter {
    fn send(&mut self, body: &[u8]) -> PslResult<()> {
        let frame = encode_frame(body)?;
        self.stream
            .write_all(&frame)
            .map_err(|e| map_io_error(&e, PslError::WriteFailed))
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct TcpReader {
    stream: TcpStream,
    assembler: FrameAssembler,
    scratch: Vec<u8>,
}

impl TcpReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            assembler: FrameAssembler::new(),
            scratch: vec![0u8; READ_CHUNK],
        }
    }

    /// One read into the assembler. `Ok(false)` means nothing arrived in time.
    fn fill(&mut self, timeout_ms: i32) -> PslResult<bool> {
        let configured = if timeout_ms == 0 {
            self.stream.set_nonblocking(true)
        } else {
            self.stream.set_nonblocking(false).and_then(|_| {
                let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64));
                self.stream.set_read_timeout(timeout)
            })
        };
        configured.map_err(|e| map_io_error(&e, PslError::ReadFailed))?;

        match self.stream.read(&mut self.scratch) {
            Ok(0) => Err(PslError::SocketClosed),
            Ok(n) => {
                self.assembler.push(&self.scratch[..n]);
                Ok(true)
            }
            Err(e) => match map_io_error(&e, PslError::ReadFailed) {
                PslError::Timeout => Ok(false),
                _ if e.kind() == io::ErrorKind::Interrupted => Ok(false),
                other => Err(other),
            },
        }
    }
}

impl FrameReader for TcpReader {
    fn poll_ready(&mut self, timeout_ms: i32) -> PslResult<bool> {
        if self.assembler.has_frame() {
            return Ok(true);
        }
        self.fill(timeout_ms)?;
        Ok(self.assembler.has_frame())
    }

    fn read_frame(&mut self) -> PslResult<Vec<u8>> {
        loop {
            if let Some(body) = self.assembler.next_frame()? {
                return Ok(body);
            }
            self.fill(-1)?;
        }
    }
}

/// Writer half of an in-process connection.
#[derive(Clone)]
pub struct LoopbackWriter {
    tx: Sender<Vec<u8>>,
}

impl LoopbackWriter {
    /// Pushes unframed bytes, for exercising frames split across reads.
    pub fn send_raw(&self, bytes: &[u8]) -> PslResult<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| PslError::SocketClosed)
    }
}

impl FrameWriter for LoopbackWriter {
    fn send(&mut self, body: &[u8]) -> PslResult<()> {
        let frame = encode_frame(body)?;
        self.tx.send(frame).map_err(|_| PslError::WriteFailed)
    }
}

/// Reader half of an in-process connection.
pub struct LoopbackReader {
    rx: Receiver<Vec<u8>>,
    assembler: FrameAssembler,
}

impl LoopbackReader {
    fn fill(&mut self, timeout_ms: i32) -> PslResult<bool> {
        let chunk = if timeout_ms == 0 {
            match self.rx.try_recv() {
                Ok(chunk) => chunk,
                Err(TryRecvError::Empty) => return Ok(false),
                Err(TryRecvError::Disconnected) => return Err(PslError::SocketClosed),
            }
        } else if timeout_ms < 0 {
            self.rx.recv().map_err(|_| PslError::SocketClosed)?
        } else {
            match self.rx.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => return Err(PslError::SocketClosed),
            }
        };
        self.assembler.push(&chunk);
        Ok(true)
    }
}

impl FrameReader for LoopbackReader {
    fn poll_ready(&mut self, timeout_ms: i32) -> PslResult<bool> {
        if self.assembler.has_frame() {
            return Ok(true);
        }
        self.fill(timeout_ms)?;
        Ok(self.assembler.has_frame())
    }

    fn read_frame(&mut self) -> PslResult<Vec<u8>> {
        loop {
            if let Some(body) = self.assembler.next_frame()? {
                return Ok(body);
            }
            self.fill(-1)?;
        }
    }
}

/// One end of a loopback connection.
pub struct LoopbackEnd {
    pub reader: LoopbackReader,
    pub writer: LoopbackWriter,
}

/// Builds a connected pair: whatever one end writes the other end reads.
pub fn loopback() -> (LoopbackEnd, LoopbackEnd) {
    let (host_tx, card_rx) = unbounded();
    let (card_tx, host_rx) = unbounded();
    let host = LoopbackEnd {
        reader: LoopbackReader {
            rx: host_rx,
            assembler: FrameAssembler::new(),
        },
        writer: LoopbackWriter { tx: host_tx },
    };
    let card = LoopbackEnd {
        reader: LoopbackReader {
            rx: card_rx,
            assembler: FrameAssembler::new(),
        },
        writer: LoopbackWriter { tx: card_tx },
    };
    (host, card)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_edges() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(decode_varint(&out).unwrap(), Some((value, out.len())));
            assert_eq!(decode_varint(&out[..out.len() - 1]).unwrap(), None);
        }
        assert_eq!(decode_varint(&[0xff; 11]), Err(PslError::FormatError));
    }

    #[test]
    fn assembler_handles_split_and_batched_frames() {
        let mut stream = encode_frame(b"hello").unwrap();
        stream.extend(encode_frame(&[7u8; 300]).unwrap());
        stream.extend(encode_frame(b"").unwrap());

        let mut asm = FrameAssembler::new();
        asm.push(&stream[..3]);
        assert!(!asm.has_frame());
        assert_eq!(asm.next_frame().unwrap(), None);
        asm.push(&stream[3..]);
        assert_eq!(asm.next_frame().unwrap().unwrap(), b"hello");
        assert_eq!(asm.next_frame().unwrap().unwrap(), vec![7u8; 300]);
        assert_eq!(asm.next_frame().unwrap().unwrap(), Vec::<u8>::new());
        assert_eq!(asm.next_frame().unwrap(), None);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut header = Vec::new();
        encode_varint(MAX_FRAME_LEN as u64 + 1, &mut header);
        let mut asm = FrameAssembler::new();
        asm.push(&header);
        assert_eq!(asm.next_frame(), Err(PslError::TooBig));
    }

    #[test]
    fn loopback_poll_semantics() {
        let (mut host, card) = loopback();
        assert!(!host.reader.poll_ready(0).unwrap());
        assert!(!host.reader.poll_ready(10).unwrap());

        let mut card_writer = card.writer.clone();
        card_writer.send(b"abc").unwrap();
        assert!(host.reader.poll_ready(100).unwrap());
        assert_eq!(host.reader.read_frame().unwrap(), b"abc");

        let frame = encode_frame(b"split").unwrap();
        card.writer.send_raw(&frame[..2]).unwrap();
        assert!(!host.reader.poll_ready(50).unwrap());
        card.writer.send_raw(&frame[2..]).unwrap();
        assert_eq!(host.reader.read_frame().unwrap(), b"split");

        drop(card_writer);
        drop(card);
        assert_eq!(host.reader.poll_ready(-1), Err(PslError::SocketClosed));
    }
}
