//! CMP, the cluster message protocol.
//!
//! A message is cut into chunks of at most `chunk_size` user bytes; each
//! chunk is compressed, then encrypted, and prefixed with a fixed 18-byte
//! packed little-endian header:
//!
//! ```text
//! pid (4) | mid (1) | size (8) | sign (3) | cipher (1) | method (1)
//! ```
//!
//! `size` is the processed payload length of that chunk. All chunks of one
//! message share `pid` and `mid`; the terminal chunk sets the high bit of
//! the `method` byte. A decoder that loses framing scans forward to the next
//! plausible header, so one corrupt chunk never kills the stream.

use std::collections::{HashMap, VecDeque};

use log::warn;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::hash::{Cipher, Hash, Method};

/// Default cap on raw payload bytes per chunk.
pub const CHUNK_SIZE: usize = 0x1000;

/// Header magic, present on every chunk.
pub const SIGN: [u8; 3] = *b"AWH";

/// Set on the `method` byte of a message's final chunk.
const FINISH_BIT: u8 = 0x80;

pub const HEADER_LEN: usize = 18;
const_assert_eq!(HEADER_LEN, 4 + 1 + 8 + 3 + 1 + 1);

#[derive(Debug, Clone, Copy)]
struct Header {
    pid: i32,
    mid: u8,
    size: u64,
    cipher: Cipher,
    method: Method,
    finish: bool,
}

impl Header {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.push(self.mid);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&SIGN);
        out.push(self.cipher as u8);
        out.push(self.method as u8 | if self.finish { FINISH_BIT } else { 0 });
    }

    /// Parses and validates the fixed header; `None` means "not a header
    /// here", which the decoder treats as a framing loss.
    fn parse(buf: &[u8], max_payload: u64) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        if buf[13..16] != SIGN {
            return None;
        }
        let cipher = Cipher::from_wire(buf[16])?;
        let method_byte = buf[17];
        let method = Method::from_wire(method_byte & !FINISH_BIT)?;
        let size = u64::from_le_bytes(buf[5..13].try_into().expect("8 bytes"));
        if size > max_payload {
            return None;
        }
        Some(Self {
            pid: i32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            mid: buf[4],
            size,
            cipher,
            method,
            finish: method_byte & FINISH_BIT != 0,
        })
    }
}

/// Processed chunks can outgrow the raw cap (codec overhead on
/// incompressible input, 4/3 BASE64 expansion); anything beyond this bound
/// is treated as a framing loss instead.
fn max_payload(chunk_size: usize) -> u64 {
    (chunk_size as u64) * 2 + 1024
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mid: u8,
    pub pid: i32,
    pub data: Vec<u8>,
}

/// Serializes messages into the chunk stream. The internal buffer is
/// consumed by the transport as the peer socket becomes writable.
pub struct Encoder {
    chunk_size: usize,
    cipher: Cipher,
    method: Method,
    hash: Hash,
    pid: i32,
    mid: u8,
    buffer: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            cipher: Cipher::None,
            method: Method::None,
            hash: Hash::new(),
            pid: std::process::id() as i32,
            mid: 0,
            buffer: Vec::new(),
        }
    }

    /// Appends the full chunk stream for one message and returns the message
    /// id it was assigned. Ids increment per message and wrap.
    pub fn push(&mut self, data: &[u8]) -> Result<u8> {
        let mid = self.mid;
        self.mid = self.mid.wrapping_add(1);

        if data.is_empty() {
            Header {
                pid: self.pid,
                mid,
                size: 0,
                cipher: self.cipher,
                method: self.method,
                finish: true,
            }
            .write_to(&mut self.buffer);
            return Ok(mid);
        }

        let mut pieces = data.chunks(self.chunk_size).peekable();
        let mut __dbg_i = 0;
        while let Some(piece) = pieces.next() {
            eprintln!("DBG chunk {__dbg_i} start");
            __dbg_i += 1;
            let packed = self.hash.compress(piece, self.method)?;
            eprintln!("DBG chunk compressed len={}", packed.len());
            let sealed = self.hash.encode(&packed, self.cipher)?;
            Header {
                pid: self.pid,
                mid,
                size: sealed.len() as u64,
                cipher: self.cipher,
                method: self.method,
                finish: pieces.peek().is_none(),
            }
            .write_to(&mut self.buffer);
            self.buffer.extend_from_slice(&sealed);
        }
        Ok(mid)
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discards the first `n` bytes, i.e. what the transport actually wrote.
    pub fn erase(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        self.buffer.drain(..n);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn cipher(&mut self, cipher: Cipher) {
        self.cipher = cipher;
    }

    pub fn method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn password(&mut self, password: impl Into<Vec<u8>>) {
        self.hash.password(password);
    }

    pub fn salt(&mut self, salt: impl Into<Vec<u8>>) {
        self.hash.salt(salt);
    }

    #[cfg(test)]
    pub(crate) fn force_pid(&mut self, pid: i32) {
        self.pid = pid;
    }
}

/// Reassembles messages from raw transport bytes. At most one message per
/// sender pid is in flight; a chunk with a fresh mid replaces a stale
/// half-built message from the same sender.
pub struct Decoder {
    chunk_size: usize,
    hash: Hash,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already consumed; compacted lazily.
    consumed: usize,
    inflight: HashMap<i32, (u8, Vec<u8>)>,
    queue: VecDeque<Message>,
    /// Sender of the most recently completed message.
    last_pid: i32,
    /// True while scanning for the next plausible header after a framing
    /// loss, so one loss is logged once rather than per byte.
    resyncing: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            hash: Hash::new(),
            buffer: Vec::new(),
            consumed: 0,
            inflight: HashMap::new(),
            queue: VecDeque::new(),
            last_pid: 0,
            resyncing: false,
        }
    }

    /// Feeds raw bytes. Completed messages accumulate in the queue; the
    /// first chunk-level failure is reported after the buffer has been
    /// processed as far as possible.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        let mut first_error = None;

        loop {
            let pending = &self.buffer[self.consumed..];
            if pending.len() < HEADER_LEN {
                break;
            }
            let Some(header) = Header::parse(pending, max_payload(self.chunk_size)) else {
                if !self.resyncing {
                    self.resyncing = true;
                    warn!("chunk header magic mismatch, scanning for next frame");
                    if first_error.is_none() {
                        first_error = Some(Error::Protocol(
                            "chunk header magic mismatch".into(),
                        ));
                    }
                }
                self.consumed += 1;
                continue;
            };

            let total = HEADER_LEN + header.size as usize;
            if pending.len() < total {
                break;
            }
            self.resyncing = false;
            let payload = pending[HEADER_LEN..total].to_vec();
            match self.decode_chunk(&header, &payload) {
                Ok(()) => {}
                Err(err) => {
                    // Fatal for this message only; the stream goes on.
                    self.inflight.remove(&header.pid);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            self.consumed += total;
        }

        // Compact once the dead prefix gets large.
        if self.consumed > 64 * 1024 || self.consumed == self.buffer.len() {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn decode_chunk(&mut self, header: &Header, payload: &[u8]) -> Result<()> {
        let opened = self.hash.decode(payload, header.cipher)?;
        let unpacked = self.hash.decompress(&opened, header.method)?;

        let entry = self
            .inflight
            .entry(header.pid)
            .or_insert_with(|| (header.mid, Vec::new()));
        if entry.0 != header.mid {
            // The sender moved on; whatever was half-built is gone.
            *entry = (header.mid, Vec::new());
        }
        entry.1.extend_from_slice(&unpacked);

        if header.finish {
            let (mid, data) = self
                .inflight
                .remove(&header.pid)
                .expect("entry was just inserted");
            self.last_pid = header.pid;
            self.queue.push_back(Message {
                mid,
                pid: header.pid,
                data,
            });
        }
        Ok(())
    }

    /// The oldest completed message, if any.
    pub fn get(&self) -> Option<&Message> {
        self.queue.front()
    }

    /// Drops the oldest completed message.
    pub fn pop(&mut self) {
        self.queue.pop_front();
    }

    pub fn empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Count of completed, not yet popped messages.
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Sender pid of the most recently completed message.
    pub fn pid(&self) -> i32 {
        self.last_pid
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.inflight.clear();
        self.queue.clear();
    }

    pub fn chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn password(&mut self, password: impl Into<Vec<u8>>) {
        self.hash.password(password);
    }

    pub fn salt(&mut self, salt: impl Into<Vec<u8>>) {
        self.hash.salt(salt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(cipher: Cipher, method: Method, chunk: usize) -> (Encoder, Decoder) {
        let mut encoder = Encoder::new();
        encoder.cipher(cipher);
        encoder.method(method);
        encoder.chunk_size(chunk);
        encoder.password("secret");
        encoder.salt("NaCl");

        let mut decoder = Decoder::new();
        decoder.chunk_size(chunk);
        decoder.password("secret");
        decoder.salt("NaCl");
        (encoder, decoder)
    }

    fn drain(encoder: &mut Encoder, decoder: &mut Decoder) {
        decoder.push(encoder.data()).unwrap();
        encoder.erase(encoder.size());
    }

    fn chunk_count(stream: &[u8], chunk_size: usize) -> usize {
        let mut count = 0;
        let mut offset = 0;
        while offset < stream.len() {
            let header =
                Header::parse(&stream[offset..], max_payload(chunk_size)).expect("valid stream");
            count += 1;
            offset += HEADER_LEN + header.size as usize;
        }
        count
    }

    #[test]
    fn round_trips_across_all_cipher_method_pairs() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 256) as u8).collect();
        for cipher in [Cipher::None, Cipher::Base64, Cipher::Aes128, Cipher::Aes256] {
            for method in [Method::None, Method::Gzip, Method::Lz4, Method::Zstd] {
                let (mut encoder, mut decoder) = pair(cipher, method, CHUNK_SIZE);
                encoder.push(&payload).unwrap();
                drain(&mut encoder, &mut decoder);

                assert_eq!(decoder.size(), 1, "{cipher:?}/{method:?}");
                assert_eq!(decoder.get().unwrap().data, payload, "{cipher:?}/{method:?}");
                decoder.pop();
                assert!(decoder.empty());
            }
        }
    }

    #[test]
    fn message_sequence_survives_arbitrary_transit_chunking() {
        let (mut encoder, mut decoder) = pair(Cipher::Aes192, Method::Deflate, 512);
        let messages: Vec<Vec<u8>> = (0..20u8)
            .map(|i| vec![i; 100 * (i as usize + 1)])
            .collect();
        for message in &messages {
            encoder.push(message).unwrap();
        }

        // Re-chunk the wire stream at "random" boundaries.
        let stream = encoder.data().to_vec();
        let mut state = 0x9e3779b9u32;
        let mut offset = 0;
        while offset < stream.len() {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let step = 1 + (state as usize % 97);
            let end = (offset + step).min(stream.len());
            decoder.push(&stream[offset..end]).unwrap();
            offset = end;
        }

        assert_eq!(decoder.size(), messages.len());
        for (i, expected) in messages.iter().enumerate() {
            let got = decoder.get().unwrap();
            assert_eq!(got.mid, i as u8);
            assert_eq!(&got.data, expected);
            decoder.pop();
        }
    }

    #[test]
    fn two_messages_split_across_a_hundred_pushes() {
        let (mut encoder, mut decoder) = pair(Cipher::None, Method::None, CHUNK_SIZE);
        let first = vec![0xabu8; 10_000];
        let second = vec![0xcdu8; 7_777];
        encoder.push(&first).unwrap();
        encoder.push(&second).unwrap();

        let stream = encoder.data().to_vec();
        let step = stream.len() / 100 + 1;
        for piece in stream.chunks(step) {
            decoder.push(piece).unwrap();
        }

        assert_eq!(decoder.size(), 2);
        assert_eq!(decoder.get().unwrap().data, first);
        decoder.pop();
        assert_eq!(decoder.get().unwrap().data, second);
        assert_eq!(decoder.pid(), std::process::id() as i32);
        decoder.pop();
    }

    #[test]
    fn zero_length_message_is_one_terminal_chunk() {
        let (mut encoder, mut decoder) = pair(Cipher::Aes256, Method::Gzip, CHUNK_SIZE);
        encoder.push(&[]).unwrap();
        assert_eq!(encoder.size(), HEADER_LEN);

        drain(&mut encoder, &mut decoder);
        assert_eq!(decoder.size(), 1);
        assert!(decoder.get().unwrap().data.is_empty());
    }

    #[test]
    fn chunk_boundaries_are_exact() {
        // chunk_size bytes -> one chunk, one more byte -> two chunks.
        let (mut encoder, _) = pair(Cipher::None, Method::None, 4096);
        encoder.push(&vec![1u8; 4096]).unwrap();
        assert_eq!(chunk_count(encoder.data(), 4096), 1);
        encoder.clear();

        encoder.push(&vec![1u8; 4097]).unwrap();
        assert_eq!(chunk_count(encoder.data(), 4096), 2);

        // Single byte round-trips too.
        let (mut encoder, mut decoder) = pair(Cipher::None, Method::None, 4096);
        encoder.push(&[42]).unwrap();
        drain(&mut encoder, &mut decoder);
        assert_eq!(decoder.get().unwrap().data, vec![42]);
    }

    #[test]
    fn tiny_and_large_chunk_sizes_are_invisible_end_to_end() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        for chunk in [1usize, 7, 255, 4096, 1 << 20] {
            let (mut encoder, mut decoder) = pair(Cipher::None, Method::Lz4, chunk);
            encoder.push(&payload).unwrap();
            drain(&mut encoder, &mut decoder);
            assert_eq!(decoder.get().unwrap().data, payload, "chunk={chunk}");
        }
    }

    #[test]
    fn large_zero_message_stays_small_on_the_wire() {
        let (mut encoder, mut decoder) = pair(Cipher::None, Method::Zstd, 4096);
        let payload = vec![0u8; 1 << 20];
        encoder.push(&payload).unwrap();
        assert!(encoder.size() < (1 << 20) / 10, "wire = {}", encoder.size());

        drain(&mut encoder, &mut decoder);
        assert_eq!(decoder.size(), 1);
        assert_eq!(decoder.get().unwrap().data, payload);
    }

    #[test]
    fn decoder_resynchronizes_after_garbage() {
        let (mut encoder, mut decoder) = pair(Cipher::None, Method::None, CHUNK_SIZE);
        encoder.push(b"before").unwrap();
        let mut stream = encoder.data().to_vec();
        encoder.clear();

        // Interpose garbage between two valid messages.
        stream.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22]);
        encoder.push(b"after").unwrap();
        stream.extend_from_slice(encoder.data());

        let result = decoder.push(&stream);
        assert!(matches!(result, Err(Error::Protocol(_))));

        assert_eq!(decoder.size(), 2);
        assert_eq!(decoder.get().unwrap().data, b"before");
        decoder.pop();
        assert_eq!(decoder.get().unwrap().data, b"after");
    }

    #[test]
    fn wrong_password_fails_the_chunk_but_not_the_stream() {
        let (mut encoder, _) = pair(Cipher::Aes128, Method::Gzip, CHUNK_SIZE);
        let mut decoder = Decoder::new();
        decoder.password("wrong");
        decoder.salt("NaCl");

        encoder.push(b"opaque message").unwrap();
        // Decryption with the wrong key yields gzip garbage.
        assert!(decoder.push(encoder.data()).is_err());
        assert!(decoder.empty());

        // The same decoder keeps working for plaintext traffic.
        let (mut plain, _) = pair(Cipher::None, Method::None, CHUNK_SIZE);
        plain.push(b"clear message").unwrap();
        decoder.push(plain.data()).unwrap();
        assert_eq!(decoder.get().unwrap().data, b"clear message");
    }

    #[test]
    fn one_in_flight_message_per_sender() {
        let (_, mut decoder) = pair(Cipher::None, Method::None, 8);

        // Interleave chunk streams from two senders.
        let mut left = Encoder::new();
        left.chunk_size(8);
        left.force_pid(111);
        let mut right = Encoder::new();
        right.chunk_size(8);
        right.force_pid(222);

        left.push(b"left message body").unwrap();
        right.push(b"right message body").unwrap();

        // Split each stream at a chunk boundary and interleave.
        let left_stream = left.data().to_vec();
        let right_stream = right.data().to_vec();
        let cut = HEADER_LEN + 8;
        decoder.push(&left_stream[..cut]).unwrap();
        decoder.push(&right_stream[..cut]).unwrap();
        decoder.push(&left_stream[cut..]).unwrap();
        decoder.push(&right_stream[cut..]).unwrap();

        assert_eq!(decoder.size(), 2);
        assert_eq!(decoder.get().unwrap().data, b"left message body");
        assert_eq!(decoder.get().unwrap().pid, 111);
        decoder.pop();
        assert_eq!(decoder.get().unwrap().data, b"right message body");
        decoder.pop();
        assert_eq!(decoder.pid(), 222);
    }

    #[test]
    fn stale_mid_is_replaced_by_a_fresh_message() {
        let (_, mut decoder) = pair(Cipher::None, Method::None, 8);

        let mut encoder = Encoder::new();
        encoder.chunk_size(8);
        encoder.force_pid(42);
        encoder.push(b"0123456789abcdef").unwrap();
        let stream = encoder.data().to_vec();
        encoder.clear();

        // Deliver only the first chunk of the first message.
        decoder.push(&stream[..HEADER_LEN + 8]).unwrap();
        assert!(decoder.empty());

        // A complete second message supersedes the half-built one.
        encoder.push(b"fresh").unwrap();
        decoder.push(encoder.data()).unwrap();
        assert_eq!(decoder.size(), 1);
        assert_eq!(decoder.get().unwrap().data, b"fresh");
    }

    #[test]
    fn sixteen_megabyte_message_round_trips() {
        let payload: Vec<u8> = (0..(16 << 20) as u32).map(|i| (i % 253) as u8).collect();
        let (mut encoder, mut decoder) = pair(Cipher::Aes256, Method::Lz4, CHUNK_SIZE);
        encoder.push(&payload).unwrap();
        drain(&mut encoder, &mut decoder);
        assert_eq!(decoder.size(), 1);
        assert_eq!(decoder.get().unwrap().data, payload);
    }
}
