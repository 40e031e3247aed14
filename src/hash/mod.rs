//! Compression and symmetric encryption used by the cluster message
//! protocol. The two operations are orthogonal and never combined here;
//! callers stack them in whatever order their framing needs.

mod cipher;
mod compress;

use crate::error::Result;

/// Symmetric transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Cipher {
    #[default]
    None = 0x00,
    Base64 = 0x01,
    Aes128 = 0x02,
    Aes192 = 0x03,
    Aes256 = 0x04,
}

impl Cipher {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Base64),
            0x02 => Some(Self::Aes128),
            0x03 => Some(Self::Aes192),
            0x04 => Some(Self::Aes256),
            _ => None,
        }
    }
}

/// Compression methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Method {
    #[default]
    None = 0x00,
    Gzip = 0x01,
    Deflate = 0x02,
    Bzip2 = 0x03,
    Brotli = 0x04,
    Lz4 = 0x05,
    Lzma = 0x06,
    Zstd = 0x07,
}

impl Method {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Gzip),
            0x02 => Some(Self::Deflate),
            0x03 => Some(Self::Bzip2),
            0x04 => Some(Self::Brotli),
            0x05 => Some(Self::Lz4),
            0x06 => Some(Self::Lzma),
            0x07 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Effort selector, mapped per method (see the tables in `compress.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    Speed,
    #[default]
    Normal,
    Best,
}

/// Codec state: key material for the ciphers and retained streaming
/// contexts for DEFLATE takeover mode. Everything else is stateless per
/// call.
pub struct Hash {
    password: Vec<u8>,
    salt: Vec<u8>,
    rounds: u32,
    level: Level,
    /// DEFLATE window bits knob; retained for API parity, the raw-deflate
    /// coder always runs with a raw (headerless) window.
    wbit: i32,
    takeover_compress: bool,
    takeover_decompress: bool,
    deflate_ctx: Option<flate2::Compress>,
    inflate_ctx: Option<flate2::Decompress>,
}

impl Default for Hash {
    fn default() -> Self {
        Self::new()
    }
}

impl Hash {
    pub fn new() -> Self {
        Self {
            password: Vec::new(),
            salt: Vec::new(),
            rounds: 1,
            level: Level::default(),
            wbit: -15,
            takeover_compress: false,
            takeover_decompress: false,
            deflate_ctx: None,
            inflate_ctx: None,
        }
    }

    pub fn password(&mut self, password: impl Into<Vec<u8>>) {
        self.password = password.into();
    }

    pub fn salt(&mut self, salt: impl Into<Vec<u8>>) {
        self.salt = salt.into();
    }

    /// Key-derivation round count; 1 matches the historical default.
    pub fn rounds(&mut self, rounds: u32) {
        self.rounds = rounds.max(1);
    }

    pub fn level(&mut self, level: Level) {
        self.level = level;
    }

    pub fn wbit(&mut self, wbit: i32) {
        self.wbit = wbit;
    }

    /// Retain a DEFLATE compression context across calls, flushing each call
    /// so the output can be framed into wire chunks.
    pub fn takeover_compress(&mut self, enabled: bool) {
        self.takeover_compress = enabled;
        if !enabled {
            self.deflate_ctx = None;
        }
    }

    pub fn takeover_decompress(&mut self, enabled: bool) {
        self.takeover_decompress = enabled;
        if !enabled {
            self.inflate_ctx = None;
        }
    }

    /// Applies `method` to `data`. Empty input stays empty for every method.
    pub fn compress(&mut self, data: &[u8], method: Method) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        compress::compress(self, data, method)
    }

    /// Reverses [`compress`](Self::compress).
    pub fn decompress(&mut self, data: &[u8], method: Method) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        compress::decompress(self, data, method)
    }

    /// Applies `cipher` to `data` (encrypt / textual encode).
    pub fn encode(&self, data: &[u8], cipher: Cipher) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        cipher::encode(self, data, cipher)
    }

    /// Reverses [`encode`](Self::encode).
    pub fn decode(&self, data: &[u8], cipher: Cipher) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        cipher::decode(self, data, cipher)
    }

    pub(crate) fn key_material(&self) -> (&[u8], &[u8], u32) {
        (&self.password, &self.salt, self.rounds)
    }

    pub(crate) fn effort(&self) -> Level {
        self.level
    }

    /// Negative values mean a raw (headerless) deflate window, which is the
    /// only framing the chunked wire format uses.
    pub(crate) fn window_bits(&self) -> i32 {
        self.wbit
    }

    pub(crate) fn takeover(&mut self) -> (&mut Option<flate2::Compress>, bool) {
        (&mut self.deflate_ctx, self.takeover_compress)
    }

    pub(crate) fn takeover_inflate(&mut self) -> (&mut Option<flate2::Decompress>, bool) {
        (&mut self.inflate_ctx, self.takeover_decompress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: [Method; 8] = [
        Method::None,
        Method::Gzip,
        Method::Deflate,
        Method::Bzip2,
        Method::Brotli,
        Method::Lz4,
        Method::Lzma,
        Method::Zstd,
    ];

    const CIPHERS: [Cipher; 5] = [
        Cipher::None,
        Cipher::Base64,
        Cipher::Aes128,
        Cipher::Aes192,
        Cipher::Aes256,
    ];

    fn configured() -> Hash {
        let mut hash = Hash::new();
        hash.password("correct horse battery staple");
        hash.salt("NaCl");
        hash
    }

    #[test]
    fn every_method_round_trips() {
        let mut hash = configured();
        let payload: Vec<u8> = (0..16_384u32).map(|i| (i % 251) as u8).collect();
        for method in METHODS {
            let packed = hash.compress(&payload, method).unwrap();
            let unpacked = hash.decompress(&packed, method).unwrap();
            assert_eq!(unpacked, payload, "{method:?}");
        }
    }

    #[test]
    fn every_cipher_round_trips() {
        let hash = configured();
        let payload = b"attack at dawn \x00\x01\x02\xff".to_vec();
        for cipher in CIPHERS {
            let sealed = hash.encode(&payload, cipher).unwrap();
            let opened = hash.decode(&sealed, cipher).unwrap();
            assert_eq!(opened, payload, "{cipher:?}");
        }
    }

    #[test]
    fn aes_does_not_pad_the_length() {
        let hash = configured();
        for len in [1usize, 15, 16, 17, 1000] {
            let payload = vec![0x5a; len];
            let sealed = hash.encode(&payload, Cipher::Aes256).unwrap();
            assert_eq!(sealed.len(), len);
            assert_ne!(sealed, payload);
        }
    }

    #[test]
    fn aes_with_wrong_password_garbles() {
        let hash = configured();
        let sealed = hash.encode(b"secret data here", Cipher::Aes128).unwrap();

        let mut other = Hash::new();
        other.password("not the password");
        other.salt("NaCl");
        let opened = other.decode(&sealed, Cipher::Aes128).unwrap();
        assert_ne!(opened, b"secret data here");
    }

    #[test]
    fn base64_is_deterministic_text() {
        let hash = Hash::new();
        let sealed = hash.encode(b"hello world", Cipher::Base64).unwrap();
        assert_eq!(sealed, b"aGVsbG8gd29ybGQ=");
        assert_eq!(hash.encode(b"hello world", Cipher::Base64).unwrap(), sealed);
        assert_eq!(hash.decode(&sealed, Cipher::Base64).unwrap(), b"hello world");
    }

    #[test]
    fn corrupt_base64_reports_codec_error() {
        let hash = Hash::new();
        let err = hash.decode(b"@@not base64@@", Cipher::Base64).unwrap_err();
        assert!(matches!(err, crate::error::Error::Codec { .. }));
    }

    #[test]
    fn truncated_gzip_reports_codec_error() {
        let mut hash = Hash::new();
        let packed = hash.compress(b"some compressible data", Method::Gzip).unwrap();
        let err = hash.decompress(&packed[..packed.len() / 2], Method::Gzip);
        assert!(err.is_err());
    }

    #[test]
    fn takeover_deflate_streams_across_calls() {
        let mut sender = Hash::new();
        sender.takeover_compress(true);
        let mut receiver = Hash::new();
        receiver.takeover_decompress(true);

        // Each frame is independently flushed, so the receiver can inflate
        // them as they arrive while the dictionary carries over.
        let frames: Vec<&[u8]> = vec![
            b"first frame of the stream",
            b"second frame of the stream",
            b"first frame of the stream",
        ];
        let mut compressed_sizes = Vec::new();
        for frame in &frames {
            let packed = sender.compress(frame, Method::Deflate).unwrap();
            compressed_sizes.push(packed.len());
            let unpacked = receiver.decompress(&packed, Method::Deflate).unwrap();
            assert_eq!(&unpacked, frame);
        }
        // The third frame repeats the first; the shared dictionary must make
        // it smaller than the first time around.
        assert!(compressed_sizes[2] < compressed_sizes[0]);
    }

    #[test]
    fn levels_change_effort_not_content() {
        let payload: Vec<u8> = std::iter::repeat_with({
            let mut x = 1u32;
            move || {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                (x >> 24) as u8
            }
        })
        .take(8192)
        .collect();

        for level in [Level::Speed, Level::Normal, Level::Best] {
            let mut hash = Hash::new();
            hash.level(level);
            for method in [Method::Gzip, Method::Zstd, Method::Lz4] {
                let packed = hash.compress(&payload, method).unwrap();
                assert_eq!(hash.decompress(&packed, method).unwrap(), payload);
            }
        }
    }

    #[test]
    fn empty_input_is_identity_everywhere() {
        let mut hash = configured();
        for method in METHODS {
            assert!(hash.compress(&[], method).unwrap().is_empty());
            assert!(hash.decompress(&[], method).unwrap().is_empty());
        }
        for cipher in CIPHERS {
            assert!(hash.encode(&[], cipher).unwrap().is_empty());
            assert!(hash.decode(&[], cipher).unwrap().is_empty());
        }
    }
}
