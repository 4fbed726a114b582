use std::fmt;
use std::str::FromStr;

/// Pixel encodings the resize node understands. All are 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Mono8,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Mono8 => "mono8",
            Encoding::Rgb8 => "rgb8",
            Encoding::Bgr8 => "bgr8",
            Encoding::Rgba8 => "rgba8",
            Encoding::Bgra8 => "bgra8",
        }
    }

    /// Number of interleaved channels per pixel.
    pub fn channels(&self) -> usize {
        match self {
            Encoding::Mono8 => 1,
            Encoding::Rgb8 | Encoding::Bgr8 => 3,
            Encoding::Rgba8 | Encoding::Bgra8 => 4,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported pixel encoding {0:?}")]
pub struct UnknownEncoding(pub String);

impl FromStr for Encoding {
    type Err = UnknownEncoding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mono8" => Ok(Encoding::Mono8),
            "rgb8" => Ok(Encoding::Rgb8),
            "bgr8" => Ok(Encoding::Bgr8),
            "rgba8" => Ok(Encoding::Rgba8),
            "bgra8" => Ok(Encoding::Bgra8),
            other => Err(UnknownEncoding(other.to_string())),
        }
    }
}

/// A raw camera image with its capture header.
///
/// `encoding` is kept as the tag received on the wire; interpreting it is the
/// consumer's job, so frames with encodings this crate does not know still
/// deserialize.
///
/// Binary wire format (big-endian):
///
///   [0]        version = 0x01
///   [1..9]     stamp_ms      (i64, Unix millis)
///   [9..17]    seq           (u64)
///   [17..21]   width         (u32)
///   [21..25]   height        (u32)
///   [25..29]   step          (u32, bytes per row including padding)
///   [29]       is_bigendian  (u8, 0 or 1)
///   [30]       encoding_len  (u8), then encoding bytes
///   [..]       frame_id_len  (u8), then frame_id bytes
///   [..]       data_len      (u32), then pixel data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub stamp_ms: i64,
    pub seq: u64,
    pub frame_id: String,
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub is_bigendian: bool,
    pub step: u32,
    pub data: Vec<u8>,
}

const WIRE_VERSION: u8 = 0x01;
const FIXED_HEADER_SIZE: usize = 31; // up to and including encoding_len

impl ImageFrame {
    /// Build a tightly packed frame (`step = width * channels`).
    pub fn packed(encoding: Encoding, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            stamp_ms: 0,
            seq: 0,
            frame_id: String::new(),
            width,
            height,
            encoding: encoding.as_str().to_string(),
            is_bigendian: false,
            step: width.saturating_mul(encoding.channels() as u32),
            data,
        }
    }

    /// Copy `stamp_ms`, `seq` and `frame_id` from another frame.
    pub fn with_header_of(mut self, other: &ImageFrame) -> Self {
        self.stamp_ms = other.stamp_ms;
        self.seq = other.seq;
        self.frame_id = other.frame_id.clone();
        self
    }

    /// Parse the encoding tag.
    pub fn pixel_encoding(&self) -> Result<Encoding, UnknownEncoding> {
        self.encoding.parse()
    }

    // -- Serialization ----------------------------------------------------------

    /// Encode to the wire format. `encoding` and `frame_id` are cut to at most
    /// 255 bytes on a character boundary.
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        let encoding = truncate_to_u8_len(&self.encoding).as_bytes();
        let frame_id = truncate_to_u8_len(&self.frame_id).as_bytes();
        let data_len = wire_len(self.data.len())?;

        let mut buf = Vec::with_capacity(
            FIXED_HEADER_SIZE + encoding.len() + 1 + frame_id.len() + 4 + self.data.len(),
        );
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(&self.stamp_ms.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.width.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.step.to_be_bytes());
        buf.push(self.is_bigendian as u8);
        buf.push(encoding.len() as u8);
        buf.extend_from_slice(encoding);
        buf.push(frame_id.len() as u8);
        buf.extend_from_slice(frame_id);
        buf.extend_from_slice(&data_len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        if data[0] != WIRE_VERSION {
            return Err(FrameError::UnknownVersion(data[0]));
        }

        let mut cursor = Cursor { data, pos: 1 };
        let stamp_ms = i64::from_be_bytes(cursor.array()?);
        let seq = u64::from_be_bytes(cursor.array()?);
        let width = u32::from_be_bytes(cursor.array()?);
        let height = u32::from_be_bytes(cursor.array()?);
        let step = u32::from_be_bytes(cursor.array()?);
        let is_bigendian = cursor.take(1)?[0] != 0;

        let encoding_len = cursor.take(1)?[0] as usize;
        let encoding = cursor.utf8(encoding_len, "encoding")?;
        let frame_id_len = cursor.take(1)?[0] as usize;
        let frame_id = cursor.utf8(frame_id_len, "frame_id")?;

        let data_len = u32::from_be_bytes(cursor.array()?) as usize;
        let pixels = cursor.take(data_len)?.to_vec();

        Ok(Self {
            stamp_ms,
            seq,
            frame_id,
            width,
            height,
            encoding,
            is_bigendian,
            step,
            data: pixels,
        })
    }
}

fn truncate_to_u8_len(s: &str) -> &str {
    let mut end = s.len().min(u8::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn wire_len(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge(len))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(FrameError::TooShort {
                got: self.data.len(),
                expected: end,
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let got = self.data.len();
        self.take(N)?.try_into().map_err(|_| FrameError::TooShort {
            got,
            expected: self.pos,
        })
    }

    fn utf8(&mut self, n: usize, field: &'static str) -> Result<String, FrameError> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("unknown frame wire version {0:#04x}")]
    UnknownVersion(u8),
    #[error("frame payload too short: got {got} bytes, expected at least {expected}")]
    TooShort { got: usize, expected: usize },
    #[error("frame field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("pixel payload of {0} bytes does not fit the wire length field")]
    PayloadTooLarge(usize),
}
