//! Tick wire record and channel framing
//!
//! Fields are written one by one in little-endian order; the byte layout is
//! part of the protocol and never depends on in-memory struct layout.
//!
//! ```text
//! offset  size  field
//!      0     1  version (WIRE_VERSION)
//!      1     1  kind
//!      2     2  reserved, zero
//!      4     8  ask       f64
//!     12     8  bid       f64
//!     20     8  last      f64
//!     28     8  price     f64
//!     36     8  time      i64 (platform ticks)
//!     44     8  volume    i64
//!     52     8  sequence  u64
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;
use crate::time::Timestamped;

pub const WIRE_VERSION: u8 = 1;

/// Encoded size of one tick record
pub const WIRE_RECORD_LEN: usize = 60;

/// Size of the length prefix in `Framing::LengthPrefixed`
const LENGTH_PREFIX_LEN: usize = 4;

/// What kind of market data event a tick carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TickKind {
    Ask = 0,
    Bid = 1,
    Last = 2,
    DailyHigh = 3,
    DailyLow = 4,
    DailyVolume = 5,
    LastClose = 6,
    Opening = 7,
    OpenInterest = 8,
    Settlement = 9,
    Unknown = 10,
}

impl TryFrom<u8> for TickKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TickKind::Ask,
            1 => TickKind::Bid,
            2 => TickKind::Last,
            3 => TickKind::DailyHigh,
            4 => TickKind::DailyLow,
            5 => TickKind::DailyVolume,
            6 => TickKind::LastClose,
            7 => TickKind::Opening,
            8 => TickKind::OpenInterest,
            9 => TickKind::Settlement,
            10 => TickKind::Unknown,
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown tick kind {}",
                    other
                )))
            }
        })
    }
}

/// The unit exchanged between the two platforms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub ask: f64,
    pub bid: f64,
    pub last: f64,
    pub kind: TickKind,
    pub price: f64,
    /// Platform ticks (100ns since 0001-01-01 UTC)
    pub time: i64,
    pub volume: i64,
    /// Stamped by the writer, strictly increasing from 1 per writer instance
    pub sequence: u64,
}

impl Tick {
    /// Quote update with no trade attached
    pub fn quote(time: i64, bid: f64, ask: f64) -> Self {
        Self {
            ask,
            bid,
            last: 0.0,
            kind: TickKind::Bid,
            price: bid,
            time,
            volume: 0,
            sequence: 0,
        }
    }

    /// Trade print against the prevailing quote
    pub fn trade(time: i64, price: f64, volume: i64, bid: f64, ask: f64) -> Self {
        Self {
            ask,
            bid,
            last: price,
            kind: TickKind::Last,
            price,
            time,
            volume,
            sequence: 0,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(WIRE_RECORD_LEN);
        dst.put_u8(WIRE_VERSION);
        dst.put_u8(self.kind as u8);
        dst.put_u16_le(0);
        dst.put_f64_le(self.ask);
        dst.put_f64_le(self.bid);
        dst.put_f64_le(self.last);
        dst.put_f64_le(self.price);
        dst.put_i64_le(self.time);
        dst.put_i64_le(self.volume);
        dst.put_u64_le(self.sequence);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, TransportError> {
        if src.len() != WIRE_RECORD_LEN {
            return Err(TransportError::Protocol(format!(
                "tick record is {} bytes, expected {}",
                src.len(),
                WIRE_RECORD_LEN
            )));
        }
        let version = src.get_u8();
        if version != WIRE_VERSION {
            return Err(TransportError::Protocol(format!(
                "unsupported wire version {}",
                version
            )));
        }
        let kind = TickKind::try_from(src.get_u8())?;
        let _reserved = src.get_u16_le();
        Ok(Self {
            ask: src.get_f64_le(),
            bid: src.get_f64_le(),
            last: src.get_f64_le(),
            kind,
            price: src.get_f64_le(),
            time: src.get_i64_le(),
            volume: src.get_i64_le(),
            sequence: src.get_u64_le(),
        })
    }
}

impl Timestamped for Tick {
    fn timestamp(&self) -> i64 {
        self.time
    }
}

/// How records are delimited on a channel. Both ends must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Back-to-back fixed-size records
    #[default]
    Raw,
    /// 4-byte little-endian length before every record
    LengthPrefixed,
}

/// Tokio codec for a tick channel
#[derive(Debug, Clone, Copy, Default)]
pub struct TickCodec {
    framing: Framing,
}

impl TickCodec {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

impl Encoder<Tick> for TickCodec {
    type Error = TransportError;

    fn encode(&mut self, tick: Tick, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.framing == Framing::LengthPrefixed {
            dst.reserve(LENGTH_PREFIX_LEN + WIRE_RECORD_LEN);
            dst.put_u32_le(WIRE_RECORD_LEN as u32);
        }
        tick.encode(dst);
        Ok(())
    }
}

impl Decoder for TickCodec {
    type Item = Tick;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::Raw => {
                if src.len() < WIRE_RECORD_LEN {
                    src.reserve(WIRE_RECORD_LEN - src.len());
                    return Ok(None);
                }
                let frame = src.split_to(WIRE_RECORD_LEN);
                Tick::decode(&frame).map(Some)
            }
            Framing::LengthPrefixed => {
                if src.len() < LENGTH_PREFIX_LEN {
                    return Ok(None);
                }
                let mut prefix = [0u8; LENGTH_PREFIX_LEN];
                prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
                let len = u32::from_le_bytes(prefix) as usize;
                if len != WIRE_RECORD_LEN {
                    return Err(TransportError::Protocol(format!(
                        "frame length {} does not match tick record length {}",
                        len, WIRE_RECORD_LEN
                    )));
                }
                if src.len() < LENGTH_PREFIX_LEN + len {
                    src.reserve(LENGTH_PREFIX_LEN + len - src.len());
                    return Ok(None);
                }
                src.advance(LENGTH_PREFIX_LEN);
                let frame = src.split_to(len);
                Tick::decode(&frame).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tick {
        Tick {
            ask: 1.10012,
            bid: 1.10005,
            last: 1.1001,
            kind: TickKind::Last,
            price: 1.1001,
            time: 638_400_000_000_000_000,
            volume: 3,
            sequence: 42,
        }
    }

    #[test]
    fn test_record_layout_is_fixed() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        assert_eq!(buf.len(), WIRE_RECORD_LEN);
        assert_eq!(buf[0], WIRE_VERSION);
        assert_eq!(buf[1], TickKind::Last as u8);
        assert_eq!(&buf[2..4], &[0, 0]);
        assert_eq!(&buf[4..12], &1.10012f64.to_le_bytes());
        assert_eq!(&buf[36..44], &638_400_000_000_000_000i64.to_le_bytes());
        assert_eq!(&buf[52..60], &42u64.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_bad_version_and_kind() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);

        let mut bad_version = buf.clone();
        bad_version[0] = 9;
        assert!(matches!(
            Tick::decode(&bad_version),
            Err(TransportError::Protocol(_))
        ));

        let mut bad_kind = buf.clone();
        bad_kind[1] = 200;
        assert!(matches!(
            Tick::decode(&bad_kind),
            Err(TransportError::Protocol(_))
        ));

        assert!(Tick::decode(&buf[..10]).is_err());
    }

    #[test]
    fn test_raw_codec_waits_for_whole_record() {
        let mut codec = TickCodec::new(Framing::Raw);
        let mut encoded = BytesMut::new();
        codec.encode(sample(), &mut encoded).unwrap();
        codec.encode(sample(), &mut encoded).unwrap();
        assert_eq!(encoded.len(), 2 * WIRE_RECORD_LEN);

        let mut partial = encoded.split_to(WIRE_RECORD_LEN - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(encoded);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(sample()));
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(sample()));
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_length_prefixed_codec() {
        let mut codec = TickCodec::new(Framing::LengthPrefixed);
        let mut encoded = BytesMut::new();
        codec.encode(sample(), &mut encoded).unwrap();
        assert_eq!(encoded.len(), 4 + WIRE_RECORD_LEN);
        assert_eq!(&encoded[..4], &(WIRE_RECORD_LEN as u32).to_le_bytes());
        assert_eq!(codec.decode(&mut encoded).unwrap(), Some(sample()));
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_mixed_framing_is_a_protocol_error() {
        let mut raw = TickCodec::new(Framing::Raw);
        let mut encoded = BytesMut::new();
        raw.encode(sample(), &mut encoded).unwrap();

        let mut prefixed = TickCodec::new(Framing::LengthPrefixed);
        assert!(matches!(
            prefixed.decode(&mut encoded),
            Err(TransportError::Protocol(_))
        ));
    }
}
