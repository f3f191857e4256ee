//! Board frame layouts and the record decoder.
//!
//! Every frame is [FRAME_LEN] bytes, big-endian. Headers and footers are recognized by their
//! leading 4-byte marker only; anything else in a data-expecting position is a [Data] record.
use serde::{Deserialize, Serialize};

use crate::channel::BoardId;

/// Length in bytes of every frame.
pub const FRAME_LEN: usize = 13;

/// One undecoded frame.
pub type RawFrame = [u8; FRAME_LEN];

/// Mask of the 27-bit data counter.
pub const COUNTER_MASK: u32 = 0x07ff_ffff;
/// Number of counts before the data counter wraps.
pub const COUNTER_PERIOD: i64 = 1 << 27;

pub const HEADER_MARKER: [u8; 4] = [0x01, 0x23, 0x45, 0x67];
pub const HEADER_TRAILER: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab];
pub const FOOTER_MARKER: [u8; 4] = [0xaa, 0xaa, 0xaa, 0xaa];
pub const FOOTER_TRAILER: u8 = 0xab;

/// Number of primary (64-bit mask) channels.
pub const PRIMARY_CHANNELS: u8 = 64;
/// Number of secondary (12-bit mask) channels.
pub const SECONDARY_CHANNELS: u8 = 12;

#[must_use]
pub fn is_header(raw: &RawFrame) -> bool {
    raw[..4] == HEADER_MARKER
}

#[must_use]
pub fn is_footer(raw: &RawFrame) -> bool {
    raw[..4] == FOOTER_MARKER
}

/// Start-of-spill frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub spill: u16,
    pub board: BoardId,
}

impl Header {
    /// Decode from `raw`, or `None` if the header marker is absent.
    #[must_use]
    pub fn decode(raw: &RawFrame) -> Option<Self> {
        if !is_header(raw) {
            return None;
        }
        Some(Header {
            spill: u16::from_be_bytes([raw[4], raw[5]]),
            board: raw[6] & 0x0f,
        })
    }

    #[must_use]
    pub fn encode(&self) -> RawFrame {
        let mut raw = [0u8; FRAME_LEN];
        raw[..4].copy_from_slice(&HEADER_MARKER);
        raw[4..6].copy_from_slice(&self.spill.to_be_bytes());
        raw[6] = self.board & 0x0f;
        raw[7..].copy_from_slice(&HEADER_TRAILER);
        raw
    }
}

/// One hit record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Data {
    /// Primary hit mask; bit `n` is primary channel `n`.
    pub primary: u64,
    /// Secondary hit mask, 12 significant bits.
    pub secondary: u16,
    /// Sync-pulse flag.
    pub sync: bool,
    /// Raw 27-bit counter.
    pub counter: u32,
    /// Number of counter wraps since the spill header, assigned by [FrameDecoder].
    pub overflow: u32,
}

impl Data {
    /// Parse the fields of `raw` without any decoder state; `overflow` is zero.
    #[must_use]
    pub fn parse(raw: &RawFrame) -> Self {
        let mut primary = [0u8; 8];
        primary.copy_from_slice(&raw[..8]);
        Data {
            primary: u64::from_be_bytes(primary),
            secondary: u16::from_be_bytes([raw[8], raw[9]]) >> 4,
            sync: (raw[9] >> 3) & 0x1 == 1,
            counter: raw_counter(raw),
            overflow: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> RawFrame {
        let mut raw = [0u8; FRAME_LEN];
        raw[..8].copy_from_slice(&self.primary.to_be_bytes());
        let secondary = self.secondary & 0x0fff;
        let counter = self.counter & COUNTER_MASK;
        raw[8] = (secondary >> 4) as u8;
        raw[9] = ((secondary & 0x0f) << 4) as u8 | u8::from(self.sync) << 3 | (counter >> 24) as u8;
        raw[10..].copy_from_slice(&counter.to_be_bytes()[1..]);
        raw
    }

    /// Wrap-corrected counter.
    #[must_use]
    pub fn extended(&self) -> i64 {
        i64::from(self.counter) + i64::from(self.overflow) * COUNTER_PERIOD
    }

    #[must_use]
    pub fn primary_hit(&self, channel: u8) -> bool {
        channel < PRIMARY_CHANNELS && (self.primary >> channel) & 1 == 1
    }

    #[must_use]
    pub fn secondary_hit(&self, channel: u8) -> bool {
        channel < SECONDARY_CHANNELS && (self.secondary >> channel) & 1 == 1
    }

    pub fn primary_channels(&self) -> impl Iterator<Item = u8> + '_ {
        (0..PRIMARY_CHANNELS).filter(|ch| self.primary_hit(*ch))
    }

    pub fn secondary_channels(&self) -> impl Iterator<Item = u8> + '_ {
        (0..SECONDARY_CHANNELS).filter(|ch| self.secondary_hit(*ch))
    }
}

/// Raw 27-bit counter field of a data frame.
#[must_use]
pub fn raw_counter(raw: &RawFrame) -> u32 {
    u32::from_be_bytes([raw[9], raw[10], raw[11], raw[12]]) & COUNTER_MASK
}

/// End-of-spill frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub spill: u16,
    pub event_match: u16,
    pub write_count: u32,
}

impl Footer {
    #[must_use]
    pub fn decode(raw: &RawFrame) -> Option<Self> {
        if !is_footer(raw) {
            return None;
        }
        Some(Footer {
            spill: u16::from_be_bytes([raw[4], raw[5]]),
            event_match: u16::from_be_bytes([raw[6], raw[7]]),
            write_count: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        })
    }

    #[must_use]
    pub fn encode(&self) -> RawFrame {
        let mut raw = [0u8; FRAME_LEN];
        raw[..4].copy_from_slice(&FOOTER_MARKER);
        raw[4..6].copy_from_slice(&self.spill.to_be_bytes());
        raw[6..8].copy_from_slice(&self.event_match.to_be_bytes());
        raw[8..12].copy_from_slice(&self.write_count.to_be_bytes());
        raw[12] = FOOTER_TRAILER;
        raw
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// The stream was realigned; the bytes before the new boundary are lost.
    Realigned,
    /// No alignment was found within one frame; a whole frame was discarded.
    Unrepairable,
}

/// Bytes dropped by the resync layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PacketLoss {
    pub kind: LossKind,
    /// Stream offset of the first discarded byte.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Header(Header),
    Data(Data),
    Footer(Footer),
    /// A frame found where a header was required.
    FramingError(RawFrame),
    PacketLoss(PacketLoss),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    None,
    Header,
    Data,
    Footer,
    FramingError,
}

/// Stateful frame classifier and counter extender.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecoderState,
    overflow: u32,
    last_counter: Option<u32>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Whether the next frame is expected to be a data record (or footer).
    #[must_use]
    pub fn expects_data(&self) -> bool {
        matches!(
            self.state,
            DecoderState::Header | DecoderState::Data | DecoderState::FramingError
        )
    }

    pub fn decode(&mut self, raw: &RawFrame) -> Record {
        let record = match self.state {
            DecoderState::None | DecoderState::Footer => match Header::decode(raw) {
                Some(header) => Record::Header(header),
                None => Record::FramingError(*raw),
            },
            DecoderState::FramingError => {
                if let Some(header) = Header::decode(raw) {
                    Record::Header(header)
                } else if let Some(footer) = Footer::decode(raw) {
                    Record::Footer(footer)
                } else {
                    Record::Data(self.extend(Data::parse(raw)))
                }
            }
            DecoderState::Header | DecoderState::Data => match Footer::decode(raw) {
                Some(footer) => Record::Footer(footer),
                None => Record::Data(self.extend(Data::parse(raw))),
            },
        };

        self.state = match &record {
            Record::Header(_) => {
                self.overflow = 0;
                self.last_counter = None;
                DecoderState::Header
            }
            Record::Data(_) => DecoderState::Data,
            Record::Footer(_) => DecoderState::Footer,
            Record::FramingError(_) => DecoderState::FramingError,
            Record::PacketLoss(_) => self.state,
        };
        record
    }

    fn extend(&mut self, mut data: Data) -> Data {
        if let Some(prev) = self.last_counter {
            if data.counter < prev {
                self.overflow += 1;
            }
        }
        self.last_counter = Some(data.counter);
        data.overflow = self.overflow;
        data
    }
}
