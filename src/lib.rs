#![doc = include_str!("../README.md")]

mod bytes;
mod error;

pub mod board;
pub mod channel;
pub mod config;
pub mod diag;
pub mod frame;
pub mod merge;
pub mod mock;
pub mod resync;
pub mod source;

pub use board::{BoardStats, BoardStream, Calibration, Event, TdcHit};
pub use channel::{BoardId, ChannelEntry, ChannelKind, ChannelMap, GlobalChannel, LocalChannel};
pub use config::{BoardConfig, ChannelSpec, Config};
pub use error::{Error, Result};
pub use frame::{FrameDecoder, PacketLoss, Record};
pub use merge::{write_rows, Batch, HitKey, MergeConfig, MergeStats, Row, StreamMerger};
pub use resync::{Resync, ResyncConfig, ResyncStats};
