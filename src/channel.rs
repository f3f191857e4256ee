//! Board-local to global channel mapping.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{PRIMARY_CHANNELS, SECONDARY_CHANNELS};

pub type BoardId = u8;
pub type GlobalChannel = u16;

/// A channel as addressed inside one board's data record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(tag = "class", content = "index", rename_all = "lowercase")]
pub enum LocalChannel {
    /// Bit of the 64-bit primary mask.
    Primary(u8),
    /// Bit of the 12-bit secondary mask.
    Secondary(u8),
    /// The sync-pulse flag.
    Sync,
}

impl LocalChannel {
    fn validate(self, board: BoardId) -> Result<Self> {
        let ok = match self {
            LocalChannel::Primary(ch) => ch < PRIMARY_CHANNELS,
            LocalChannel::Secondary(ch) => ch < SECONDARY_CHANNELS,
            LocalChannel::Sync => true,
        };
        if ok {
            Ok(self)
        } else {
            Err(Error::ChannelConflict {
                board,
                detail: format!("{self:?} is out of range"),
            })
        }
    }
}

/// How a global channel is treated by calibration and merging.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Regular,
    /// Reference pulse used for cross-board alignment.
    Sync,
    /// Calibrated with the shared sync offset but merged like a regular hit.
    Veto,
}

/// One configured wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEntry {
    pub board: BoardId,
    pub local: LocalChannel,
    pub global: GlobalChannel,
    #[serde(default)]
    pub kind: ChannelKind,
}

/// Bit masks of the physically wired positions of one board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Wired {
    pub primary: u64,
    pub secondary: u16,
}

/// Immutable, validated channel table shared by every board of a run.
///
/// Several boards may feed the same global channel; a local channel maps to at most one
/// global channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    forward: BTreeMap<(BoardId, LocalChannel), GlobalChannel>,
    reverse: BTreeMap<GlobalChannel, BTreeSet<BoardId>>,
    kinds: BTreeMap<GlobalChannel, ChannelKind>,
    wired: BTreeMap<BoardId, Wired>,
}

impl ChannelMap {
    /// Build and validate a map.
    ///
    /// # Errors
    /// [Error::ChannelConflict] if a local channel is listed twice with different global
    /// channels, is out of range, or a global channel is given two different kinds.
    pub fn new<I: IntoIterator<Item = ChannelEntry>>(entries: I) -> Result<Self> {
        let mut map = ChannelMap::default();
        for entry in entries {
            let local = entry.local.validate(entry.board)?;
            let kind = match local {
                LocalChannel::Sync => ChannelKind::Sync,
                _ => entry.kind,
            };

            if let Some(existing) = map.forward.get(&(entry.board, local)) {
                if *existing != entry.global {
                    return Err(Error::ChannelConflict {
                        board: entry.board,
                        detail: format!(
                            "{local:?} mapped to both {existing} and {}",
                            entry.global
                        ),
                    });
                }
            }
            if let Some(existing) = map.kinds.get(&entry.global) {
                if *existing != kind {
                    return Err(Error::ChannelConflict {
                        board: entry.board,
                        detail: format!(
                            "global channel {} declared {existing:?} and {kind:?}",
                            entry.global
                        ),
                    });
                }
            }

            map.forward.insert((entry.board, local), entry.global);
            map.reverse.entry(entry.global).or_default().insert(entry.board);
            map.kinds.insert(entry.global, kind);
            let wired = map.wired.entry(entry.board).or_default();
            match local {
                LocalChannel::Primary(ch) => wired.primary |= 1u64 << ch,
                LocalChannel::Secondary(ch) => wired.secondary |= 1u16 << ch,
                LocalChannel::Sync => {}
            }
        }
        Ok(map)
    }

    #[must_use]
    pub fn get_global(&self, board: BoardId, local: LocalChannel) -> Option<GlobalChannel> {
        self.forward.get(&(board, local)).copied()
    }

    /// Boards feeding `global`; empty if the channel is not mapped.
    #[must_use]
    pub fn get_local(&self, global: GlobalChannel) -> BTreeSet<BoardId> {
        self.reverse.get(&global).cloned().unwrap_or_default()
    }

    /// Local channels of `board` feeding `global`.
    pub fn locals(
        &self,
        board: BoardId,
        global: GlobalChannel,
    ) -> impl Iterator<Item = LocalChannel> + '_ {
        self.forward
            .range((board, LocalChannel::Primary(0))..=(board, LocalChannel::Sync))
            .filter(move |(_, g)| **g == global)
            .map(|((_, local), _)| *local)
    }

    #[must_use]
    pub fn kind(&self, global: GlobalChannel) -> Option<ChannelKind> {
        self.kinds.get(&global).copied()
    }

    #[must_use]
    pub fn sync_channel(&self, board: BoardId) -> Option<GlobalChannel> {
        self.get_global(board, LocalChannel::Sync)
    }

    /// Wired bit positions of `board`; all zero for an unknown board.
    #[must_use]
    pub fn wired(&self, board: BoardId) -> Wired {
        self.wired.get(&board).copied().unwrap_or_default()
    }

    pub fn boards(&self) -> impl Iterator<Item = BoardId> + '_ {
        self.wired.keys().copied()
    }
}
