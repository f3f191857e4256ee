//! JSON run configuration.
//!
//! ```json
//! {
//!   "boards": [
//!     {
//!       "id": 0,
//!       "path": "board0.dat",
//!       "channels": [
//!         {"local": {"class": "primary", "index": 32}, "global": 0},
//!         {"local": {"class": "secondary", "index": 3}, "global": 150, "kind": "veto"},
//!         {"local": {"class": "sync"}, "global": 170}
//!       ],
//!       "offsets": {"0": 12},
//!       "sync_offset": 4
//!     }
//!   ],
//!   "merge": {"buffer_cap": 20000}
//! }
//! ```
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::board::{Calibration, DEFAULT_TIME_PER_COUNT_NS};
use crate::channel::{BoardId, ChannelEntry, ChannelKind, ChannelMap, GlobalChannel, LocalChannel};
use crate::error::{Error, Result};
use crate::merge::MergeConfig;
use crate::resync::ResyncConfig;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub local: LocalChannel,
    pub global: GlobalChannel,
    #[serde(default)]
    pub kind: ChannelKind,
}

fn default_time_per_count() -> f64 {
    DEFAULT_TIME_PER_COUNT_NS
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BoardConfig {
    pub id: BoardId,
    /// Recorded stream of this board.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default = "default_time_per_count")]
    pub time_per_count_ns: f64,
    pub channels: Vec<ChannelSpec>,
    /// Per global channel offset, in counts, subtracted from regular hits.
    #[serde(default)]
    pub offsets: BTreeMap<GlobalChannel, i64>,
    /// Offset, in counts, subtracted from sync and veto hits.
    #[serde(default)]
    pub sync_offset: i64,
}

impl BoardConfig {
    #[must_use]
    pub fn calibration(&self) -> Calibration {
        Calibration {
            offsets: self.offsets.clone(),
            sync_offset: self.sync_offset,
            time_per_count_ns: self.time_per_count_ns,
        }
    }

    fn entries(&self) -> impl Iterator<Item = ChannelEntry> + '_ {
        self.channels.iter().map(|spec| ChannelEntry {
            board: self.id,
            local: spec.local,
            global: spec.global,
            kind: spec.kind,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub resync: ResyncConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

impl Config {
    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// [Error::Json] if the document does not parse, [Error::Config] or
    /// [Error::UnknownChannel] if it is inconsistent.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [Config::from_reader]; relative board paths are resolved against the
    /// directory containing `path`.
    ///
    /// # Errors
    /// See [Config::from_reader]; also if `path` cannot be opened.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::from_reader(BufReader::new(File::open(path)?))?;
        if let Some(dir) = path.parent() {
            for board in &mut config.boards {
                if board.path.is_relative() && !board.path.as_os_str().is_empty() {
                    board.path = dir.join(&board.path);
                }
            }
        }
        Ok(config)
    }

    /// Check board ids, timing constants and channel references.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        if self.boards.is_empty() {
            return Err(Error::Config("no boards configured".to_string()));
        }
        let mut ids = BTreeSet::new();
        for board in &self.boards {
            if !ids.insert(board.id) {
                return Err(Error::ChannelConflict {
                    board: board.id,
                    detail: "board configured more than once".to_string(),
                });
            }
            if !(board.time_per_count_ns.is_finite() && board.time_per_count_ns > 0.0) {
                return Err(Error::Config(format!(
                    "board {}: time_per_count_ns must be positive, got {}",
                    board.id, board.time_per_count_ns
                )));
            }
            let globals: BTreeSet<GlobalChannel> =
                board.channels.iter().map(|spec| spec.global).collect();
            if let Some(unknown) = board.offsets.keys().find(|ch| !globals.contains(*ch)) {
                return Err(Error::UnknownChannel(*unknown));
            }
        }
        if self.merge.buffer_cap == 0 {
            return Err(Error::Config("merge.buffer_cap must be positive".to_string()));
        }
        self.channel_map().map(|_| ())
    }

    /// Channel map of every configured board.
    ///
    /// # Errors
    /// [Error::ChannelConflict] for inconsistent channel entries.
    pub fn channel_map(&self) -> Result<ChannelMap> {
        ChannelMap::new(self.boards.iter().flat_map(BoardConfig::entries))
    }
}
