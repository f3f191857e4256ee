use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::board::TdcHit;
use crate::channel::{BoardId, GlobalChannel};
use crate::error::Result;

/// Global ordering key of a finalized hit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HitKey {
    /// Sync cycle within the spill, starting at 1.
    pub cycle: u64,
    /// Counts since the sync pulse opening the cycle.
    pub offset: i64,
    pub channel: GlobalChannel,
}

/// All hits finalized for one sync cycle, across every board.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub spill: Option<u16>,
    /// Known once a board has reported the spill footer.
    pub event_match: Option<u16>,
    pub cycle: u64,
    pub hits: BTreeMap<HitKey, TdcHit>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Output rows in (cycle, offset, channel) order.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        self.hits.values().map(|hit| Row {
            spill: hit.spill,
            event_match: self.event_match,
            channel: hit.channel,
            counter: hit.counter,
            time_ns: hit.time_ns,
            sync_channel: hit.sync_channel,
            time_per_count_ns: hit.time_per_count_ns,
            board: hit.board,
        })
    }
}

/// One output hit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Row {
    pub spill: u16,
    pub event_match: Option<u16>,
    pub channel: GlobalChannel,
    pub counter: i64,
    pub time_ns: f64,
    pub sync_channel: Option<GlobalChannel>,
    pub time_per_count_ns: f64,
    pub board: BoardId,
}

/// Write the rows of `batch` to `writer` as JSON lines.
///
/// # Errors
/// On serialization or write errors.
pub fn write_rows<W: Write>(mut writer: W, batch: &Batch) -> Result<()> {
    for row in batch.rows() {
        serde_json::to_writer(&mut writer, &row)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
