use std::collections::{BTreeMap, VecDeque};
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::channel::{BoardId, ChannelKind, ChannelMap, GlobalChannel, LocalChannel};
use crate::error::Result;
use crate::frame::{Data, Footer, Header, PacketLoss, Record};
use crate::resync::{Resync, ResyncConfig, ResyncStats};

/// Default duration of one counter tick.
pub const DEFAULT_TIME_PER_COUNT_NS: f64 = 5.0;

/// Static per-board timing corrections, in counts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Subtracted from regular channel counters.
    pub offsets: BTreeMap<GlobalChannel, i64>,
    /// Subtracted from sync and veto channel counters.
    pub sync_offset: i64,
    pub time_per_count_ns: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            offsets: BTreeMap::default(),
            sync_offset: 0,
            time_per_count_ns: DEFAULT_TIME_PER_COUNT_NS,
        }
    }
}

impl Calibration {
    #[must_use]
    pub fn apply(&self, kind: ChannelKind, channel: GlobalChannel, counter: i64) -> i64 {
        match kind {
            ChannelKind::Regular => counter - self.offsets.get(&channel).copied().unwrap_or(0),
            ChannelKind::Sync | ChannelKind::Veto => counter - self.sync_offset,
        }
    }
}

/// One calibrated hit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TdcHit {
    pub channel: GlobalChannel,
    pub kind: ChannelKind,
    /// Wrap-corrected, calibrated counter.
    pub counter: i64,
    pub time_ns: f64,
    pub spill: u16,
    pub board: BoardId,
    pub sync_channel: Option<GlobalChannel>,
    pub time_per_count_ns: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SpillStart(Header),
    Hit(TdcHit),
    /// Hit on the board's sync channel.
    Sync(TdcHit),
    Loss(PacketLoss),
    GateEnd(Footer),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardStats {
    pub spills: u64,
    pub hits: u64,
    pub syncs: u64,
    /// Hit bits on channels missing from the channel map.
    pub unmapped: u64,
    /// Data records seen before any spill header.
    pub orphaned: u64,
    pub losses: u64,
}

/// Calibrated events of one board.
pub struct BoardStream<R>
where
    R: Read,
{
    id: BoardId,
    resync: Resync<BufReader<R>>,
    map: Arc<ChannelMap>,
    calibration: Calibration,
    sync_channel: Option<GlobalChannel>,
    spill: Option<u16>,
    event_match: Option<u16>,
    gate_started: bool,
    gate_ended: bool,
    file_ended: bool,
    ready: VecDeque<Event>,
    stats: BoardStats,
}

impl<R> BoardStream<R>
where
    R: Read,
{
    pub fn new(
        id: BoardId,
        reader: R,
        map: Arc<ChannelMap>,
        calibration: Calibration,
        config: ResyncConfig,
    ) -> Self {
        let resync = Resync::new(BufReader::new(reader), id, map.wired(id), config);
        let sync_channel = map.sync_channel(id);
        if sync_channel.is_none() {
            warn!(board = id, "no sync channel mapped");
        }
        BoardStream {
            id,
            resync,
            map,
            calibration,
            sync_channel,
            spill: None,
            event_match: None,
            gate_started: false,
            gate_ended: false,
            file_ended: false,
            ready: VecDeque::new(),
            stats: BoardStats::default(),
        }
    }

    /// Dump every frame handled by the resync layer to `writer`.
    #[must_use]
    pub fn with_dump<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.resync = self.resync.with_dump(writer);
        self
    }

    pub fn id(&self) -> BoardId {
        self.id
    }

    /// Spill in progress; `None` outside a header/footer pair.
    pub fn spill(&self) -> Option<u16> {
        self.spill
    }

    /// Event-match count of the current spill, once its footer has been read.
    pub fn event_match(&self) -> Option<u16> {
        self.event_match
    }

    pub fn gate_started(&self) -> bool {
        self.gate_started
    }

    pub fn gate_ended(&self) -> bool {
        self.gate_ended
    }

    pub fn file_ended(&self) -> bool {
        self.file_ended
    }

    /// Nothing more will arrive for the current spill.
    pub fn is_done(&self) -> bool {
        self.gate_ended || self.file_ended
    }

    pub fn time_per_count_ns(&self) -> f64 {
        self.calibration.time_per_count_ns
    }

    pub fn stats(&self) -> &BoardStats {
        &self.stats
    }

    pub fn resync_stats(&self) -> &ResyncStats {
        self.resync.stats()
    }

    /// Re-arm a gate-ended stream so it reads into the next spill.
    pub fn begin_next_spill(&mut self) {
        self.gate_started = false;
        self.gate_ended = false;
        self.event_match = None;
    }

    /// # Errors
    /// On frame dump write errors.
    pub fn flush_diagnostics(&mut self) -> Result<()> {
        for (offset, raw) in self.resync.recent() {
            debug!(board = self.id, offset, frame = %hex::encode(raw), "last frames");
        }
        self.resync.flush_diagnostics()
    }

    /// Next event, or `None` once the byte stream is exhausted.
    ///
    /// # Errors
    /// On I/O errors reading the stream.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if self.file_ended {
                return Ok(None);
            }

            let Some(record) = self.resync.next_record()? else {
                if self.gate_started && !self.gate_ended {
                    warn!(board = self.id, spill = ?self.spill, "stream ended inside a spill");
                }
                debug!(board = self.id, stats = ?self.stats, "end of board stream");
                self.file_ended = true;
                continue;
            };

            match record {
                Record::Header(header) => self.on_header(header),
                Record::Data(data) => self.on_data(&data),
                Record::Footer(footer) => self.on_footer(footer),
                Record::PacketLoss(loss) => {
                    self.stats.losses += 1;
                    self.ready.push_back(Event::Loss(loss));
                }
                Record::FramingError(_) => {}
            }
        }
    }

    fn on_header(&mut self, header: Header) {
        if header.board != self.id {
            warn!(
                board = self.id,
                header_board = header.board,
                "header board id does not match configured board"
            );
        }
        info!(board = self.id, spill = header.spill, "begin of spill");
        self.spill = Some(header.spill);
        self.event_match = None;
        self.gate_started = true;
        self.gate_ended = false;
        self.stats.spills += 1;
        self.ready.push_back(Event::SpillStart(header));
    }

    fn on_footer(&mut self, footer: Footer) {
        if !self.gate_started {
            debug!(board = self.id, spill = footer.spill, "footer without header");
        } else if self.spill != Some(footer.spill) {
            warn!(
                board = self.id,
                header_spill = ?self.spill,
                footer_spill = footer.spill,
                "footer spill does not match header"
            );
        }
        info!(
            board = self.id,
            spill = footer.spill,
            event_match = footer.event_match,
            write_count = footer.write_count,
            "end of spill"
        );
        self.event_match = Some(footer.event_match);
        self.gate_ended = true;
        self.spill = None;
        self.ready.push_back(Event::GateEnd(footer));
    }

    fn on_data(&mut self, data: &Data) {
        let Some(spill) = self.spill else {
            self.stats.orphaned += 1;
            trace!(board = self.id, "data before spill header");
            return;
        };
        let counter = data.extended();
        for ch in data.primary_channels() {
            self.push_hit(LocalChannel::Primary(ch), counter, spill);
        }
        for ch in data.secondary_channels() {
            self.push_hit(LocalChannel::Secondary(ch), counter, spill);
        }
        if data.sync {
            self.push_hit(LocalChannel::Sync, counter, spill);
        }
    }

    fn push_hit(&mut self, local: LocalChannel, counter: i64, spill: u16) {
        let Some(channel) = self.map.get_global(self.id, local) else {
            self.stats.unmapped += 1;
            trace!(board = self.id, ?local, "unmapped channel");
            return;
        };
        let kind = self.map.kind(channel).unwrap_or_default();
        let counter = self.calibration.apply(kind, channel, counter);
        let hit = TdcHit {
            channel,
            kind,
            counter,
            time_ns: counter as f64 * self.calibration.time_per_count_ns,
            spill,
            board: self.id,
            sync_channel: self.sync_channel,
            time_per_count_ns: self.calibration.time_per_count_ns,
        };
        if kind == ChannelKind::Sync {
            self.stats.syncs += 1;
            self.ready.push_back(Event::Sync(hit));
        } else {
            self.stats.hits += 1;
            self.ready.push_back(Event::Hit(hit));
        }
    }
}
