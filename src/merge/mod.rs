//! Cross-board alignment on periodic sync pulses.
//!
//! Every board runs on its own free-running counter, but all boards see the same sync
//! pulses. [StreamMerger] advances each board one sync cycle at a time and finalizes the
//! hits that fall in the cycle's `(last, next]` bracket, keyed by cycle and the offset from
//! the pulse that opened it. Pulses a board failed to report are interpolated, so one board
//! missing a pulse does not shift its hits into the wrong cycle.
use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::board::{BoardStream, Event, TdcHit};
use crate::channel::{BoardId, GlobalChannel};
use crate::error::{Error, Result};

mod batch;
mod window;

pub use batch::{write_rows, Batch, HitKey, Row};
pub use window::{SyncPulse, SyncWindow};

#[derive(TypedBuilder, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// Most hits a board may hold without a sync bracket to place them in.
    #[builder(default = 10_000)]
    pub buffer_cap: usize,
    /// Largest spread of the boards' first pulse times accepted as one pulse.
    #[builder(default = 1000.0)]
    pub lock_threshold_ns: f64,
    /// Warm-up pulses that may be dropped while looking for a common first pulse.
    #[builder(default = 100)]
    pub lock_attempts: usize,
    /// Log progress every this many batches; zero disables.
    #[builder(default = 200_000)]
    pub progress_interval: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub batches: u64,
    pub hits: u64,
    pub spills: u64,
    /// Pulses synthesized for pulses a board did not report.
    pub interpolated: u64,
    /// Warm-up pulses dropped during startup lock.
    pub lock_retries: u64,
    /// Hits at or before the pulse opening their board's first cycle.
    pub dropped: u64,
    /// Pending hits left without a bracket at the end of a spill.
    pub discarded: u64,
    pub losses: u64,
}

struct Lane<R>
where
    R: Read,
{
    stream: BoardStream<R>,
    window: SyncWindow,
    pending: BTreeMap<(i64, GlobalChannel), TdcHit>,
}

impl<R> Lane<R>
where
    R: Read,
{
    fn board(&self) -> BoardId {
        self.stream.id()
    }

    fn buffer(&mut self, hit: TdcHit, cap: usize) -> Result<()> {
        self.pending.entry((hit.counter, hit.channel)).or_insert(hit);
        if self.pending.len() > cap {
            return Err(Error::BufferOverflow {
                board: self.board(),
                cap,
            });
        }
        Ok(())
    }

    /// Remove pending hits up to and including `counter`.
    fn drop_through(&mut self, counter: i64) -> usize {
        let rest = self.pending.split_off(&(counter + 1, GlobalChannel::MIN));
        std::mem::replace(&mut self.pending, rest).len()
    }

    /// Move the hits of the current bracket into `hits`; returns `None` without a bracket,
    /// otherwise the number of hits dropped for preceding the bracket.
    fn extract(&mut self, cycle: u64, hits: &mut BTreeMap<HitKey, TdcHit>) -> Option<usize> {
        let (last, next) = self.window.bracket()?;
        let rest = self.pending.split_off(&(next.counter + 1, GlobalChannel::MIN));
        let ready = std::mem::replace(&mut self.pending, rest);

        let mut dropped = 0;
        for ((counter, channel), hit) in ready {
            if counter <= last.counter {
                dropped += 1;
                continue;
            }
            let key = HitKey {
                cycle,
                offset: counter - last.counter,
                channel,
            };
            hits.entry(key).or_insert(hit);
        }
        Some(dropped)
    }
}

/// Time-ordered batches of hits merged from any number of boards.
///
/// Batches are produced per sync cycle until every board stream is exhausted. Any fatal
/// condition ends iteration; the error is yielded once and the merger is fused afterwards.
pub struct StreamMerger<R>
where
    R: Read,
{
    lanes: Vec<Lane<R>>,
    config: MergeConfig,
    cycle: u64,
    spill: Option<u16>,
    event_match: Option<u16>,
    locked: bool,
    exhausted: bool,
    failed: bool,
    stats: MergeStats,
}

impl<R> StreamMerger<R>
where
    R: Read,
{
    pub fn new(streams: Vec<BoardStream<R>>, config: MergeConfig) -> Self {
        let lanes = streams
            .into_iter()
            .map(|stream| Lane {
                stream,
                window: SyncWindow::default(),
                pending: BTreeMap::new(),
            })
            .collect();
        StreamMerger {
            lanes,
            config,
            cycle: 0,
            spill: None,
            event_match: None,
            locked: false,
            exhausted: false,
            failed: false,
            stats: MergeStats::default(),
        }
    }

    pub fn stats(&self) -> &MergeStats {
        &self.stats
    }

    /// Board streams in the order they were given.
    pub fn streams(&self) -> impl Iterator<Item = &BoardStream<R>> + '_ {
        self.lanes.iter().map(|lane| &lane.stream)
    }

    /// Log the most recent frames of every board and flush frame dumps.
    ///
    /// # Errors
    /// The first dump write error; every board is flushed regardless.
    pub fn flush_diagnostics(&mut self) -> Result<()> {
        let mut result = Ok(());
        for lane in &mut self.lanes {
            if let Err(err) = lane.stream.flush_diagnostics() {
                warn!(board = lane.board(), "failed to flush diagnostics: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Drive the merger to completion, handing every batch to `sink`.
    ///
    /// # Errors
    /// The first fatal merge error or sink error. Diagnostics are flushed before a merge
    /// error is returned.
    pub fn run<F>(&mut self, mut sink: F) -> Result<MergeStats>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        loop {
            match self.next_batch() {
                Ok(Some(batch)) => sink(batch)?,
                Ok(None) => break,
                Err(err) => {
                    error!(spill = ?self.spill, cycle = self.cycle, "merge aborted: {err}");
                    // the merge error takes precedence over dump failures
                    if let Err(flush_err) = self.flush_diagnostics() {
                        warn!("failed to flush diagnostics after merge error: {flush_err}");
                    }
                    return Err(err);
                }
            }
        }
        self.flush_diagnostics()?;
        info!(stats = ?self.stats, "merge complete");
        Ok(self.stats.clone())
    }

    /// Next finalized batch, or `None` once every board stream is exhausted.
    ///
    /// # Errors
    /// [Error::EventMatchMismatch], [Error::SyncInverted], [Error::BufferOverflow],
    /// [Error::StartupLock], or I/O errors from a board stream.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        loop {
            if self.exhausted {
                return Ok(None);
            }

            self.cycle += 1;
            for index in 0..self.lanes.len() {
                self.advance(index)?;
            }
            if !self.locked {
                self.lock()?;
            }

            let cycle = self.cycle;
            let mut hits = BTreeMap::new();
            let mut bracketed = false;
            for lane in &mut self.lanes {
                if let Some(dropped) = lane.extract(cycle, &mut hits) {
                    bracketed = true;
                    self.stats.dropped += dropped as u64;
                }
            }

            if bracketed {
                self.stats.batches += 1;
                self.stats.hits += hits.len() as u64;
                if self.config.progress_interval > 0
                    && self.stats.batches % self.config.progress_interval == 0
                {
                    info!(batches = self.stats.batches, hits = self.stats.hits, "merged batches");
                }
                trace!(spill = ?self.spill, cycle, hits = hits.len(), "batch");
                return Ok(Some(Batch {
                    spill: self.spill,
                    event_match: self.event_match,
                    cycle,
                    hits,
                }));
            }
            self.end_spill();
        }
    }

    /// Shift a board's window by one pulse and read until a pulse beyond the new bracket is
    /// known or the board has nothing more for this spill.
    fn advance(&mut self, index: usize) -> Result<()> {
        let cap = self.config.buffer_cap;
        let lane = &mut self.lanes[index];
        let board = lane.board();
        lane.window.shift();

        while !lane.window.is_primed() && !lane.stream.is_done() {
            let Some(event) = lane.stream.next_event()? else {
                break;
            };
            match event {
                Event::SpillStart(header) => {
                    if self.spill.is_some_and(|spill| spill != header.spill) {
                        warn!(board, spill = header.spill, merged = ?self.spill, "boards disagree on spill number");
                    }
                    self.spill = Some(header.spill);
                }
                Event::Hit(hit) => lane.buffer(hit, cap)?,
                Event::Sync(hit) => {
                    lane.buffer(hit, cap)?;
                    let added = lane.window.push(board, SyncPulse::from(&hit))?;
                    if added > 0 {
                        debug!(board, counter = hit.counter, missed = added, "interpolated sync pulses");
                        self.stats.interpolated += added as u64;
                    }
                }
                Event::Loss(loss) => {
                    self.stats.losses += 1;
                    debug!(board, offset = loss.offset, bytes = loss.bytes.len(), kind = ?loss.kind, "packet loss");
                }
                Event::GateEnd(footer) => match self.event_match {
                    None => self.event_match = Some(footer.event_match),
                    Some(expected) if expected != footer.event_match => {
                        return Err(Error::EventMatchMismatch {
                            board,
                            expected,
                            actual: footer.event_match,
                        });
                    }
                    Some(_) => {}
                },
            }
        }
        Ok(())
    }

    /// Align the boards on a common first pulse, dropping the earliest board's pulse while
    /// their first pulse times disagree.
    fn lock(&mut self) -> Result<()> {
        for attempt in 0..self.config.lock_attempts {
            let firsts: Vec<(usize, f64)> = self
                .lanes
                .iter()
                .enumerate()
                .filter_map(|(index, lane)| lane.window.last().map(|p| (index, p.time_ns)))
                .collect();
            let earliest = firsts.iter().min_by(|a, b| a.1.total_cmp(&b.1)).copied();
            let latest = firsts.iter().map(|f| f.1).max_by(f64::total_cmp);
            let (Some((index, min)), Some(max)) = (earliest, latest) else {
                self.locked = true;
                return Ok(());
            };

            let spread = max - min;
            if firsts.len() < 2 || spread <= self.config.lock_threshold_ns {
                info!(spill = ?self.spill, attempts = attempt, spread_ns = spread, "boards locked");
                self.locked = true;
                return Ok(());
            }

            let lane = &mut self.lanes[index];
            let board = lane.board();
            warn!(board, attempt, spread_ns = spread, "first sync pulses disagree, dropping a warm-up pulse");
            if let Some(pulse) = lane.window.last() {
                let dropped = lane.drop_through(pulse.counter);
                self.stats.dropped += dropped as u64;
            }
            self.stats.lock_retries += 1;
            self.advance(index)?;
        }
        Err(Error::StartupLock {
            attempts: self.config.lock_attempts,
        })
    }

    /// Reset per-spill state once no board has a bracket left.
    fn end_spill(&mut self) {
        let discarded: usize = self.lanes.iter().map(|lane| lane.pending.len()).sum();
        if self.lanes.iter().any(|lane| lane.stream.gate_started()) {
            self.stats.spills += 1;
            info!(spill = ?self.spill, cycles = self.cycle - 1, discarded, "end of merged spill");
        }
        if discarded > 0 {
            debug!(spill = ?self.spill, discarded, "discarding hits without a sync bracket");
        }
        self.stats.discarded += discarded as u64;

        for lane in &mut self.lanes {
            lane.pending.clear();
            lane.window = SyncWindow::default();
            lane.stream.begin_next_spill();
        }
        self.cycle = 0;
        self.spill = None;
        self.event_match = None;
        self.locked = false;

        if self.lanes.iter().all(|lane| lane.stream.file_ended()) {
            self.exhausted = true;
        }
    }
}

impl<R> Iterator for StreamMerger<R>
where
    R: Read,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_batch().transpose();
        if matches!(result, Some(Err(_))) {
            self.failed = true;
        }
        result
    }
}
