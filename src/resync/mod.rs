//! Byte-level framing recovery.
//!
//! [Resync] decodes frames through a [FrameDecoder] but first screens every frame in a data
//! position with the [checks::suspect] tier. A suspect frame starts a repair: the window
//! drops its leading byte and takes one fresh byte from the stream until the relaxed tier
//! passes, a header or footer marker lines up, or a whole frame has been discarded. Lost
//! bytes are reported as [Record::PacketLoss]; a data record is never synthesized from them.
//!
//! A byte lost from the counter field, the last three bytes of a frame, cannot be told
//! apart from a slightly different counter. That frame is decoded with the next frame's
//! first byte as its counter low byte, and the loss is reported on the frame after it.
use std::collections::VecDeque;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::bytes::Bytes;
use crate::channel::{BoardId, Wired};
use crate::diag::FrameDump;
use crate::error::Result;
use crate::frame::{
    is_footer, is_header, DecoderState, FrameDecoder, LossKind, PacketLoss, RawFrame, Record,
    FRAME_LEN,
};

pub mod checks;

pub use checks::{Discarded, History, ResyncConfig};

use checks::{classify_discarded, suspect, suspect_relaxed};

/// Raw frames kept for diagnostics.
const RECENT_FRAMES: usize = 2;

/// Counters of what the resync layer saw and did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncStats {
    /// Frame-sized reads from the stream.
    pub frames: u64,
    /// Data records emitted.
    pub data: u64,
    pub framing_errors: u64,
    /// Suspect frames that the relaxed tier accepted without shifting.
    pub false_positives: u64,
    /// Repairs that found a new frame boundary.
    pub realigned: u64,
    /// Repairs that discarded a whole frame.
    pub unrepairable: u64,
    /// Whole discarded frames recognized as valid records and kept.
    pub merged_back: u64,
    /// Whole discarded frames that looked like well-formed records without hits.
    pub empty_records: u64,
    /// Total bytes reported in packet-loss records.
    pub discarded_bytes: u64,
}

/// Decoded records of one board byte stream, with framing repair.
pub struct Resync<R>
where
    R: Read,
{
    bytes: Bytes<R>,
    board: BoardId,
    wired: Wired,
    config: ResyncConfig,
    decoder: FrameDecoder,
    history: History,
    recent: VecDeque<(u64, RawFrame)>,
    ready: VecDeque<Record>,
    dump: Option<FrameDump>,
    stats: ResyncStats,
    done: bool,
}

impl<R> Resync<R>
where
    R: Read,
{
    /// `wired` marks the bit positions that carry real channels on `board`; hits anywhere
    /// else are treated as corruption.
    pub fn new(reader: R, board: BoardId, wired: Wired, config: ResyncConfig) -> Self {
        Resync {
            bytes: Bytes::new(reader),
            board,
            wired,
            config,
            decoder: FrameDecoder::new(),
            history: History::default(),
            recent: VecDeque::with_capacity(RECENT_FRAMES + 1),
            ready: VecDeque::new(),
            dump: None,
            stats: ResyncStats::default(),
            done: false,
        }
    }

    /// Write a line per handled frame to `writer`.
    #[must_use]
    pub fn with_dump<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.dump = Some(FrameDump::new(writer));
        self
    }

    pub fn stats(&self) -> &ResyncStats {
        &self.stats
    }

    /// Bytes consumed from the underlying reader.
    pub fn offset(&self) -> u64 {
        self.bytes.offset()
    }

    /// The last raw frames read, oldest first, with their stream offsets.
    pub fn recent(&self) -> impl Iterator<Item = &(u64, RawFrame)> {
        self.recent.iter()
    }

    /// Flush the frame dump, if any.
    ///
    /// # Errors
    /// On dump write errors.
    pub fn flush_diagnostics(&mut self) -> Result<()> {
        if let Some(dump) = self.dump.as_mut() {
            dump.flush()?;
        }
        Ok(())
    }

    /// Next record, or `None` at the end of the stream.
    ///
    /// # Errors
    /// On I/O errors other than EOF.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Ok(Some(record));
            }
            if self.done {
                return Ok(None);
            }

            let offset = self.bytes.offset();
            let mut frame = [0u8; FRAME_LEN];
            if !self.bytes.fill(&mut frame)? {
                trace!(board = self.board, offset, "end of stream");
                self.done = true;
                continue;
            }
            self.note_frame(offset, &frame);

            if self.in_data_position(&frame)
                && suspect(&frame, &self.history, self.wired, &self.config)
            {
                self.repair(offset, frame)?;
            } else {
                self.accept(offset, &frame);
            }
        }
    }

    fn note_frame(&mut self, offset: u64, frame: &RawFrame) {
        self.stats.frames += 1;
        if self.config.progress_interval > 0 && self.stats.frames % self.config.progress_interval == 0 {
            info!(board = self.board, frames = self.stats.frames, "decoded frames");
        }
        self.recent.push_back((offset, *frame));
        while self.recent.len() > RECENT_FRAMES {
            self.recent.pop_front();
        }
    }

    fn in_data_position(&self, frame: &RawFrame) -> bool {
        if !self.config.enabled || !self.decoder.expects_data() || is_footer(frame) {
            return false;
        }
        !(self.decoder.state() == DecoderState::FramingError && is_header(frame))
    }

    fn accept(&mut self, offset: u64, frame: &RawFrame) {
        let record = self.decoder.decode(frame);
        let label = match &record {
            Record::Header(_) => {
                self.history.clear();
                "header"
            }
            Record::Footer(_) => {
                self.history.clear();
                "footer"
            }
            Record::Data(data) => {
                self.history.push(*data);
                self.stats.data += 1;
                "data"
            }
            Record::FramingError(_) => {
                self.stats.framing_errors += 1;
                warn!(board = self.board, offset, frame = %hex::encode(frame), "expected a header frame");
                for (at, raw) in &self.recent {
                    debug!(board = self.board, offset = at, frame = %hex::encode(raw), "recent frame");
                }
                "framing-error"
            }
            Record::PacketLoss(_) => "loss",
        };
        if let Some(dump) = self.dump.as_mut() {
            dump.line(offset, frame, label);
        }
        self.ready.push_back(record);
    }

    fn emit_loss(&mut self, kind: LossKind, offset: u64, bytes: Vec<u8>) {
        self.stats.discarded_bytes += bytes.len() as u64;
        if let Some(dump) = self.dump.as_mut() {
            let label = match kind {
                LossKind::Realigned => "loss-realigned",
                LossKind::Unrepairable => "loss-unrepairable",
            };
            dump.line(offset, &bytes, label);
        }
        self.ready
            .push_back(Record::PacketLoss(PacketLoss { kind, offset, bytes }));
    }

    fn repair(&mut self, offset: u64, frame: RawFrame) -> Result<()> {
        debug!(board = self.board, offset, frame = %hex::encode(frame), "suspect frame");

        let mut window = frame;
        let mut thrown: Vec<u8> = Vec::with_capacity(FRAME_LEN);
        while thrown.len() < FRAME_LEN
            && !is_header(&window)
            && !is_footer(&window)
            && suspect_relaxed(&window, &self.history, self.wired, &self.config)
        {
            let Some(b) = self.bytes.next()? else {
                // the remainder can never complete a frame
                thrown.extend_from_slice(&window);
                self.stats.unrepairable += 1;
                debug!(board = self.board, offset, "end of stream during repair");
                self.emit_loss(LossKind::Unrepairable, offset, thrown);
                self.done = true;
                return Ok(());
            };
            thrown.push(window[0]);
            window.copy_within(1.., 0);
            window[FRAME_LEN - 1] = b;
            trace!(board = self.board, shifted = thrown.len(), window = %hex::encode(window), "shift");
        }

        if thrown.is_empty() {
            self.stats.false_positives += 1;
            trace!(board = self.board, offset, "suspect frame passed relaxed checks");
            self.accept(offset, &window);
            return Ok(());
        }

        let window_offset = offset + thrown.len() as u64;
        if thrown.len() < FRAME_LEN {
            self.stats.realigned += 1;
            debug!(
                board = self.board,
                offset,
                discarded = %hex::encode(&thrown),
                "realigned stream"
            );
            self.emit_loss(LossKind::Realigned, offset, thrown);
            self.accept(window_offset, &window);
            return Ok(());
        }

        let mut discarded = [0u8; FRAME_LEN];
        discarded.copy_from_slice(&thrown);
        match classify_discarded(&discarded, &window, &self.history, self.wired, &self.config) {
            Discarded::Record => {
                self.stats.merged_back += 1;
                debug!(board = self.board, offset, "suspect frame was a valid record");
                self.accept(offset, &discarded);
                self.accept(window_offset, &window);
                return Ok(());
            }
            Discarded::Empty => {
                self.stats.empty_records += 1;
                debug!(board = self.board, offset, "discarded an empty data record");
            }
            Discarded::Noise => {
                debug!(board = self.board, offset, frame = %hex::encode(discarded), "discarded frame");
            }
        }
        self.stats.unrepairable += 1;
        self.emit_loss(LossKind::Unrepairable, offset, thrown);
        self.accept(window_offset, &window);
        Ok(())
    }
}

impl<R> Iterator for Resync<R>
where
    R: Read,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Data, Footer, Header};
    use test_case::test_case;

    const WIRED: Wired = Wired {
        primary: 0xffff_ffff_0000_0000,
        secondary: 0x07ff,
    };

    fn data(k: u32) -> Data {
        Data {
            primary: (1u64 << 60) | (1u64 << 52) | (1u64 << 42) | (1u64 << 33),
            secondary: 0x7f0,
            sync: false,
            counter: ((k + 1) << 16) | 0x7777,
            overflow: 0,
        }
    }

    fn stream(frames: &[RawFrame]) -> Vec<u8> {
        frames.iter().flatten().copied().collect()
    }

    fn spill(n: u32) -> Vec<RawFrame> {
        let mut frames = vec![Header { spill: 1, board: 0 }.encode()];
        frames.extend((0..n).map(|k| data(k).encode()));
        frames.push(
            Footer {
                spill: 1,
                event_match: 9,
                write_count: n,
            }
            .encode(),
        );
        frames
    }

    fn records(bytes: &[u8], config: ResyncConfig) -> (Vec<Record>, ResyncStats) {
        let mut resync = Resync::new(bytes, 0, WIRED, config);
        let records: Vec<Record> = resync.by_ref().map(|r| r.unwrap()).collect();
        (records, resync.stats().clone())
    }

    #[test]
    fn clean_stream_passes_untouched() {
        let bytes = stream(&spill(20));
        let (records, stats) = records(&bytes, ResyncConfig::default());

        assert_eq!(records.len(), 22);
        assert!(matches!(records[0], Record::Header(_)));
        assert!(matches!(records[21], Record::Footer(_)));
        assert_eq!(stats.data, 20);
        assert_eq!(stats.discarded_bytes, 0);
        assert_eq!(stats.realigned + stats.unrepairable + stats.false_positives, 0);
    }

    #[test]
    fn unwired_secondary_bit_is_dropped_as_unrepairable() {
        let mut frames = spill(10);
        let mut bad = data(5);
        bad.secondary |= 1 << 11;
        frames[6] = bad.encode();
        let bytes = stream(&frames);

        let (records, stats) = records(&bytes, ResyncConfig::default());

        assert_eq!(stats.unrepairable, 1);
        assert_eq!(stats.discarded_bytes, FRAME_LEN as u64);
        let loss = records
            .iter()
            .find_map(|r| match r {
                Record::PacketLoss(loss) => Some(loss.clone()),
                _ => None,
            })
            .expect("a packet loss record");
        assert_eq!(loss.kind, LossKind::Unrepairable);
        assert_eq!(loss.bytes, bad.encode().to_vec());
        assert_eq!(loss.offset, 6 * FRAME_LEN as u64);

        // the corrupt record never surfaces as data
        let counters: Vec<u32> = records
            .iter()
            .filter_map(|r| match r {
                Record::Data(d) => Some(d.counter),
                _ => None,
            })
            .collect();
        let expected: Vec<u32> = (0..10).filter(|k| *k != 5).map(|k| data(k).counter).collect();
        assert_eq!(counters, expected);
    }

    fn data_counters(records: &[Record]) -> Vec<u32> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Data(d) => Some(d.counter),
                _ => None,
            })
            .collect()
    }

    fn losses(records: &[Record]) -> Vec<(LossKind, u64, usize)> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::PacketLoss(loss) => Some((loss.kind, loss.offset, loss.bytes.len())),
                _ => None,
            })
            .collect()
    }

    #[test_case(0)]
    #[test_case(1)]
    #[test_case(2)]
    #[test_case(3)]
    #[test_case(4)]
    #[test_case(5)]
    #[test_case(6)]
    #[test_case(7)]
    #[test_case(8)]
    #[test_case(9)]
    fn deleted_byte_realigns_on_next_frame(at: usize) {
        let frames = spill(12);
        let mut bytes = stream(&frames);
        // frame index 7 is data(6)
        bytes.remove(7 * FRAME_LEN + at);

        let (records, stats) = records(&bytes, ResyncConfig::default());

        assert_eq!(stats.realigned, 1);
        assert_eq!(stats.discarded_bytes, (FRAME_LEN - 1) as u64);
        let mut expected: Vec<Record> = vec![Record::Header(Header { spill: 1, board: 0 })];
        expected.extend((0..6).map(|k| Record::Data(data(k))));
        let mut truncated = data(6).encode().to_vec();
        truncated.remove(at);
        expected.push(Record::PacketLoss(PacketLoss {
            kind: LossKind::Realigned,
            offset: 7 * FRAME_LEN as u64,
            bytes: truncated,
        }));
        expected.extend((7..12).map(|k| Record::Data(data(k))));
        expected.push(Record::Footer(Footer {
            spill: 1,
            event_match: 9,
            write_count: 12,
        }));
        assert_eq!(records, expected);
    }

    #[test_case(10, 0x77_7710 ; "counter high byte")]
    #[test_case(11, 0x07_7710 ; "counter middle byte")]
    #[test_case(12, 0x07_7710 ; "counter low byte")]
    fn deleted_counter_byte_is_reported_on_following_frame(at: usize, damaged: u32) {
        let frames = spill(12);
        let mut bytes = stream(&frames);
        bytes.remove(7 * FRAME_LEN + at);

        let (records, _) = records(&bytes, ResyncConfig::default());

        // the damaged frame borrows the first byte of data(7), whose remainder is lost
        let mut expected: Vec<u32> = (0..6).map(|k| data(k).counter).collect();
        expected.push(damaged);
        expected.push(data(8).counter);
        let mut lost = vec![(LossKind::Realigned, 8 * FRAME_LEN as u64, FRAME_LEN - 1)];
        if at == 10 {
            // the far jump leaves data(9) out of order with the history
            lost.push((LossKind::Unrepairable, 10 * FRAME_LEN as u64 - 1, FRAME_LEN));
            expected.push(data(10).counter);
        } else {
            expected.extend((9..11).map(|k| data(k).counter));
        }
        expected.push(data(11).counter);

        assert_eq!(data_counters(&records), expected);
        assert_eq!(losses(&records), lost);
        assert!(matches!(records.last(), Some(Record::Footer(_))));
    }

    #[test]
    fn repair_stops_at_header_after_framing_error() {
        // a spill without its header, cut short by the next spill
        let mut bytes = data(0).encode().to_vec();
        bytes.extend_from_slice(&data(1).encode()[..6]);
        bytes.extend(stream(&[
            Header { spill: 2, board: 0 }.encode(),
            data(2).encode(),
            Footer {
                spill: 2,
                event_match: 9,
                write_count: 1,
            }
            .encode(),
        ]));

        let (records, stats) = records(&bytes, ResyncConfig::default());

        assert_eq!(stats.realigned, 1);
        assert_eq!(
            records,
            vec![
                Record::FramingError(data(0).encode()),
                Record::PacketLoss(PacketLoss {
                    kind: LossKind::Realigned,
                    offset: FRAME_LEN as u64,
                    bytes: data(1).encode()[..6].to_vec(),
                }),
                Record::Header(Header { spill: 2, board: 0 }),
                Record::Data(data(2)),
                Record::Footer(Footer {
                    spill: 2,
                    event_match: 9,
                    write_count: 1,
                }),
            ]
        );
    }

    #[test]
    fn disabled_checks_decode_everything() {
        let mut frames = spill(6);
        let mut bad = data(3);
        bad.primary |= 0xff;
        frames[4] = bad.encode();
        let bytes = stream(&frames);

        let config = ResyncConfig::builder().enabled(false).build();
        let (records, stats) = records(&bytes, config);
        assert_eq!(stats.data, 6);
        assert!(records.iter().all(|r| !matches!(r, Record::PacketLoss(_))));
    }

    #[test]
    fn truncated_tail_is_reported_at_eof() {
        let frames = spill(8);
        let mut bytes = stream(&frames[..9]);
        bytes.remove(7 * FRAME_LEN + 2);
        bytes.truncate(bytes.len() - 5);

        let (records, stats) = records(&bytes, ResyncConfig::default());
        assert_eq!(stats.unrepairable, 1);
        match records.last() {
            Some(Record::PacketLoss(loss)) => {
                assert_eq!(loss.kind, LossKind::Unrepairable);
                assert_eq!(loss.offset, 7 * FRAME_LEN as u64);
                assert_eq!(loss.bytes.len(), bytes.len() - 7 * FRAME_LEN);
            }
            other => panic!("expected trailing loss, got {other:?}"),
        }
    }

    #[test]
    fn shift_never_exceeds_one_frame() {
        use rand::{Rng, SeedableRng};

        let frames = spill(40);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut bytes = stream(&frames);
        for _ in 0..5 {
            let at = rng.gen_range(FRAME_LEN..bytes.len() - FRAME_LEN);
            bytes[at] = rng.gen();
        }

        let mut resync = Resync::new(&bytes[..], 0, WIRED, ResyncConfig::default());
        let mut records = Vec::new();
        while let Some(record) = resync.next_record().unwrap() {
            records.push(record);
        }
        assert_eq!(resync.offset(), bytes.len() as u64);

        // only a repair cut short by the end of the stream may report more than a frame
        let (_, body) = records.split_last().expect("records");
        for record in body {
            if let Record::PacketLoss(loss) = record {
                assert!(!loss.bytes.is_empty());
                assert!(loss.bytes.len() <= FRAME_LEN);
            }
        }
    }
}
