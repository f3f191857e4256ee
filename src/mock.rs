//! Synthetic board streams for tests and benchmarks.
//!
//! A [MockBoard] describes one spill: periodic sync pulses (some of which may be missed),
//! regularly spaced hits between pulses and any explicit extra hits. Hits sharing a counter
//! are packed into one data record, the way the hardware reports coincident channels.
use std::collections::BTreeMap;

use typed_builder::TypedBuilder;

use crate::channel::{BoardId, LocalChannel};
use crate::frame::{Data, Footer, Header, RawFrame, COUNTER_MASK};

#[derive(TypedBuilder, Debug, Clone)]
pub struct MockBoard {
    board: BoardId,
    #[builder(default = 1)]
    spill: u16,
    #[builder(default = 0)]
    event_match: u16,
    /// Counts between sync pulses.
    #[builder(default = 5220)]
    sync_interval: u64,
    /// Counter of the first sync pulse.
    #[builder(default = 0)]
    first_pulse: u64,
    #[builder(default = 10)]
    pulses: u64,
    /// Indices of pulses that are not emitted.
    #[builder(default)]
    missed: Vec<u64>,
    /// Evenly spaced hits on `hit_channel` between consecutive pulses.
    #[builder(default = 0)]
    hits_per_cycle: u64,
    #[builder(default = LocalChannel::Primary(32))]
    hit_channel: LocalChannel,
    /// Extra hits as (unwrapped counter, channel).
    #[builder(default)]
    hits: Vec<(u64, LocalChannel)>,
}

fn set(data: &mut Data, local: LocalChannel) {
    match local {
        LocalChannel::Primary(ch) => data.primary |= 1u64 << ch,
        LocalChannel::Secondary(ch) => data.secondary |= 1u16 << ch,
        LocalChannel::Sync => data.sync = true,
    }
}

impl MockBoard {
    /// Unwrapped counter of pulse `index`.
    #[must_use]
    pub fn pulse(&self, index: u64) -> u64 {
        self.first_pulse + index * self.sync_interval
    }

    /// Data records keyed by unwrapped counter.
    #[must_use]
    pub fn records(&self) -> BTreeMap<u64, Data> {
        let mut records: BTreeMap<u64, Data> = BTreeMap::new();
        let mut record = |at: u64, local: LocalChannel| {
            let data = records.entry(at).or_insert_with(|| Data {
                counter: (at & u64::from(COUNTER_MASK)) as u32,
                ..Default::default()
            });
            set(data, local);
        };

        for i in 0..self.pulses {
            if !self.missed.contains(&i) {
                record(self.pulse(i), LocalChannel::Sync);
            }
        }
        for i in 0..self.pulses.saturating_sub(1) {
            for j in 1..=self.hits_per_cycle {
                let at = self.pulse(i) + j * self.sync_interval / (self.hits_per_cycle + 1);
                record(at, self.hit_channel);
            }
        }
        for (at, local) in &self.hits {
            record(*at, *local);
        }
        records
    }

    #[must_use]
    pub fn frames(&self) -> Vec<RawFrame> {
        let records = self.records();
        let mut frames = Vec::with_capacity(records.len() + 2);
        frames.push(
            Header {
                spill: self.spill,
                board: self.board,
            }
            .encode(),
        );
        frames.extend(records.values().map(Data::encode));
        frames.push(
            Footer {
                spill: self.spill,
                event_match: self.event_match,
                write_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
            }
            .encode(),
        );
        frames
    }

    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.frames().iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, Record, COUNTER_PERIOD};

    #[test]
    fn pulses_hits_and_misses() {
        let mock = MockBoard::builder()
            .board(1)
            .pulses(4)
            .missed(vec![2])
            .hits_per_cycle(1)
            .build();
        let records = mock.records();

        let syncs: Vec<u64> = records
            .iter()
            .filter(|(_, d)| d.sync)
            .map(|(at, _)| *at)
            .collect();
        assert_eq!(syncs, vec![0, 5220, 15660]);
        let hits: Vec<u64> = records
            .iter()
            .filter(|(_, d)| d.primary_hit(32))
            .map(|(at, _)| *at)
            .collect();
        assert_eq!(hits, vec![2610, 7830, 13050]);
    }

    #[test]
    fn coincident_hits_share_a_record() {
        let mock = MockBoard::builder()
            .board(0)
            .pulses(1)
            .hits(vec![(0, LocalChannel::Primary(40)), (0, LocalChannel::Secondary(2))])
            .build();
        let records = mock.records();
        assert_eq!(records.len(), 1);
        let data = records[&0];
        assert!(data.sync && data.primary_hit(40) && data.secondary_hit(2));
    }

    #[test]
    fn frames_decode_across_wraps() {
        let mock = MockBoard::builder()
            .board(3)
            .first_pulse(COUNTER_PERIOD as u64 - 6000)
            .pulses(4)
            .build();
        let mut decoder = FrameDecoder::new();
        let counters: Vec<i64> = mock
            .frames()
            .iter()
            .filter_map(|raw| match decoder.decode(raw) {
                Record::Data(d) => Some(d.extended()),
                _ => None,
            })
            .collect();
        let expected: Vec<i64> = (0..4).map(|i| mock.pulse(i) as i64).collect();
        assert_eq!(counters, expected);
    }
}
