//! Corruption predicates evaluated over a candidate 13-byte window and the recent data
//! history.
//!
//! Counter comparisons use [elapsed], the forward distance on the wrapping 27-bit counter. A
//! frame that lost leading bytes carries the next frame's first bytes in its counter field, so
//! most predicates re-read the counter at 1- and 2-byte shifts and ask whether the shifted
//! value orders better against the history than the unshifted one.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::channel::Wired;
use crate::frame::{raw_counter, Data, RawFrame, COUNTER_MASK, COUNTER_PERIOD};

/// Number of accepted data records kept for counter checks.
pub const HISTORY_DEPTH: usize = 4;

/// Tuning for the resync heuristic.
#[derive(TypedBuilder, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ResyncConfig {
    /// Run the corruption checks at all. When disabled every frame is decoded as-is.
    #[builder(default = true)]
    pub enabled: bool,
    /// Boundary bytes with fewer set bits than this may be the remains of a shifted frame.
    #[builder(default = 3)]
    pub boundary_bits: u32,
    /// Leading bytes with more set bits than this, twice in a row, suggest misalignment.
    #[builder(default = 3)]
    pub head_bits: u32,
    /// Largest counter distance accepted across a wrap.
    #[builder(default = 0x0080_0000)]
    pub wrap_window: u32,
    /// Counter bits that must be set on the older sample for a wrap to be plausible.
    #[builder(default = 0x0700_0000)]
    pub wrap_high_bits: u32,
    /// Log progress every this many frames; zero disables.
    #[builder(default = 1_000_000)]
    pub progress_interval: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Most recent accepted data records, newest first.
#[derive(Debug, Clone, Default)]
pub struct History {
    records: VecDeque<Data>,
}

impl History {
    pub fn push(&mut self, data: Data) {
        self.records.push_front(data);
        self.records.truncate(HISTORY_DEPTH);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// The `n`th most recent record, 1-based.
    #[must_use]
    pub fn last(&self, n: usize) -> Option<&Data> {
        n.checked_sub(1).and_then(|idx| self.records.get(idx))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Counters of the three most recent records, if there are that many.
    fn counters(&self) -> Option<(u32, u32, u32)> {
        Some((
            self.last(1)?.counter,
            self.last(2)?.counter,
            self.last(3)?.counter,
        ))
    }
}

/// Forward distance from `b` to `a` on the wrapping counter. Equal values are a full period
/// apart.
#[must_use]
pub fn elapsed(a: u32, b: u32) -> u32 {
    if a > b {
        a - b
    } else {
        (i64::from(a) + COUNTER_PERIOD - i64::from(b)) as u32
    }
}

/// As [elapsed] but equal values are zero apart.
fn elapsed_inclusive(a: u32, b: u32) -> u32 {
    if a >= b {
        a - b
    } else {
        elapsed(a, b)
    }
}

/// Counter field read `shift` bytes before its nominal position.
#[must_use]
pub fn counter_at_shift(window: &RawFrame, shift: usize) -> u32 {
    let start = 9 - shift;
    u32::from_be_bytes([
        window[start],
        window[start + 1],
        window[start + 2],
        window[start + 3],
    ]) & COUNTER_MASK
}

fn bits(b: u8) -> u32 {
    b.count_ones()
}

/// A hit bit is set where nothing is wired.
#[must_use]
pub fn has_unwired_bits(window: &RawFrame, wired: Wired) -> bool {
    let data = Data::parse(window);
    data.primary & !wired.primary != 0 || data.secondary & !wired.secondary & 0x0fff != 0
}

/// No sync flag, no secondary hit and no wired primary hit.
#[must_use]
pub fn has_no_hit_bits(window: &RawFrame, wired: Wired) -> bool {
    let data = Data::parse(window);
    !data.sync && data.secondary == 0 && data.primary & wired.primary == 0
}

fn wrap_plausible(t0: u32, t2: u32, config: &ResyncConfig) -> bool {
    t2 < t0 || (t2 & config.wrap_high_bits != 0 && elapsed(t0, t2) < config.wrap_window)
}

/// The counter is not ordered after the three most recent records.
#[must_use]
pub fn invalid_counter_strict(window: &RawFrame, history: &History, config: &ResyncConfig) -> bool {
    let Some((t1, t2, t3)) = history.counters() else {
        return false;
    };
    let t0 = raw_counter(window);
    !(elapsed(t0, t1) < elapsed(t0, t2)
        && elapsed(t0, t2) < elapsed(t0, t3)
        && wrap_plausible(t0, t2, config))
}

/// The counter is not ordered after the second and third most recent records.
#[must_use]
pub fn invalid_counter_relaxed(
    window: &RawFrame,
    history: &History,
    config: &ResyncConfig,
) -> bool {
    let Some((_, t2, t3)) = history.counters() else {
        return false;
    };
    let t0 = raw_counter(window);
    !(elapsed(t0, t2) < elapsed(t0, t3) && wrap_plausible(t0, t2, config))
}

/// Sparse boundary bytes on the previous record or this window, and a 1- or 2-byte shift of
/// one of them orders the counters better than the frames as read.
#[must_use]
pub fn boundary_shift_suspected(
    window: &RawFrame,
    history: &History,
    config: &ResyncConfig,
) -> bool {
    let Some((t1, t2, t3)) = history.counters() else {
        return false;
    };
    let cutoff = config.boundary_bits;
    let prev_low = bits((t1 & 0xff) as u8);
    let prev_mid = bits(((t1 >> 8) & 0xff) as u8);
    let cur_low = bits(window[12]);
    let cur_mid = bits(window[11]);

    let prev_shift1 = prev_low < cutoff;
    let prev_shift2 = prev_low + prev_mid < cutoff;
    let cur_shift1 = cur_low < cutoff;
    let cur_shift2 = cur_low + cur_mid < cutoff;
    if !(prev_shift1 || prev_shift2 || cur_shift1 || cur_shift2) {
        return false;
    }

    let prev = history.last(1).map(Data::encode).unwrap_or_default();
    let t1s = [t1, counter_at_shift(&prev, 1), counter_at_shift(&prev, 2)];
    let t0s = [
        raw_counter(window),
        counter_at_shift(window, 1),
        counter_at_shift(window, 2),
    ];

    let t = [t1, t2, t3];
    (prev_shift1 && cur_shift1 && head_of_previous_lost(&t0s, &t1s, t, 1))
        || (prev_shift2 && cur_shift2 && head_of_previous_lost(&t0s, &t1s, t, 2))
        || (prev_shift1 && cur_shift1 && tail_of_previous_lost(&t0s, t, 1))
        || (prev_shift2 && cur_shift2 && tail_of_previous_lost(&t0s, t, 2))
        || (cur_shift1 && head_of_current_lost(&t0s, t, 1))
        || (cur_shift2 && head_of_current_lost(&t0s, t, 2))
}

/// The previous record lost `k` leading bytes, so both it and this window read `k` bytes
/// early. `t0s` and `t1s` hold the counters of this window and the previous record re-read
/// at 0, 1 and 2 byte shifts; `t` holds the three most recent history counters.
fn head_of_previous_lost(t0s: &[u32; 3], t1s: &[u32; 3], t: [u32; 3], k: usize) -> bool {
    let [t1, t2, t3] = t;
    elapsed(t1s[k], t3) < elapsed(t1, t3)
        && elapsed(t1s[k], t2) < elapsed(t1, t2)
        && elapsed(t0s[k], t2) < elapsed(t0s[0], t2)
        && elapsed(t0s[k], t2) < elapsed(t0s[k], t3)
        && elapsed(t0s[k], t1s[k]) < elapsed(t0s[k], t2)
}

/// The previous record lost `k` trailing bytes; only this window is affected.
fn tail_of_previous_lost(t0s: &[u32; 3], t: [u32; 3], k: usize) -> bool {
    let [_, t2, t3] = t;
    elapsed(t0s[k], t3) < elapsed(t0s[0], t3)
        && elapsed(t0s[k], t2) < elapsed(t0s[0], t2)
        && elapsed(t0s[k], t2) < elapsed(t0s[k], t3)
}

/// This window lost `k` leading bytes.
fn head_of_current_lost(t0s: &[u32; 3], t: [u32; 3], k: usize) -> bool {
    let [t1, t2, t3] = t;
    elapsed(t0s[k], t3) < elapsed(t0s[0], t3)
        && elapsed(t0s[k], t2) < elapsed(t0s[0], t2)
        && elapsed(t0s[k], t1) < elapsed(t0s[0], t1)
        && elapsed(t0s[k], t2) < elapsed(t0s[k], t3)
        && elapsed(t0s[k], t1) < elapsed(t0s[k], t2)
}

/// The counter re-read 1 or 2 bytes early orders better against the history.
#[must_use]
pub fn tail_shift_suspected(window: &RawFrame, history: &History) -> bool {
    let Some((t1, t2, t3)) = history.counters() else {
        return false;
    };
    let t0 = raw_counter(window);
    [1, 2].into_iter().any(|k| {
        let shifted = counter_at_shift(window, k);
        elapsed(shifted, t3) < elapsed(t0, t3)
            && elapsed(shifted, t2) < elapsed(t0, t2)
            && elapsed(shifted, t1) < elapsed(t0, t1)
            && elapsed(shifted, t2) < elapsed(shifted, t3)
    })
}

/// Leading bytes of this window and of the previous record are both dense.
#[must_use]
pub fn head_density_suspected(window: &RawFrame, history: &History, config: &ResyncConfig) -> bool {
    let Some(prev) = history.last(1) else {
        return false;
    };
    bits(window[0]) > config.head_bits && bits((prev.primary >> 56) as u8) > config.head_bits
}

/// The counter moved up one byte, dropping its low byte, orders at least as well.
#[must_use]
pub fn head_shift_suspected(window: &RawFrame, history: &History) -> bool {
    const COARSE: u32 = 0x07ff_ff00;
    let Some((_, t2, t3)) = history.counters() else {
        return false;
    };
    let t0 = raw_counter(window);
    let t3 = t3 & COARSE;
    let t2 = t2 & COARSE;
    let unshifted = t0 & COARSE;
    let shifted = (t0 << 8) & COARSE;
    elapsed_inclusive(shifted, t3) <= elapsed_inclusive(unshifted, t3)
        && elapsed_inclusive(shifted, t2) <= elapsed_inclusive(unshifted, t2)
}

/// Detection tier, applied to every data-position frame.
#[must_use]
pub fn suspect(window: &RawFrame, history: &History, wired: Wired, config: &ResyncConfig) -> bool {
    has_unwired_bits(window, wired)
        || has_no_hit_bits(window, wired)
        || invalid_counter_strict(window, history, config)
        || boundary_shift_suspected(window, history, config)
        || head_density_suspected(window, history, config)
}

/// Relaxed tier, applied to each shifted window during repair.
#[must_use]
pub fn suspect_relaxed(
    window: &RawFrame,
    history: &History,
    wired: Wired,
    config: &ResyncConfig,
) -> bool {
    has_unwired_bits(window, wired)
        || has_no_hit_bits(window, wired)
        || invalid_counter_relaxed(window, history, config)
        || boundary_shift_suspected(window, history, config)
        || tail_shift_suspected(window, history)
        || head_shift_suspected(window, history)
}

/// What a whole discarded frame most likely was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discarded {
    /// A valid record flagged only by the boundary test; the window after it validates once
    /// it is part of the history.
    Record,
    /// Well-formed counter, no hits.
    Empty,
    Noise,
}

/// Classify a frame discarded in full, given the window that followed it.
#[must_use]
pub fn classify_discarded(
    thrown: &RawFrame,
    window: &RawFrame,
    history: &History,
    wired: Wired,
    config: &ResyncConfig,
) -> Discarded {
    let unwired = has_unwired_bits(thrown, wired);
    let no_hits = has_no_hit_bits(thrown, wired);
    let invalid = invalid_counter_strict(thrown, history, config);
    let boundary = boundary_shift_suspected(thrown, history, config);
    let dense = head_density_suspected(thrown, history, config);

    if !unwired && !no_hits && !invalid && boundary && !dense {
        let mut tentative = history.clone();
        tentative.push(Data::parse(thrown));
        if !suspect(window, &tentative, wired, config) {
            return Discarded::Record;
        }
    } else if !unwired && no_hits && !invalid && !boundary && !dense {
        return Discarded::Empty;
    }
    Discarded::Noise
}
