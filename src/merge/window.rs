use std::collections::VecDeque;

use crate::board::TdcHit;
use crate::channel::BoardId;
use crate::error::{Error, Result};

/// A sync pulse on one board's timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPulse {
    /// Calibrated, wrap-corrected counter.
    pub counter: i64,
    pub time_ns: f64,
    /// Synthesized in place of a pulse the board never reported.
    pub interpolated: bool,
}

impl From<&TdcHit> for SyncPulse {
    fn from(hit: &TdcHit) -> Self {
        SyncPulse {
            counter: hit.counter,
            time_ns: hit.time_ns,
            interpolated: false,
        }
    }
}

/// The three most recent pulses of a board and any pulses queued behind them.
///
/// Pulses always come out of the window in time order. When a pulse arrives more than one
/// interval after its predecessor, the skipped pulses are interpolated and queued ahead of
/// it.
#[derive(Debug, Default, Clone)]
pub struct SyncWindow {
    last: Option<SyncPulse>,
    next: Option<SyncPulse>,
    next2: Option<SyncPulse>,
    reserve: VecDeque<SyncPulse>,
}

impl SyncWindow {
    pub fn last(&self) -> Option<SyncPulse> {
        self.last
    }

    pub fn next(&self) -> Option<SyncPulse> {
        self.next
    }

    pub fn next2(&self) -> Option<SyncPulse> {
        self.next2
    }

    /// Queued pulses beyond `next2`.
    pub fn reserved(&self) -> usize {
        self.reserve.len()
    }

    /// Whether the window holds a pulse beyond the current bracket.
    pub fn is_primed(&self) -> bool {
        self.next2.is_some()
    }

    /// The (last, next] bracket, once both ends are known.
    pub fn bracket(&self) -> Option<(SyncPulse, SyncPulse)> {
        Some((self.last?, self.next?))
    }

    /// Move every pulse one slot towards `last`, refilling `next2` from the reserve.
    pub fn shift(&mut self) {
        self.last = self.next;
        self.next = self.next2;
        self.next2 = self.reserve.pop_front();
    }

    fn pulses(&self) -> impl DoubleEndedIterator<Item = &SyncPulse> + '_ {
        self.last
            .iter()
            .chain(self.next.iter())
            .chain(self.next2.iter())
            .chain(self.reserve.iter())
    }

    fn place(&mut self, pulse: SyncPulse) {
        if self.last.is_none() {
            self.last = Some(pulse);
        } else if self.next.is_none() {
            self.next = Some(pulse);
        } else if self.next2.is_none() {
            self.next2 = Some(pulse);
        } else {
            self.reserve.push_back(pulse);
        }
    }

    /// Add a real pulse, returning how many pulses were interpolated ahead of it.
    ///
    /// The step is the distance to the newest known pulse in units of the interval between
    /// the two newest pulses, rounded to the nearest integer. A step of `n > 1` inserts
    /// `n - 1` evenly spaced pulses.
    ///
    /// # Errors
    /// [Error::SyncInverted] if the step is not positive.
    pub fn push(&mut self, board: BoardId, pulse: SyncPulse) -> Result<usize> {
        let pair = {
            let mut rev = self.pulses().rev().copied();
            (rev.next(), rev.next())
        };
        let (newest, before) = match pair {
            (None, _) => {
                self.place(pulse);
                return Ok(0);
            }
            (Some(only), None) => {
                if pulse.counter <= only.counter {
                    return Err(Error::SyncInverted {
                        board,
                        last: only.counter,
                        next: only.counter,
                        new: pulse.counter,
                        step: 0,
                    });
                }
                self.place(pulse);
                return Ok(0);
            }
            (Some(newest), Some(before)) => (newest, before),
        };

        let interval = newest.counter - before.counter;
        let gap = pulse.counter - newest.counter;
        let step = if interval > 0 {
            (gap as f64 / interval as f64).round() as i64
        } else {
            0
        };
        if step <= 0 {
            return Err(Error::SyncInverted {
                board,
                last: before.counter,
                next: newest.counter,
                new: pulse.counter,
                step,
            });
        }

        for i in 1..step {
            let frac = i as f64 / step as f64;
            self.place(SyncPulse {
                counter: newest.counter + gap * i / step,
                time_ns: newest.time_ns + (pulse.time_ns - newest.time_ns) * frac,
                interpolated: true,
            });
        }
        self.place(pulse);
        Ok((step - 1) as usize)
    }
}
