use crate::channel::{BoardId, GlobalChannel};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Two local channels on the same board claim different global channels, or one board
    /// is configured twice.
    #[error("Conflicting channel map entry for board {board}: {detail}")]
    ChannelConflict { board: BoardId, detail: String },

    /// Boards disagree on the event-match count reported by their spill footers.
    #[error("Event-match mismatch on board {board}: expected {expected}, got {actual}")]
    EventMatchMismatch {
        board: BoardId,
        expected: u16,
        actual: u16,
    },

    /// A new sync pulse did not advance relative to the two preceding pulses.
    #[error("Sync pulse inverted on board {board}: last={last} next={next} new={new} step={step}")]
    SyncInverted {
        board: BoardId,
        last: i64,
        next: i64,
        new: i64,
        step: i64,
    },

    /// Pending, unbracketed hits exceeded the configured cap.
    #[error("Pending hit buffer overflow on board {board}: more than {cap} hits without a sync bracket")]
    BufferOverflow { board: BoardId, cap: usize },

    /// Boards could not be aligned on a common first sync pulse.
    #[error("Could not lock boards on a common sync pulse after {attempts} attempts")]
    StartupLock { attempts: usize },

    #[error("Unknown global channel {0}")]
    UnknownChannel(GlobalChannel),
}

impl Error {
    /// Whether the run must abort. Everything except configuration lookups raised while
    /// building a pipeline is fatal once streaming has begun.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::EventMatchMismatch { .. }
                | Error::SyncInverted { .. }
                | Error::BufferOverflow { .. }
                | Error::StartupLock { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
