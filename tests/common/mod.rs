#![allow(dead_code)]
use std::io::Cursor;
use std::sync::Arc;

use tdcsync::mock::MockBoard;
use tdcsync::{
    BoardId, BoardStream, Calibration, ChannelEntry, ChannelKind, ChannelMap, GlobalChannel,
    LocalChannel, ResyncConfig,
};

/// Primary 32 and 33 of board `b` feed global channels `10*b` and `10*b + 1`; its sync
/// flag feeds `100 + b`.
pub fn channel_map(boards: u8) -> Arc<ChannelMap> {
    let mut entries = Vec::new();
    for board in 0..boards {
        let base = 10 * GlobalChannel::from(board);
        for (local, global, kind) in [
            (LocalChannel::Primary(32), base, ChannelKind::Regular),
            (LocalChannel::Primary(33), base + 1, ChannelKind::Regular),
            (LocalChannel::Sync, sync_channel(board), ChannelKind::Sync),
        ] {
            entries.push(ChannelEntry {
                board,
                local,
                global,
                kind,
            });
        }
    }
    Arc::new(ChannelMap::new(entries).unwrap())
}

pub fn hit_channel(board: BoardId) -> GlobalChannel {
    10 * GlobalChannel::from(board)
}

pub fn sync_channel(board: BoardId) -> GlobalChannel {
    100 + GlobalChannel::from(board)
}

/// One stream per byte buffer, board ids in order, resync checks off.
pub fn streams(inputs: Vec<Vec<u8>>) -> Vec<BoardStream<Cursor<Vec<u8>>>> {
    let map = channel_map(u8::try_from(inputs.len()).unwrap());
    inputs
        .into_iter()
        .enumerate()
        .map(|(id, bytes)| {
            BoardStream::new(
                BoardId::try_from(id).unwrap(),
                Cursor::new(bytes),
                map.clone(),
                Calibration::default(),
                ResyncConfig::builder().enabled(false).build(),
            )
        })
        .collect()
}

pub fn mock_streams(mocks: &[MockBoard]) -> Vec<BoardStream<Cursor<Vec<u8>>>> {
    streams(mocks.iter().map(MockBoard::bytes).collect())
}
