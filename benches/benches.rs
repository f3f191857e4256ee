use std::io::Cursor;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tdcsync::frame::{FrameDecoder, RawFrame, FRAME_LEN};
use tdcsync::mock::MockBoard;
use tdcsync::{
    BoardStream, Calibration, ChannelEntry, ChannelKind, ChannelMap, LocalChannel, MergeConfig,
    Resync, ResyncConfig, StreamMerger,
};

fn mock(board: u8) -> MockBoard {
    MockBoard::builder()
        .board(board)
        .pulses(2_000)
        .hits_per_cycle(20)
        .build()
}

fn channel_map(boards: u8) -> Arc<ChannelMap> {
    let entries = (0..boards).flat_map(|board| {
        [
            ChannelEntry {
                board,
                local: LocalChannel::Primary(32),
                global: u16::from(board),
                kind: ChannelKind::Regular,
            },
            ChannelEntry {
                board,
                local: LocalChannel::Sync,
                global: 100 + u16::from(board),
                kind: ChannelKind::Sync,
            },
        ]
    });
    Arc::new(ChannelMap::new(entries).unwrap())
}

fn bench_decode(c: &mut Criterion) {
    let frames: Vec<RawFrame> = mock(0).frames();

    let mut group = c.benchmark_group("frame");
    group.throughput(Throughput::Bytes((frames.len() * FRAME_LEN) as u64));
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            frames.iter().map(|raw| decoder.decode(raw)).count()
        });
    });
    group.finish();
}

fn bench_resync(c: &mut Criterion) {
    let bytes = mock(0).bytes();
    let map = channel_map(1);

    let mut group = c.benchmark_group("resync");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("clean_stream", |b| {
        b.iter(|| {
            Resync::new(&bytes[..], 0, map.wired(0), ResyncConfig::default())
                .filter_map(Result::ok)
                .count()
        });
    });
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let inputs: Vec<Vec<u8>> = (0..4).map(|board| mock(board).bytes()).collect();
    let map = channel_map(4);
    let total: usize = inputs.iter().map(Vec::len).sum();

    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Bytes(total as u64));
    group.bench_function("four_boards", |b| {
        b.iter(|| {
            let streams = inputs
                .iter()
                .enumerate()
                .map(|(id, bytes)| {
                    BoardStream::new(
                        id as u8,
                        Cursor::new(bytes.as_slice()),
                        map.clone(),
                        Calibration::default(),
                        ResyncConfig::builder().enabled(false).build(),
                    )
                })
                .collect();
            StreamMerger::new(streams, MergeConfig::default())
                .filter_map(Result::ok)
                .count()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_decode, bench_resync, bench_merge);
criterion_main!(benches);
