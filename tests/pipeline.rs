mod common;

use std::fs::{self, File};
use std::io::Read;
use std::thread;

use tdcsync::mock::MockBoard;
use tdcsync::source::{self, ChunkReader};
use tdcsync::{write_rows, BoardStream, Config, Row, StreamMerger};

const CONFIG: &str = r#"{
    "boards": [
        {
            "id": 0,
            "path": "board0.dat",
            "channels": [
                {"local": {"class": "primary", "index": 32}, "global": 0},
                {"local": {"class": "sync"}, "global": 170}
            ],
            "offsets": {"0": 10}
        },
        {
            "id": 1,
            "path": "board1.dat",
            "time_per_count_ns": 2.5,
            "channels": [
                {"local": {"class": "primary", "index": 32}, "global": 64},
                {"local": {"class": "sync"}, "global": 171}
            ]
        }
    ],
    "resync": {"enabled": false}
}"#;

fn spawn_reader(path: std::path::PathBuf) -> (ChunkReader, thread::JoinHandle<()>) {
    let (tx, reader) = source::channel(4);
    let handle = thread::spawn(move || {
        let mut file = File::open(path).unwrap();
        let mut buf = [0u8; 100];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            tx.send(buf[..n].to_vec()).unwrap();
        }
    });
    (reader, handle)
}

#[test]
fn config_files_and_channels_to_rows() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("tdcsync.json"), CONFIG).unwrap();
    for board in 0..2 {
        let mock = MockBoard::builder()
            .board(board)
            .pulses(5)
            .hits_per_cycle(1)
            .event_match(3)
            .build();
        fs::write(dir.path().join(format!("board{board}.dat")), mock.bytes()).unwrap();
    }

    let config = Config::from_path(dir.path().join("tdcsync.json")).unwrap();
    let map = std::sync::Arc::new(config.channel_map().unwrap());
    let mut handles = Vec::new();
    let streams = config
        .boards
        .iter()
        .map(|board| {
            let (reader, handle) = spawn_reader(board.path.clone());
            handles.push(handle);
            BoardStream::new(
                board.id,
                reader,
                map.clone(),
                board.calibration(),
                config.resync.clone(),
            )
        })
        .collect();

    let mut out = Vec::new();
    let stats = StreamMerger::new(streams, config.merge.clone())
        .run(|batch| write_rows(&mut out, &batch))
        .unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    let rows: Vec<Row> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    // one hit and one pulse per board in each of four cycles
    assert_eq!(rows.len(), 16);
    assert_eq!(stats.batches, 4);
    assert_eq!(stats.hits, 16);

    let first: Vec<(u16, i64)> = rows[..4].iter().map(|r| (r.channel, r.counter)).collect();
    assert_eq!(first, vec![(0, 2600), (64, 2610), (170, 5220), (171, 5220)]);
    assert!((rows[0].time_ns - 13000.0).abs() < 1e-9);
    assert!((rows[1].time_ns - 6525.0).abs() < 1e-9);
    assert_eq!(rows[1].sync_channel, Some(171));
    assert!((rows[1].time_per_count_ns - 2.5).abs() < f64::EPSILON);
    assert!(rows.iter().all(|r| r.spill == 1));
    // footers arrive with the last cycle
    assert!(rows[..12].iter().all(|r| r.event_match.is_none()));
    assert!(rows[12..].iter().all(|r| r.event_match == Some(3)));
}

#[test]
fn empty_streams_produce_nothing() {
    let streams = common::streams(vec![Vec::new(), Vec::new()]);
    let mut merger = StreamMerger::new(streams, Default::default());
    assert!(merger.next().is_none());
    assert_eq!(merger.stats().spills, 0);
}
