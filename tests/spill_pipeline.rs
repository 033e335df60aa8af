use std::io::{BufRead, BufReader, Cursor};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spillmon::agent::Agent;
use spillmon::config::Config;
use spillmon::export::health::HealthMetrics;
use spillmon::pipeline::consumers::SpillAccumulator;
use spillmon::pipeline::{Pipeline, PipelineOptions};
use spillmon::sink::tcp::TcpPublisher;
use spillmon::source::event::RawEvent;
use spillmon::source::parse::encode_frame;
use spillmon::source::unpack::Unpacker;
use spillmon::source::{EventSource, FrameSource};
use spillmon::spill::{SpillPhase, SpillSettings, SpillTracker};

const CHANNEL_KEYS: [&str; 19] = [
    "name",
    "counted",
    "lost_hits",
    "overflows",
    "elapsed_time",
    "binx",
    "biny",
    "poisson_x",
    "poisson_y",
    "xticks_major",
    "xticks_major_label",
    "xticks_minor",
    "yticks_major",
    "yticks_major_label",
    "yticks_minor",
    "offspill",
    "macro_x",
    "macro_y",
    "macro_errors",
];

fn frame(trigger: u32, clock: u32, ecl: u32, timing: &[u32]) -> RawEvent {
    RawEvent {
        trigger,
        clock,
        ecl,
        timing: timing.to_vec(),
        ..Default::default()
    }
}

/// One spill on channel 1: hits 100, 200, 50 and 300 ticks apart.
fn one_spill(base: u32) -> Vec<RawEvent> {
    vec![
        frame(12, base + 1_000, base, &[]),
        frame(1, base + 1_200, base + 3, &[base + 5_000, base + 5_100, base + 5_300]),
        frame(1, base + 1_500, base + 4, &[base + 5_350]),
        frame(1, base + 1_800, base + 5, &[base + 5_650]),
        frame(13, base + 2_000, base + 5, &[]),
    ]
}

fn stream_bytes(events: &[RawEvent]) -> Vec<u8> {
    events.iter().flat_map(encode_frame).collect()
}

fn write_replay(dir: &Path, events: &[RawEvent]) -> std::path::PathBuf {
    let path = dir.join("run.frames");
    std::fs::write(&path, stream_bytes(events)).expect("write replay file");
    path
}

fn replay_config(replay: &Path, dump: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.health.addr.clear();
    cfg.source.replay = Some(replay.to_path_buf());
    cfg.source.discard_backlog = Duration::ZERO;
    cfg.publish.dump = true;
    cfg.publish.dump_path = dump.to_path_buf();
    cfg.validate().expect("valid test config");
    cfg
}

#[test]
fn test_frames_to_snapshot() {
    let mut source = FrameSource::new("mem", Cursor::new(stream_bytes(&one_spill(0))));
    let mut unpacker = Unpacker::default();
    let mut tracker = SpillTracker::new(&SpillSettings::default()).expect("tracker");

    let mut snapshots = Vec::new();
    while let Ok(raw) = source.next_event() {
        let event = unpacker.unpack(&raw).expect("unpack");
        if let Some(snap) = tracker.handle(&event).expect("handle") {
            snapshots.push(snap);
        }
    }

    assert_eq!(snapshots.len(), 1);
    assert_eq!(tracker.phase(), SpillPhase::OffSpill);

    let snap = &snapshots[0];
    assert_eq!(snap.spill_number, 1);
    assert_eq!(snap.spill_duration, 1_000);
    assert_eq!(snap.data.len(), 4);
    assert_eq!(snap.data[0].counted, 4);
    assert_eq!(snap.data[0].overflows, 0);
    assert_eq!(snap.data[0].elapsed_time, 600);
    assert!(snap.data[1..].iter().all(|c| c.counted == 0));

    let json: serde_json::Value =
        serde_json::from_str(&snap.to_json().expect("json")).expect("parse json");
    for key in ["data", "spill_number", "spill_duration", "timestamp"] {
        assert!(json.get(key).is_some(), "missing top-level {key}");
    }
    for channel in json["data"].as_array().expect("data array") {
        for key in CHANNEL_KEYS {
            assert!(channel.get(key).is_some(), "missing channel key {key}");
        }
    }
    assert_eq!(json["data"][0]["name"], "ECL_IN(1)");
}

#[test]
fn test_hit_clock_wrap_through_frames() {
    let events = vec![
        frame(12, 0, 0, &[]),
        frame(2, 100, 1, &[0x7FFF_FFF0]),
        frame(2, 200, 2, &[5]),
        frame(13, 1_000, 2, &[]),
    ];
    let mut source = FrameSource::new("mem", Cursor::new(stream_bytes(&events)));
    let mut unpacker = Unpacker::default();

    let mut deltas = Vec::new();
    while let Ok(raw) = source.next_event() {
        deltas.extend(unpacker.unpack(&raw).expect("unpack").deltas);
    }

    assert_eq!(deltas, vec![21]);
    assert_eq!(unpacker.take_anomalies(), 0);
}

#[test]
fn test_replay_dump_writes_first_spill() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut events = one_spill(0);
    events.extend(one_spill(100_000));
    let replay = write_replay(dir.path(), &events);
    let dump = dir.path().join("tcp").join("example.json");

    Agent::new(replay_config(&replay, &dump))
        .expect("agent")
        .run()
        .expect("dump run succeeds");

    let text = std::fs::read_to_string(&dump).expect("dump file");
    let json: serde_json::Value = serde_json::from_str(&text).expect("dump json");
    assert_eq!(json["spill_number"], 1);
    assert_eq!(json["spill_duration"], 1_000);
    assert_eq!(json["data"][0]["counted"], 4);
    assert!(text.contains("\n    \"spill_duration\""));
}

#[test]
fn test_replay_without_complete_spill_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Starts mid-spill: the end of spill is never published.
    let events = one_spill(0).split_off(1);
    let replay = write_replay(dir.path(), &events);
    let dump = dir.path().join("example.json");

    let err = Agent::new(replay_config(&replay, &dump))
        .expect("agent")
        .run()
        .expect_err("end of stream is fatal");

    assert!(format!("{err:#}").contains("event stream closed"));
    assert!(!dump.exists());
}

#[test]
fn test_unknown_category_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let events = vec![frame(12, 0, 0, &[]), frame(7, 10, 0, &[]), frame(13, 20, 0, &[])];
    let replay = write_replay(dir.path(), &events);
    let dump = dir.path().join("example.json");

    let err = Agent::new(replay_config(&replay, &dump))
        .expect("agent")
        .run()
        .expect_err("category 7 is a protocol violation");

    assert!(format!("{err:#}").contains("unknown trigger category 7"));
    assert!(!dump.exists());
}

#[test]
fn test_tcp_subscriber_receives_each_spill() {
    let publisher = TcpPublisher::bind(
        "127.0.0.1:0".parse().expect("addr"),
        Duration::from_millis(500),
    )
    .expect("bind publisher");
    let client = TcpStream::connect(publisher.local_addr()).expect("connect");
    let start = Instant::now();
    while publisher.subscriber_count() < 1 {
        assert!(start.elapsed() < Duration::from_secs(5), "subscriber never registered");
        thread::sleep(Duration::from_millis(5));
    }

    let mut events = one_spill(0);
    events.extend(one_spill(50_000));
    let health = Arc::new(HealthMetrics::new("").expect("metrics"));
    let mut pipeline = Pipeline::new(
        Box::new(FrameSource::new("mem", Cursor::new(stream_bytes(&events)))),
        Unpacker::default(),
        PipelineOptions::default(),
        Arc::clone(&health),
    );
    pipeline.add_consumer(Box::new(SpillAccumulator::new(
        SpillTracker::new(&SpillSettings::default()).expect("tracker"),
        Box::new(publisher),
        1e8,
        Arc::clone(&health),
        Arc::new(Mutex::new(())),
    )));

    // The replayed stream ends, which is fatal once both spills are out.
    assert!(pipeline.run().is_err());

    let mut reader = BufReader::new(client);
    for expected in 1..=2 {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read snapshot line");
        let json: serde_json::Value = serde_json::from_str(&line).expect("snapshot json");
        assert_eq!(json["spill_number"], expected);
        assert_eq!(json["data"][0]["counted"], 4);
    }

    assert_eq!(health.spills_completed.get() as u64, 2);
    assert_eq!(
        health
            .deliveries
            .with_label_values(&["delivered"])
            .get() as u64,
        2
    );
}
