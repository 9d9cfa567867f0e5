//! Writer-to-reader round trips over real tracebuffer files.

use std::time::{SystemTime, UNIX_EPOCH};

use serial_test::serial;
use tempfile::TempDir;

use clltk_core::layout::ArgType;
use clltk_decoder::{SyncTracebuffer, TracepointKind};
use clltk_tracing::{
    dump_tracepoint, dynamic_tracepoint, set_tracing_path, static_tracepoint, ArgValue,
    Tracebuffer, TracepointSite,
};

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}

/// Scratch tracing directory installed as the process-wide path.
fn tracing_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    set_tracing_path(dir.path());
    dir
}

#[test]
#[serial]
fn simple_printf_round_trip() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "hello %s", &[ArgType::Str]);

    let buffer = Tracebuffer::open("roundtrip_printf", 1024).unwrap();
    let before = now_ns();
    static_tracepoint(&buffer, &SITE, &[ArgValue::Str("world")]);
    let after = now_ns();

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let tp = sync.next(None).expect("one tracepoint");
    assert_eq!(tp.kind(), TracepointKind::Static);
    assert_eq!(tp.msg(), "hello world");
    assert_eq!(tp.nr, 0);
    assert!(tp.timestamp_ns >= before && tp.timestamp_ns <= after);
    assert_eq!(tp.pid(), std::process::id());
    assert!(tp.file().ends_with("roundtrip.rs"));
    assert!(sync.next(None).is_none());
}

#[test]
#[serial]
fn second_event_reuses_the_metadata() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "count %u", &[ArgType::U32]);

    let buffer = Tracebuffer::open("roundtrip_reuse", 1024).unwrap();
    static_tracepoint(&buffer, &SITE, &[ArgValue::U32(1)]);
    static_tracepoint(&buffer, &SITE, &[ArgValue::U32(2)]);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let first = sync.next(None).unwrap();
    let second = sync.next(None).unwrap();
    assert_eq!(first.msg(), "count 1");
    assert_eq!(second.msg(), "count 2");
    assert_eq!(first.nr, 0);
    assert_eq!(second.nr, 1);
    assert_eq!(first.line(), second.line());
}

#[test]
#[serial]
fn many_argument_types_render() {
    let _dir = tracing_dir();
    static SITE: TracepointSite = TracepointSite::new(
        file!(),
        line!(),
        "%c %d %u %x %s %f",
        &[
            ArgType::U8,
            ArgType::I32,
            ArgType::U32,
            ArgType::U64,
            ArgType::Str,
            ArgType::F64,
        ],
    );

    let buffer = Tracebuffer::open("roundtrip_types", 4096).unwrap();
    static_tracepoint(
        &buffer,
        &SITE,
        &[
            ArgValue::U8(b'Q'),
            ArgValue::I32(-17),
            ArgValue::U32(17),
            ArgValue::U64(0xFF),
            ArgValue::Str("txt"),
            ArgValue::F64(2.25),
        ],
    );

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let tp = sync.next(None).unwrap();
    assert_eq!(tp.msg(), "Q -17 17 ff txt 2.250000");
}

#[test]
#[serial]
fn wrap_and_drop_keeps_only_the_tail() {
    let _dir = tracing_dir();
    // 54 dump bytes make each ring entry body exactly 80 bytes:
    // 22 head + 4 size + 54 payload.
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "overflow dump", &[ArgType::Dump]);

    let buffer = Tracebuffer::open("roundtrip_wrap", 256).unwrap();
    for _ in 0..100 {
        dump_tracepoint(&buffer, &SITE, &[0xAAu8; 54]);
    }
    assert_eq!(buffer.entries(), 100);
    assert!(buffer.dropped() >= 97);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let mut expected_nr = buffer.dropped();
    let mut yielded = 0u64;
    while let Some(tp) = sync.next(None) {
        assert_eq!(tp.kind(), TracepointKind::Static);
        assert_eq!(tp.nr, expected_nr);
        expected_nr += 1;
        yielded += 1;
    }
    assert_eq!(yielded, 100 - buffer.dropped());
    assert!((2..=3).contains(&yielded));
}

#[test]
#[serial]
fn damaged_entry_head_surfaces_then_recovers() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "hello %s", &[ArgType::Str]);

    let buffer = Tracebuffer::open("roundtrip_damage", 1024).unwrap();
    static_tracepoint(&buffer, &SITE, &[ArgValue::Str("doomed")]);

    // Flip the CRC byte of the first ring entry head.
    let raw = std::fs::read(buffer.path()).unwrap();
    let ring_offset = u64::from_le_bytes(raw[32..40].try_into().unwrap()) as usize;
    let head_crc_position = ring_offset + 160 + 3;
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(buffer.path())
            .unwrap();
        file.seek(SeekFrom::Start(head_crc_position as u64)).unwrap();
        file.write_all(&[raw[head_crc_position] ^ 0xFF]).unwrap();
    }

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let first = sync.next(None).expect("an error tracepoint");
    assert_eq!(first.kind(), TracepointKind::Error);
    assert!(first.msg().contains("crc"), "message: {}", first.msg());

    // Scanning past the damage may surface more errors but no events.
    let mut remaining = Vec::new();
    while let Some(tp) = sync.next(None) {
        remaining.push(tp.kind());
    }
    assert!(remaining.iter().all(|k| *k == TracepointKind::Error));

    // A fresh write decodes normally.
    static_tracepoint(&buffer, &SITE, &[ArgValue::Str("survivor")]);
    let tp = sync.next(None).expect("the fresh tracepoint");
    assert_eq!(tp.kind(), TracepointKind::Static);
    assert_eq!(tp.msg(), "hello survivor");
}

#[test]
#[serial]
fn dynamic_tracepoint_round_trip() {
    let _dir = tracing_dir();
    let before = now_ns();
    dynamic_tracepoint("X", "f", 42, 1, 2, "arg");
    let after = now_ns();

    let path = clltk_tracing::tracing_path().join("X.clltk_trace");
    let mut sync = SyncTracebuffer::open(&path).unwrap();
    let tp = sync.next(None).expect("one tracepoint");
    assert_eq!(tp.kind(), TracepointKind::Dynamic);
    assert_eq!(tp.file(), "f");
    assert_eq!(tp.line(), 42);
    assert_eq!(tp.pid(), 1);
    assert_eq!(tp.tid(), 2);
    assert_eq!(tp.msg(), "arg");
    // Stamped inside the insert's critical section, so well after the
    // call started and before it returned.
    assert!(tp.timestamp_ns >= before && tp.timestamp_ns <= after);
    assert!(sync.next(None).is_none());
}

#[test]
#[serial]
fn dump_tracepoint_round_trip() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "raw packet", &[ArgType::Dump]);

    let buffer = Tracebuffer::open("roundtrip_dump", 1024).unwrap();
    dump_tracepoint(&buffer, &SITE, &[0xDE, 0xAD, 0xBE, 0xEF]);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let tp = sync.next(None).unwrap();
    assert_eq!(tp.msg(), "raw packet =(dump)= \"DE AD BE EF\"");
}

#[test]
#[serial]
fn pending_and_top_counters_drive_drains() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "tick %u", &[ArgType::U32]);

    let buffer = Tracebuffer::open("roundtrip_pending", 4096).unwrap();
    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    assert_eq!(sync.pending(), 0);
    assert_eq!(sync.current_top_entries_nr(), 0);

    for i in 0..5 {
        static_tracepoint(&buffer, &SITE, &[ArgValue::U32(i)]);
    }
    assert!(sync.pending() > 0);
    assert_eq!(sync.current_top_entries_nr(), 5);

    let mut drained = 0;
    while sync.next(None).is_some() {
        drained += 1;
    }
    assert_eq!(drained, 5);
    assert_eq!(sync.pending(), 0);
}

#[test]
#[serial]
fn skip_to_end_sees_only_new_events() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "msg %u", &[ArgType::U32]);

    let buffer = Tracebuffer::open("roundtrip_skip", 4096).unwrap();
    static_tracepoint(&buffer, &SITE, &[ArgValue::U32(1)]);
    static_tracepoint(&buffer, &SITE, &[ArgValue::U32(2)]);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    sync.skip_to_end();
    assert!(sync.next(None).is_none());

    static_tracepoint(&buffer, &SITE, &[ArgValue::U32(3)]);
    let tp = sync.next(None).unwrap();
    assert_eq!(tp.msg(), "msg 3");
    assert_eq!(tp.nr, 2);
}

#[test]
#[serial]
fn string_under_percent_p_records_only_the_address() {
    let _dir = tracing_dir();
    // The site declares a string, but the format consumes it with %p:
    // the writer tightens the type on first use and records the
    // address instead of the bytes.
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "buf at %p", &[ArgType::Str]);

    let buffer = Tracebuffer::open("roundtrip_tighten", 1024).unwrap();
    static_tracepoint(&buffer, &SITE, &[ArgValue::Str("payload")]);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let tp = sync.next(None).unwrap();
    assert_eq!(tp.kind(), TracepointKind::Static);
    assert!(tp.msg().starts_with("buf at 0x"), "message: {}", tp.msg());
    assert!(!tp.msg().contains("payload"));
}

#[test]
#[serial]
fn pointer_under_percent_s_renders_invalid_arg() {
    let _dir = tracing_dir();
    // A pointer traced where the format expects a string must never be
    // dereferenced by the decoder.
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "name=%s", &[ArgType::Pointer]);

    let buffer = Tracebuffer::open("roundtrip_invalid", 1024).unwrap();
    static_tracepoint(&buffer, &SITE, &[ArgValue::Ptr(0xDEAD_BEEF)]);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let tp = sync.next(None).unwrap();
    assert_eq!(tp.msg(), "name=<invalid arg>");
}

#[test]
#[serial]
fn concurrent_writers_are_serialised() {
    let _dir = tracing_dir();

    let threads: Vec<_> = (0..4)
        .map(|worker: u32| {
            std::thread::spawn(move || {
                let site = TracepointSite::new(file!(), line!(), "w %u %u", &[ArgType::U32, ArgType::U32]);
                let buffer = Tracebuffer::open("roundtrip_parallel", 64 * 1024).unwrap();
                for i in 0..50 {
                    static_tracepoint(&buffer, &site, &[ArgValue::U32(worker), ArgValue::U32(i)]);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let buffer = Tracebuffer::open("roundtrip_parallel", 64 * 1024).unwrap();
    assert_eq!(buffer.entries(), 200);
    assert_eq!(buffer.dropped(), 0);

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let mut seen = 0u64;
    let mut last_nr = None;
    while let Some(tp) = sync.next(None) {
        assert_eq!(tp.kind(), TracepointKind::Static);
        if let Some(last) = last_nr {
            assert_eq!(tp.nr, last + 1);
        }
        last_nr = Some(tp.nr);
        seen += 1;
    }
    assert_eq!(seen, 200);
}

#[test]
#[serial]
fn filters_skip_unwanted_tracepoints() {
    let _dir = tracing_dir();
    static SITE: TracepointSite =
        TracepointSite::new(file!(), line!(), "n=%u", &[ArgType::U32]);

    let buffer = Tracebuffer::open("roundtrip_filter", 4096).unwrap();
    for i in 0..10u32 {
        static_tracepoint(&buffer, &SITE, &[ArgValue::U32(i)]);
    }

    let mut sync = SyncTracebuffer::open(buffer.path()).unwrap();
    let filter = |tp: &clltk_decoder::Tracepoint| tp.msg().ends_with('7');
    let tp = sync.next(Some(&filter)).unwrap();
    assert_eq!(tp.msg(), "n=7");
    assert!(sync.next(Some(&filter)).is_none());
}
