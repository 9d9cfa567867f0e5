use std::sync::Arc;
use std::time::Duration;

use super::ordered_buffer::OrderedBuffer;
use super::tracepoint::Tracepoint;

fn tp(timestamp_ns: u64) -> Tracepoint {
    Tracepoint::new_virtual(Arc::from("test"), timestamp_ns, format!("ts {timestamp_ns}"))
}

fn timestamps(tps: &[Tracepoint]) -> Vec<u64> {
    tps.iter().map(|t| t.timestamp_ns).collect()
}

#[test]
fn watermark_releases_only_old_enough_entries() {
    let buffer = OrderedBuffer::new(0, 20);
    for ts in [100, 50, 120, 80] {
        buffer.push(tp(ts));
    }
    buffer.update_watermark(120);

    // Threshold is 120 - 20 = 100: everything up to 100 drains sorted,
    // 120 stays buffered.
    let ready = buffer.pop_all_ready();
    assert_eq!(timestamps(&ready), vec![50, 80, 100]);
    assert_eq!(buffer.len(), 1);

    buffer.update_watermark(141);
    let rest = buffer.pop_all_ready();
    assert_eq!(timestamps(&rest), vec![120]);
    assert!(buffer.is_empty());
}

#[test]
fn finish_flushes_everything_in_order() {
    let buffer = OrderedBuffer::new(0, 1_000_000);
    for ts in [5, 3, 9, 1] {
        buffer.push(tp(ts));
    }
    assert!(buffer.pop_all_ready().is_empty());

    buffer.finish();
    let flushed = buffer.pop_all_ready();
    assert_eq!(timestamps(&flushed), vec![1, 3, 5, 9]);
    assert!(buffer.finished());
}

#[test]
fn finish_is_idempotent() {
    let buffer = OrderedBuffer::new(0, 0);
    buffer.finish();
    buffer.finish();
    assert!(buffer.finished());
}

#[test]
fn overflow_drops_the_oldest() {
    let buffer = OrderedBuffer::new(3, 0);
    for ts in [10, 20, 30, 40] {
        buffer.push(tp(ts));
    }
    let stats = buffer.stats();
    assert_eq!(stats.total_pushed, 4);
    assert_eq!(stats.total_dropped, 1);
    assert_eq!(stats.current_size, 3);

    buffer.finish();
    // Timestamp 10 was sacrificed for 40.
    assert_eq!(timestamps(&buffer.pop_all_ready()), vec![20, 30, 40]);
}

#[test]
fn equal_timestamps_keep_arrival_order() {
    let buffer = OrderedBuffer::new(0, 0);
    for (ts, msg) in [(7, "first"), (7, "second"), (7, "third")] {
        buffer.push(Tracepoint::new_virtual(Arc::from("t"), ts, msg.to_owned()));
    }
    buffer.finish();
    let msgs: Vec<String> = buffer
        .pop_all_ready()
        .iter()
        .map(|t| t.msg().to_owned())
        .collect();
    assert_eq!(msgs, vec!["first", "second", "third"]);
}

#[test]
fn pop_times_out_when_nothing_is_ready() {
    let buffer = OrderedBuffer::new(0, 1_000);
    buffer.push(tp(500));
    // Watermark never moves, so the entry is held back.
    assert!(buffer.pop(Duration::from_millis(20)).is_none());
}

#[test]
fn pop_wakes_on_watermark() {
    let buffer = Arc::new(OrderedBuffer::new(0, 10));
    buffer.push(tp(100));

    let waiter = {
        let buffer = Arc::clone(&buffer);
        std::thread::spawn(move || buffer.pop(Duration::from_secs(5)))
    };
    std::thread::sleep(Duration::from_millis(20));
    buffer.update_watermark(200);
    let got = waiter.join().unwrap();
    assert_eq!(got.map(|t| t.timestamp_ns), Some(100));
}

#[test]
fn stats_track_the_high_water_mark() {
    let buffer = OrderedBuffer::new(0, 0);
    for ts in 0..5 {
        buffer.push(tp(ts));
    }
    buffer.finish();
    let _ = buffer.pop_all_ready();
    let stats = buffer.stats();
    assert_eq!(stats.high_water_mark, 5);
    assert_eq!(stats.total_popped, 5);
    assert_eq!(stats.current_size, 0);
}
