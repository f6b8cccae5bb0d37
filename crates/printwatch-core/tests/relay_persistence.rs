// File-backed relay behavior: sequences and cursors must survive
// closing and reopening the database, since the writer and the tailer
// live in different processes.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use printwatch_core::model::{Event, Payload};
use printwatch_core::relay::{EventRelay, RelayRetention};

fn event(n: u64) -> Event {
    Event::new(
        "printer.state_changed",
        "p1",
        Payload::new().set("n", n).build(),
    )
}

#[test]
fn cursor_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.db");

    let mut cursor = 0;
    {
        let relay = EventRelay::open(&path).expect("open");
        for n in 0..5 {
            relay.append(&event(n)).expect("append");
        }
        let batch = relay.read_after(cursor, 3).expect("read");
        cursor = batch.last().expect("records").sequence;
    }

    // A fresh handle on the same file picks up where the cursor left
    // off, with no gap and no repeat.
    let relay = EventRelay::open(&path).expect("reopen");
    let rest = relay.read_after(cursor, 100).expect("read rest");
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].sequence, cursor + 1);

    // New appends continue the same sequence run.
    let seq = relay.append(&event(99)).expect("append after reopen");
    assert_eq!(seq, rest.last().expect("rest").sequence + 1);
}

#[test]
fn two_handles_on_one_file_share_the_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.db");

    let writer = Arc::new(EventRelay::open(&path).expect("writer"));
    let reader = EventRelay::open(&path).expect("reader");

    writer.append(&event(1)).expect("append");
    writer.append(&event(2)).expect("append");

    let seen = reader.read_after(0, 10).expect("read");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].payload["n"], 1);
}

#[test]
fn prune_on_disk_keeps_cursor_contiguity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let relay = EventRelay::open(&path).expect("open");

    for n in 0..10 {
        relay.append(&event(n)).expect("append");
    }
    relay
        .prune(&RelayRetention {
            max_age: Duration::from_secs(3600),
            max_rows: 4,
        })
        .expect("prune");

    let remaining = relay.read_after(0, 100).expect("read");
    let seqs: Vec<i64> = remaining.iter().map(|r| r.sequence).collect();
    assert_eq!(seqs, vec![7, 8, 9, 10]);
}
