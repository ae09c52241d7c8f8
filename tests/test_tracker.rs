// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors

use std::sync::mpsc::channel;
use std::time::Duration;

use rsa_shm::tracker::{Tracker, TrackingEvent};

#[test]
fn events_are_delivered_in_order() {
    let (tx, rx) = channel();
    let tracker = Tracker::start(move |ev| {
        let tagged = match ev {
            TrackingEvent::Added(v) => format!("+{v}"),
            TrackingEvent::Removed(v) => format!("-{v}"),
        };
        tx.send(tagged).unwrap();
    })
    .unwrap();

    let handle = tracker.handle();
    assert!(handle.post_added(1));
    assert!(handle.post_added(2));
    assert!(handle.post_removed(1));

    let timeout = Duration::from_secs(5);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), "+1");
    assert_eq!(rx.recv_timeout(timeout).unwrap(), "+2");
    assert_eq!(rx.recv_timeout(timeout).unwrap(), "-1");
}

#[test]
fn stop_completion_runs_after_pending_events() {
    let (ev_tx, ev_rx) = channel();
    let tracker = Tracker::start(move |ev| {
        if let TrackingEvent::Added(v) = ev {
            ev_tx.send(v).unwrap();
        }
    })
    .unwrap();

    let handle = tracker.handle();
    for i in 0..100 {
        handle.post_added(i);
    }

    let (done_tx, done_rx) = channel();
    tracker.stop(move || {
        done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Every event posted before stop() was delivered first.
    let seen: Vec<i32> = ev_rx.try_iter().collect();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn events_after_stop_are_dropped() {
    let (ev_tx, ev_rx) = channel();
    let tracker = Tracker::start(move |ev| {
        if let TrackingEvent::Added(v) = ev {
            ev_tx.send(v).unwrap();
        }
    })
    .unwrap();

    let handle = tracker.handle();
    let (done_tx, done_rx) = channel();
    tracker.stop(move || {
        done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The loop has quiesced; later posts go nowhere.
    handle.post_added(7);
    assert!(ev_rx
        .recv_timeout(Duration::from_millis(100))
        .is_err());
}
