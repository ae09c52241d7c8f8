// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Asynchronous availability tracking, delivered as messages.
// Add/remove notifications from the surrounding framework are posted into a
// queue and consumed by a dedicated loop thread; stopping the tracker is
// itself a message, so the stop-completion callback is guaranteed to run
// after the last add/remove event has been delivered.

use std::io;
use std::sync::mpsc::{channel, Sender};
use std::thread;

/// An availability change for a tracked collaborator.
pub enum TrackingEvent<T> {
    Added(T),
    Removed(T),
}

enum Msg<T> {
    Event(TrackingEvent<T>),
    Stop(Box<dyn FnOnce() + Send>),
}

/// Posting side of a tracker: cloneable, held by the framework glue that
/// observes availability changes. Events posted after the tracker stopped
/// are dropped.
pub struct TrackerHandle<T> {
    tx: Sender<Msg<T>>,
}

impl<T> Clone for TrackerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> TrackerHandle<T> {
    /// Post an added-notification. Returns whether the tracker still runs.
    pub fn post_added(&self, value: T) -> bool {
        self.tx.send(Msg::Event(TrackingEvent::Added(value))).is_ok()
    }

    /// Post a removed-notification. Returns whether the tracker still runs.
    pub fn post_removed(&self, value: T) -> bool {
        self.tx
            .send(Msg::Event(TrackingEvent::Removed(value)))
            .is_ok()
    }
}

/// A tracking loop delivering availability events to one listener.
///
/// The listener runs on the tracker's own thread; whatever it captures is
/// dropped there once the loop quiesces, which is what lets owners tear
/// themselves down only after no further callback can be in flight.
pub struct Tracker<T> {
    tx: Sender<Msg<T>>,
}

impl<T: Send + 'static> Tracker<T> {
    /// Spawn the tracking loop with `listener` as the event consumer.
    pub fn start<L>(listener: L) -> io::Result<Self>
    where
        L: FnMut(TrackingEvent<T>) + Send + 'static,
    {
        let (tx, rx) = channel::<Msg<T>>();
        thread::Builder::new()
            .name("rsa-shm-tracker".to_string())
            .spawn(move || {
                let mut listener = listener;
                while let Ok(msg) = rx.recv() {
                    match msg {
                        Msg::Event(ev) => listener(ev),
                        Msg::Stop(done) => {
                            done();
                            break;
                        }
                    }
                }
                // listener drops here, on the loop thread
            })?;
        Ok(Self { tx })
    }

    /// Posting handle for the framework side.
    pub fn handle(&self) -> TrackerHandle<T> {
        TrackerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop tracking asynchronously.
    ///
    /// `done` runs on the loop thread strictly after every event posted
    /// before this call has been delivered, and no event is delivered after
    /// it. Safe to call more than once; later stops are ignored.
    pub fn stop(&self, done: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Msg::Stop(Box::new(done)));
    }
}

impl<T> Drop for Tracker<T> {
    fn drop(&mut self) {
        // Make sure the loop thread exits even when stop() was never called.
        let _ = self.tx.send(Msg::Stop(Box::new(|| {})));
    }
}
