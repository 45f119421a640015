//! Pipe topology controller
//!
//! Tracks the attached consumers, keeps the discard sink engaged whenever an
//! active session has nobody listening, caches the latest frame and fans every
//! frame out. Attach, detach and fan-out all take the same lock, so a consumer
//! swap can never land in the middle of a delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::capture::FrameEvent;
use crate::pipeline::connection::SessionId;
use crate::Metrics;

pub type ConsumerId = u64;

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    /// No connection, frames are not flowing
    Idle,
    /// Connection open, nobody attached, discard sink draining
    Draining,
    /// Connection open, at least one consumer attached
    Streaming,
}

/// Outcome of publishing one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame came from a session that is no longer active and was ignored
    Stale,
    /// No consumer attached; the discard sink absorbed it
    Discarded,
    /// Handed to `consumers` subscriptions, `dropped` of which were full
    Delivered { consumers: usize, dropped: usize },
}

/// Sink that accepts and forgets frames so decoding never stalls
#[derive(Debug, Default)]
pub struct DiscardSink {
    absorbed: AtomicU64,
}

impl DiscardSink {
    fn absorb(&self, frame: FrameEvent) {
        self.absorbed.fetch_add(1, Ordering::Relaxed);
        drop(frame);
    }

    pub fn absorbed(&self) -> u64 {
        self.absorbed.load(Ordering::Relaxed)
    }
}

struct Consumer {
    id: ConsumerId,
    tx: Sender<FrameEvent>,
}

#[derive(Default)]
struct Pipes {
    session: Option<SessionId>,
    consumers: Vec<Consumer>,
    next_consumer: ConsumerId,
}

impl Pipes {
    fn state(&self) -> TopologyState {
        match (self.session, self.consumers.is_empty()) {
            (None, _) => TopologyState::Idle,
            (Some(_), true) => TopologyState::Draining,
            (Some(_), false) => TopologyState::Streaming,
        }
    }
}

pub struct Topology {
    source_name: Arc<str>,
    consumer_buffer: usize,
    pipes: Mutex<Pipes>,
    latest: ArcSwapOption<FrameEvent>,
    discard: DiscardSink,
    metrics: Arc<Metrics>,
}

impl Topology {
    pub fn new(source_name: Arc<str>, consumer_buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            source_name,
            consumer_buffer: consumer_buffer.max(1),
            pipes: Mutex::new(Pipes::default()),
            latest: ArcSwapOption::empty(),
            discard: DiscardSink::default(),
            metrics,
        }
    }

    pub fn source_name(&self) -> &Arc<str> {
        &self.source_name
    }

    pub fn state(&self) -> TopologyState {
        self.pipes.lock().state()
    }

    pub fn is_active(&self) -> bool {
        self.pipes.lock().session.is_some()
    }

    /// True exactly when a session is active and no consumer is attached
    pub fn using_discard_sink(&self) -> bool {
        self.state() == TopologyState::Draining
    }

    pub fn consumer_count(&self) -> usize {
        self.pipes.lock().consumers.len()
    }

    pub fn discard_sink(&self) -> &DiscardSink {
        &self.discard
    }

    /// Most recently observed frame
    pub fn latest(&self) -> Option<Arc<FrameEvent>> {
        self.latest.load_full()
    }

    /// Begin routing frames from `session`
    pub fn activate(&self, session: SessionId) {
        let mut pipes = self.pipes.lock();
        pipes.session = Some(session);
        debug!(camera = %self.source_name, session, state = ?pipes.state(), "Topology activated");
    }

    /// Back to idle; drops every attachment. The cached frame survives.
    #[cfg(test)]
    pub(crate) fn deactivate(&self) {
        let mut pipes = self.pipes.lock();
        let detached = pipes.consumers.len();
        pipes.session = None;
        pipes.consumers.clear();
        debug!(camera = %self.source_name, detached, "Topology deactivated");
    }

    /// Deactivate only if `session` is still the active one
    pub fn deactivate_session(&self, session: SessionId) -> bool {
        let mut pipes = self.pipes.lock();
        if pipes.session != Some(session) {
            return false;
        }
        pipes.session = None;
        pipes.consumers.clear();
        debug!(camera = %self.source_name, session, "Topology deactivated by session end");
        true
    }

    /// Drop attachments made while idle; no-op once a session is active
    pub fn clear_idle(&self) -> bool {
        let mut pipes = self.pipes.lock();
        if pipes.session.is_some() {
            return false;
        }
        pipes.consumers.clear();
        true
    }

    /// Attach a new consumer with the default buffer
    pub fn attach(self: &Arc<Self>) -> Subscription {
        self.attach_with_buffer(self.consumer_buffer)
    }

    pub fn attach_with_buffer(self: &Arc<Self>, buffer: usize) -> Subscription {
        let (tx, rx) = flume::bounded(buffer.max(1));
        let mut pipes = self.pipes.lock();
        pipes.next_consumer += 1;
        let id = pipes.next_consumer;
        pipes.consumers.push(Consumer { id, tx });
        debug!(
            camera = %self.source_name,
            consumer = id,
            consumers = pipes.consumers.len(),
            state = ?pipes.state(),
            "Consumer attached"
        );

        Subscription {
            id,
            rx,
            topology: Arc::downgrade(self),
        }
    }

    pub fn detach(&self, id: ConsumerId) -> bool {
        let mut pipes = self.pipes.lock();
        let before = pipes.consumers.len();
        pipes.consumers.retain(|consumer| consumer.id != id);
        let removed = pipes.consumers.len() != before;
        if removed {
            debug!(
                camera = %self.source_name,
                consumer = id,
                consumers = pipes.consumers.len(),
                state = ?pipes.state(),
                "Consumer detached"
            );
        }
        removed
    }

    /// Stamp and cache a frame without fanning it out
    pub fn record(&self, frame: FrameEvent) -> FrameEvent {
        let frame = frame.stamped(&self.source_name);
        self.latest.store(Some(Arc::new(frame.clone())));
        frame
    }

    /// Cache the frame, then deliver it to every attached consumer (or the discard sink)
    pub fn publish(&self, session: SessionId, frame: FrameEvent) -> Delivery {
        let mut pipes = self.pipes.lock();
        if pipes.session != Some(session) {
            trace!(camera = %self.source_name, session, "Ignoring frame from inactive session");
            return Delivery::Stale;
        }

        let frame = self.record(frame);
        self.metrics.frame_published();

        if pipes.consumers.is_empty() {
            self.discard.absorb(frame);
            self.metrics.frame_discarded();
            return Delivery::Discarded;
        }

        let mut dropped = 0;
        pipes.consumers.retain(|consumer| match consumer.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(consumer = consumer.id, "Consumer went away; detaching");
                false
            }
        });
        self.metrics.frames_dropped(dropped as u64);

        // Everyone left between frames: this one still has to drain somewhere
        if pipes.consumers.is_empty() {
            self.discard.absorb(frame);
            self.metrics.frame_discarded();
            return Delivery::Discarded;
        }

        Delivery::Delivered {
            consumers: pipes.consumers.len(),
            dropped,
        }
    }
}

/// Handle for one attached consumer. Dropping it detaches.
pub struct Subscription {
    id: ConsumerId,
    rx: Receiver<FrameEvent>,
    topology: Weak<Topology>,
}

impl Subscription {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next frame, or `None` once detached or the camera stops
    pub async fn recv(&self) -> Option<FrameEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<FrameEvent> {
        self.rx.try_recv().ok()
    }

    pub fn stream(&self) -> flume::r#async::RecvStream<'_, FrameEvent> {
        self.rx.stream()
    }

    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(topology) = self.topology.upgrade() {
            topology.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SESSION: SessionId = 7;

    fn topology() -> Arc<Topology> {
        Arc::new(Topology::new(
            Arc::from("camX"),
            8,
            Arc::new(Metrics::new("camX")),
        ))
    }

    fn frame(n: u8) -> FrameEvent {
        FrameEvent::new(Bytes::from(vec![0xFF, 0xD8, n, 0xFF, 0xD9]))
    }

    fn assert_invariant(topology: &Topology) {
        let expected = topology.is_active() && topology.consumer_count() == 0;
        assert_eq!(topology.using_discard_sink(), expected);
    }

    #[test]
    fn state_follows_attachments() {
        let topology = topology();
        assert_eq!(topology.state(), TopologyState::Idle);
        assert_invariant(&topology);

        topology.activate(SESSION);
        assert_eq!(topology.state(), TopologyState::Draining);
        assert_invariant(&topology);

        let a = topology.attach();
        let b = topology.attach();
        assert_eq!(topology.state(), TopologyState::Streaming);
        assert_invariant(&topology);

        a.detach();
        assert_eq!(topology.state(), TopologyState::Streaming);
        drop(b);
        assert_eq!(topology.state(), TopologyState::Draining);
        assert_invariant(&topology);

        topology.deactivate();
        assert_eq!(topology.state(), TopologyState::Idle);
        assert_invariant(&topology);
    }

    #[test]
    fn discard_invariant_holds_for_arbitrary_sequences() {
        let topology = topology();
        let mut held = Vec::new();
        // Deterministic pseudo-random walk of attach/detach/activate/deactivate
        let mut seed = 0x2545_f491_u32;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 7 {
                0 | 1 | 2 => held.push(topology.attach()),
                3 | 4 => {
                    if !held.is_empty() {
                        let idx = seed as usize % held.len();
                        held.swap_remove(idx).detach();
                    }
                }
                5 => topology.activate(SESSION),
                _ => {
                    topology.deactivate();
                    held.clear();
                }
            }
            assert_invariant(&topology);
        }
    }

    #[test]
    fn swap_never_loses_or_duplicates_frames() {
        let topology = topology();
        topology.activate(SESSION);

        let steady = topology.attach_with_buffer(64);
        let mut flapping: Option<Subscription> = None;
        let mut expected_flapping = Vec::new();
        let mut received_flapping = Vec::new();

        for n in 0..40u8 {
            if n % 2 == 0 {
                flapping = Some(topology.attach_with_buffer(64));
            } else if let Some(sub) = flapping.take() {
                while let Some(frame) = sub.try_recv() {
                    received_flapping.push(frame.data[2]);
                }
                sub.detach();
            }

            if flapping.is_some() {
                expected_flapping.push(n);
            }
            topology.publish(SESSION, frame(n));
        }

        let steady_frames: Vec<u8> = std::iter::from_fn(|| steady.try_recv())
            .map(|f| f.data[2])
            .collect();
        assert_eq!(steady_frames, (0..40).collect::<Vec<u8>>());
        assert_eq!(received_flapping, expected_flapping);
    }

    #[test]
    fn discard_sink_only_absorbs_unwatched_frames() {
        let topology = topology();
        topology.activate(SESSION);

        assert_eq!(topology.publish(SESSION, frame(1)), Delivery::Discarded);
        let a = topology.attach();
        assert_eq!(
            topology.publish(SESSION, frame(2)),
            Delivery::Delivered { consumers: 1, dropped: 0 }
        );
        a.detach();
        assert_eq!(topology.publish(SESSION, frame(3)), Delivery::Discarded);

        assert_eq!(topology.discard_sink().absorbed(), 2);
    }

    #[test]
    fn latest_frame_tracks_last_publish_regardless_of_consumers() {
        let topology = topology();
        topology.activate(SESSION);
        let _a = topology.attach();
        let _b = topology.attach();

        for n in 0..5 {
            topology.publish(SESSION, frame(n));
        }

        let latest = topology.latest().unwrap();
        assert_eq!(latest.data[2], 4);
        assert_eq!(latest.source_name(), Some("camX"));
    }

    #[test]
    fn frames_from_stale_sessions_are_ignored() {
        let topology = topology();
        topology.activate(SESSION);
        let a = topology.attach();
        topology.deactivate();

        assert_eq!(topology.publish(SESSION, frame(1)), Delivery::Stale);
        topology.activate(SESSION + 1);
        assert_eq!(topology.publish(SESSION, frame(2)), Delivery::Stale);

        assert!(topology.latest().is_none());
        assert!(a.try_recv().is_none());
        assert!(!topology.deactivate_session(SESSION));
        assert!(topology.deactivate_session(SESSION + 1));
    }

    #[test]
    fn slow_consumer_misses_frames_without_blocking() {
        let topology = topology();
        topology.activate(SESSION);
        let slow = topology.attach_with_buffer(1);
        let fast = topology.attach_with_buffer(16);

        for n in 0..4 {
            topology.publish(SESSION, frame(n));
        }

        assert_eq!(slow.try_recv().unwrap().data[2], 0);
        assert!(slow.try_recv().is_none());
        assert_eq!(std::iter::from_fn(|| fast.try_recv()).count(), 4);
        assert_eq!(topology.metrics.snapshot().frames_dropped, 3);
    }

    #[test]
    fn vanished_receiver_is_detached_and_frame_drains() {
        let topology = topology();
        topology.activate(SESSION);
        let sub = topology.attach();
        let id = sub.id();
        // Receiver goes away without the explicit detach running
        drop(disarm(sub));

        assert_eq!(topology.publish(SESSION, frame(9)), Delivery::Discarded);
        assert!(!topology.detach(id));
        assert_eq!(topology.state(), TopologyState::Draining);
    }

    fn disarm(mut sub: Subscription) -> Subscription {
        sub.topology = Weak::new();
        sub
    }

    #[test]
    fn deactivate_keeps_cached_frame_and_ends_subscriptions() {
        let topology = topology();
        topology.activate(SESSION);
        let a = topology.attach();
        topology.publish(SESSION, frame(3));
        assert!(a.try_recv().is_some());

        topology.deactivate();

        assert_eq!(topology.latest().unwrap().data[2], 3);
        assert_eq!(topology.consumer_count(), 0);
        assert!(a.rx.is_disconnected());
    }
}
