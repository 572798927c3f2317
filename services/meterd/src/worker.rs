//! Per-gateway link worker and its shared state.
//!
//! Each configured gateway gets one [`LinkShared`] (the state both sides
//! touch) and one [`LinkWorker`] (the dedicated loop that owns the
//! transport). The worker appends decoded frames to the inbound buffer and
//! drains the outbound queue one frame per tick; the device manager is the
//! sole reader of the inbound buffer via its high-water mark.
//!
//! Buffer keys are `(epoch_secs, seq)` with the derived tuple order, so
//! within one link the key order is exactly arrival order and same-second
//! bursts stay self-consistent.

use crate::link::{LinkTransport, READ_TIMEOUT};
use gw_proto::{Frame, GW_TO_SERVER_PREFIX, Message, Provenance, SERVER_TO_GW_PREFIX};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Buffer entries older than this are evicted.
pub const PURGE_HORIZON_SECS: i64 = 600;
/// Purge runs every this many ticks.
const PURGE_EVERY_TICKS: u64 = 30;
/// Hard cap on buffered frames; oldest are dropped on overflow.
pub const DEFAULT_MAX_BUFFER: usize = 10_000;

/// Monotonically ordered key for the inbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferKey {
    pub epoch_secs: i64,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Up,
    Dark,
}

struct LinkInner {
    state: LinkState,
    last_seen: i64,
    outbound: VecDeque<String>,
    inbound: BTreeMap<BufferKey, Frame>,
    snapshot: Option<gw_proto::GatewaySnapshot>,
    next_seq: u64,
}

/// Per-link state shared between the worker and the device manager.
pub struct LinkShared {
    pub network_id: String,
    pub gateway_id: u8,
    pub uuid: String,
    pub label: String,
    max_buffer: usize,
    inner: Mutex<LinkInner>,
}

impl LinkShared {
    pub fn new(network_id: &str, gateway_id: u8, label: &str) -> Arc<Self> {
        Arc::new(LinkShared {
            network_id: network_id.to_owned(),
            gateway_id,
            uuid: format!("{}.{}", network_id, gateway_id),
            label: label.to_owned(),
            max_buffer: DEFAULT_MAX_BUFFER,
            inner: Mutex::new(LinkInner {
                state: LinkState::Init,
                last_seen: 0,
                outbound: VecDeque::new(),
                inbound: BTreeMap::new(),
                snapshot: None,
                next_seq: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkInner> {
        self.inner.lock().expect("link state lock poisoned")
    }

    /// Queue an outbound message for the next ticks.
    pub fn enqueue(&self, message: &Message) {
        self.enqueue_frame(gw_proto::encode(message));
    }

    pub fn enqueue_frame(&self, frame: String) {
        self.lock().outbound.push_back(frame);
    }

    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }

    fn pop_outbound(&self) -> Option<String> {
        self.lock().outbound.pop_front()
    }

    fn requeue_front(&self, frame: String) {
        self.lock().outbound.push_front(frame);
    }

    /// Append one decoded frame under a fresh key.
    pub fn push_inbound(&self, frame: Frame) -> BufferKey {
        let mut inner = self.lock();
        let key = BufferKey {
            epoch_secs: frame.provenance.when_received,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        inner.inbound.insert(key, frame);
        while inner.inbound.len() > self.max_buffer {
            if let Some((dropped, _)) = inner.inbound.pop_first() {
                tracing::warn!(gateway = %self.uuid, ?dropped, "inbound buffer over cap, dropping oldest");
            }
        }
        key
    }

    /// Copy every buffered frame with a key strictly greater than `after`,
    /// in key order.
    pub fn drain_after(&self, after: Option<BufferKey>) -> Vec<(BufferKey, Frame)> {
        let inner = self.lock();
        match after {
            Some(mark) => inner
                .inbound
                .range((
                    std::ops::Bound::Excluded(mark),
                    std::ops::Bound::Unbounded,
                ))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            None => inner.inbound.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }

    pub fn purge_older_than(&self, now: i64, horizon_secs: i64) -> usize {
        let mut inner = self.lock();
        let before = inner.inbound.len();
        inner.inbound.retain(|k, _| k.epoch_secs >= now - horizon_secs);
        before - inner.inbound.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    pub fn last_seen(&self) -> i64 {
        self.lock().last_seen
    }

    /// Stamp a successful decode: refresh `last_seen`, promote INIT to UP.
    pub fn mark_seen(&self, now: i64) {
        let mut inner = self.lock();
        inner.last_seen = now;
        if inner.state == LinkState::Init {
            inner.state = LinkState::Up;
        }
    }

    pub fn gateway_snapshot(&self) -> Option<gw_proto::GatewaySnapshot> {
        self.lock().snapshot.clone()
    }

    pub fn set_gateway_snapshot(&self, snapshot: gw_proto::GatewaySnapshot) {
        self.lock().snapshot = Some(snapshot);
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Owns one transport and runs the link loop until shutdown.
pub struct LinkWorker {
    transport: Box<dyn LinkTransport>,
    shared: Arc<LinkShared>,
    shutdown: Arc<AtomicBool>,
    ticks: u64,
}

impl LinkWorker {
    pub fn new(
        transport: Box<dyn LinkTransport>,
        shared: Arc<LinkShared>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        LinkWorker {
            transport,
            shared,
            shutdown,
            ticks: 0,
        }
    }

    /// One loop iteration: read at most one line, transmit at most one
    /// frame, purge on cadence.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.read_phase();
        self.write_phase();
        if self.ticks % PURGE_EVERY_TICKS == 0 {
            let now = now_epoch();
            let purged = self.shared.purge_older_than(now, PURGE_HORIZON_SECS);
            if purged > 0 {
                tracing::debug!(gateway = %self.shared.uuid, purged, "purged stale inbound frames");
            }
        }
    }

    fn read_phase(&mut self) {
        let line = match self.transport.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(gateway = %self.shared.uuid, error = %e, "link read failed");
                return;
            }
        };
        let line = line.trim();
        let Some(body) = line.strip_prefix(GW_TO_SERVER_PREFIX) else {
            // Console noise from the gateway firmware; not protocol.
            return;
        };
        let now = now_epoch();
        let provenance = Provenance::new(now, &self.shared.network_id, self.shared.gateway_id);
        let frame = match gw_proto::decode_frame(body, provenance) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(gateway = %self.shared.uuid, line, error = %e, "dropping malformed frame");
                return;
            }
        };
        self.shared.mark_seen(now);
        self.accept(frame, now);
    }

    /// Well-known housekeeping types are handled here; everything else is
    /// buffered for the device manager.
    fn accept(&mut self, frame: Frame, now: i64) {
        match &frame.message {
            Message::TimeRequest => {
                self.shared.enqueue(&Message::TimeSet { epoch_time: now });
                tracing::debug!(gateway = %self.shared.uuid, "time request answered");
            }
            Message::TimeSetAck => {
                tracing::debug!(gateway = %self.shared.uuid, "time sync acknowledged");
            }
            Message::TimeSetNack => {
                tracing::warn!(gateway = %self.shared.uuid, "time sync rejected by gateway");
            }
            Message::GatewaySnapshot(snapshot) => {
                self.shared.set_gateway_snapshot(snapshot.clone());
                self.shared.push_inbound(frame);
            }
            _ => {
                self.shared.push_inbound(frame);
            }
        }
    }

    fn write_phase(&mut self) {
        let Some(frame) = self.shared.pop_outbound() else {
            return;
        };
        let line = format!("{}{}", SERVER_TO_GW_PREFIX, frame);
        if let Err(e) = self.transport.write_line(&line) {
            // Transient write failure: keep the frame for the next tick.
            tracing::warn!(gateway = %self.shared.uuid, error = %e, "link write failed, frame requeued");
            self.shared.requeue_front(frame);
        }
    }

    /// Run until the shutdown flag is raised. The transport's read timeout
    /// paces the loop at roughly [`READ_TIMEOUT`] per idle tick.
    pub fn run(mut self) {
        tracing::info!(gateway = %self.shared.uuid, label = %self.shared.label, "link worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            let started = std::time::Instant::now();
            self.tick();
            if let Some(remaining) = READ_TIMEOUT.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        tracing::info!(gateway = %self.shared.uuid, "link worker stopped");
    }

    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        let name = format!("link-{}", self.shared.uuid);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .expect("spawn link worker thread")
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use gw_proto::MsgType;

    fn worker() -> (LinkWorker, crate::link::MemoryHandle, Arc<LinkShared>) {
        let (link, handle) = MemoryLink::new();
        let shared = LinkShared::new("9.9.9.99", 1, "Test Gateway");
        let worker = LinkWorker::new(
            Box::new(link),
            shared.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        (worker, handle, shared)
    }

    #[test]
    fn buffer_keys_order_matches_append_order() {
        let shared = LinkShared::new("9.9.9.99", 1, "gw");
        let frame = |t: i64| {
            gw_proto::decode_frame("NDARK;2,100", Provenance::new(t, "9.9.9.99", 1))
                .expect("frame decodes")
        };
        // Same second twice, then a later second.
        let k1 = shared.push_inbound(frame(1000));
        let k2 = shared.push_inbound(frame(1000));
        let k3 = shared.push_inbound(frame(1001));
        assert!(k1 < k2 && k2 < k3);

        let drained = shared.drain_after(None);
        let keys: Vec<BufferKey> = drained.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![k1, k2, k3]);

        let after_first = shared.drain_after(Some(k1));
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first[0].0, k2);
    }

    #[test]
    fn purge_evicts_only_stale_entries() {
        let shared = LinkShared::new("9.9.9.99", 1, "gw");
        let frame = |t: i64| {
            gw_proto::decode_frame("NDARK;2,100", Provenance::new(t, "9.9.9.99", 1))
                .expect("frame decodes")
        };
        shared.push_inbound(frame(1000));
        shared.push_inbound(frame(1500));
        let purged = shared.purge_older_than(1700, PURGE_HORIZON_SECS);
        assert_eq!(purged, 1);
        assert_eq!(shared.buffered_len(), 1);
    }

    #[test]
    fn gtime_is_answered_with_a_time_set() {
        let (mut worker, handle, shared) = worker();
        handle.push_incoming("G>S:GTIME\r\n");
        worker.tick();
        // Reply is enqueued and transmitted within the same tick's write
        // phase; one more tick is the contract's upper bound.
        worker.tick();
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("S>G:STIME;"), "got '{}'", sent[0]);
        // Housekeeping traffic is not buffered for the device manager.
        assert_eq!(shared.buffered_len(), 0);
        assert_eq!(shared.state(), LinkState::Up);
    }

    #[test]
    fn garbled_lines_leave_state_alone_and_worker_up() {
        let (mut worker, handle, shared) = worker();
        handle.push_incoming("G>S:MREB;2,MREB,1000,500\r\n");
        worker.tick();
        assert_eq!(shared.state(), LinkState::Up);
        assert_eq!(shared.buffered_len(), 1);

        for line in [
            "G>S:CRAP\r\n",
            "G>S:MUP_;2,MUP_,DEBUG:\r\n",
            "G>S:MUP_;2,MUP_,1496842913428,18829393;15,1;16\r\n",
            "not even prefixed\r\n",
        ] {
            handle.push_incoming(line);
            worker.tick();
        }
        assert_eq!(shared.buffered_len(), 1, "garbage must not be buffered");
        assert_eq!(shared.state(), LinkState::Up);
    }

    #[test]
    fn valid_frames_are_buffered_with_provenance() {
        let (mut worker, handle, shared) = worker();
        handle.push_incoming("G>S:MUP_;2,MUP_,1496842913428,18829393;15,1;15,5;15,2;16,3;\r\n");
        worker.tick();
        let drained = shared.drain_after(None);
        assert_eq!(drained.len(), 1);
        let frame = &drained[0].1;
        assert_eq!(frame.msg_type, MsgType::MeterUpdate);
        assert_eq!(frame.provenance.gateway_uuid, "9.9.9.99.1");
        assert_eq!(frame.detail_count, 4);
    }

    #[test]
    fn failed_write_requeues_the_frame_in_order() {
        let (mut worker, handle, shared) = worker();
        shared.enqueue(&Message::GatewaySnapshotRequest);
        shared.enqueue(&Message::NodeSnapshotRequest { node_id: 254 });

        handle.set_fail_writes(true);
        worker.tick();
        assert_eq!(shared.outbound_len(), 2, "nothing is dropped on write failure");

        handle.set_fail_writes(false);
        worker.tick();
        worker.tick();
        let sent = handle.take_sent();
        assert_eq!(
            sent,
            vec![
                "S>G:GGWSNAP".to_owned(),
                "S>G:GNOSNAP;254".to_owned(),
            ],
            "order preserved across the failed tick"
        );
    }

    #[test]
    fn gwsnap_updates_cache_and_is_still_buffered() {
        let (mut worker, handle, shared) = worker();
        handle.push_incoming(
            "G>S:GWSNAP;1,1483228800,500,1483228900,DEBUG,CHANGE_ME_PLEASE,9.9.9.99,-3\r\n",
        );
        worker.tick();
        let cached = shared.gateway_snapshot().expect("snapshot cached");
        assert_eq!(cached.free_ram, 500);
        assert_eq!(shared.buffered_len(), 1);
    }
}
