//! The write gate: reads issued after a write observe that write.
//!
//! All gated traffic of one controller funnels through a
//! [`CausalityController`]. A write marks the controller `Dirty`; the next
//! write cycle that carries it moves it to `PendingRead`; the read cycle
//! after that returns it to `Idle`. Reads wait for `Idle`, so whatever they
//! return was read back from the device after the write went out.
//!
//! Lock order is fixed: the write-serialization lock, then the callback
//! lock. The callback lock is the only one ever waited on. Segment locks are
//! leaves.

use std::{sync::Arc, thread};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::link::{
    error::Result,
    helpers::{REGISTER_SPACE, range_span},
    lifecycle::ArmingCell,
    transport::{CycleEvents, SegmentId, Transport},
};

/// Progress of the most recent gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Idle,
    /// Queued, not yet carried by a write cycle.
    Dirty,
    /// Written; waiting for a read cycle to observe it.
    PendingRead,
}

/// What happened to a gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WriteOutcome {
    Queued,
    /// The device was not armed and running; nothing was sent.
    Discarded,
}

impl WriteOutcome {
    pub fn is_queued(self) -> bool {
        self == WriteOutcome::Queued
    }
}

/// What a gated read returned.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum ReadOutcome {
    /// Bytes read back after every earlier gated write.
    Fresh(Vec<u8>),
    /// The device was not armed and running; zero-filled.
    Unavailable(Vec<u8>),
}

impl ReadOutcome {
    pub fn is_fresh(&self) -> bool {
        matches!(self, ReadOutcome::Fresh(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            ReadOutcome::Fresh(bytes) | ReadOutcome::Unavailable(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ReadOutcome::Fresh(bytes) | ReadOutcome::Unavailable(bytes) => bytes,
        }
    }
}

struct Gate {
    status: WriteStatus,
    read_completions: u64,
    waiters: usize,
    running: bool,
}

pub struct CausalityController {
    arming: Arc<ArmingCell>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    serialize: Mutex<()>,
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl CausalityController {
    pub fn new(arming: Arc<ArmingCell>) -> Self {
        Self {
            arming,
            transport: RwLock::new(None),
            serialize: Mutex::new(()),
            gate: Mutex::new(Gate {
                status: WriteStatus::Idle,
                read_completions: 0,
                waiters: 0,
                running: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn arming(&self) -> &Arc<ArmingCell> {
        &self.arming
    }

    pub fn is_armed(&self) -> bool {
        self.arming.is_armed()
    }

    pub(crate) fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
        self.gate.lock().status = WriteStatus::Idle;
    }

    pub(crate) fn detach(&self) -> Option<Arc<dyn Transport>> {
        self.transport.write().take()
    }

    /// Transport currently attached, if any.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub fn write_status(&self) -> WriteStatus {
        self.gate.lock().status
    }

    pub fn read_completion_count(&self) -> u64 {
        self.gate.lock().read_completions
    }

    pub fn waiter_count(&self) -> usize {
        self.gate.lock().waiters
    }

    fn is_write_capable(&self, gate: &Gate) -> bool {
        gate.running && self.arming.is_armed()
    }

    /// Waits for one notification. Returns whether the polling task is
    /// still running.
    fn wait_for_callback(&self, gate: &mut MutexGuard<'_, Gate>) -> bool {
        gate.waiters += 1;
        if gate.running {
            self.changed.wait(gate);
        }
        gate.waiters -= 1;
        gate.running
    }

    /// Blocks while `blocked` holds, giving up once the device is no longer
    /// armed or the polling task stopped.
    fn wait_while(&self, gate: &mut MutexGuard<'_, Gate>, blocked: impl Fn(&Gate) -> bool) {
        while blocked(gate) {
            if !self.arming.is_armed() || !self.wait_for_callback(gate) {
                break;
            }
        }
    }

    /// Waits out a write still in flight, then hands back the transport if
    /// it can take another. Callers hold the serialization lock.
    fn capable_transport(&self) -> Option<Arc<dyn Transport>> {
        let mut gate = self.gate.lock();
        self.wait_while(&mut gate, |g| g.status == WriteStatus::Dirty);
        if self.is_write_capable(&gate) {
            self.transport()
        } else {
            None
        }
    }

    // Runs after the bytes are staged, so any `write_completed` seen while
    // Dirty comes from a cycle that carried them.
    fn mark_dirty(&self) -> WriteOutcome {
        let mut gate = self.gate.lock();
        if self.is_write_capable(&gate) {
            gate.status = WriteStatus::Dirty;
            WriteOutcome::Queued
        } else {
            WriteOutcome::Discarded
        }
    }

    /// Queues `bytes` at `addr` once any earlier write has been carried.
    ///
    /// The range must lie within the transport's header and window;
    /// anything else is `OutOfBounds`.
    pub fn write(&self, addr: u8, bytes: &[u8]) -> Result<WriteOutcome> {
        range_span::<REGISTER_SPACE>(addr, bytes.len())?;

        let _serial = self.serialize.lock();
        let Some(transport) = self.capable_transport() else {
            tracing::trace!(addr, len = bytes.len(), "write discarded; device unavailable");
            return Ok(WriteOutcome::Discarded);
        };
        transport.write(addr, bytes)?;
        Ok(self.mark_dirty())
    }

    pub fn write8(&self, addr: u8, value: u8) -> Result<WriteOutcome> {
        self.write(addr, &[value])
    }

    /// Reads `len` bytes at `addr` once every earlier write has been read
    /// back from the device.
    pub fn read(&self, addr: u8, len: usize) -> Result<ReadOutcome> {
        range_span::<REGISTER_SPACE>(addr, len)?;

        let _serial = self.serialize.lock();
        let mut gate = self.gate.lock();
        self.wait_while(&mut gate, |g| g.status != WriteStatus::Idle);

        let transport = self.transport();
        match transport {
            Some(transport) if self.is_write_capable(&gate) && gate.status == WriteStatus::Idle => {
                Ok(ReadOutcome::Fresh(transport.read(addr, len)?))
            }
            _ => {
                tracing::trace!(addr, len, "read abandoned; device unavailable");
                Ok(ReadOutcome::Unavailable(vec![0; len]))
            }
        }
    }

    pub fn read8(&self, addr: u8) -> Result<u8> {
        Ok(self.read(addr, 1)?.bytes()[0])
    }

    /// Ungated read of the most recent cycle's bytes.
    ///
    /// For cycle callbacks: they run on the polling thread, so a gated read
    /// there would wait on a cycle that can never come.
    pub fn peek(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
        match self.transport() {
            Some(transport) => transport.read(addr, len),
            None => {
                range_span::<REGISTER_SPACE>(addr, len)?;
                Ok(vec![0; len])
            }
        }
    }

    /// Bytes most recently staged for writing.
    pub fn read_from_write_cache(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
        match self.transport() {
            Some(transport) => transport.read_from_write_cache(addr, len),
            None => {
                range_span::<REGISTER_SPACE>(addr, len)?;
                Ok(vec![0; len])
            }
        }
    }

    /// Copies `bytes` into a segment's write buffer through the gate, queues
    /// the segment, and waits for the read cycle after it.
    pub fn write_segment(&self, id: SegmentId, bytes: &[u8]) -> Result<WriteOutcome> {
        let outcome = {
            let _serial = self.serialize.lock();
            match self.capable_transport() {
                Some(transport) => {
                    let segment = transport.segment(id)?;
                    segment.with_write_buffer(|buf| {
                        let n = buf.len().min(bytes.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                    });
                    transport.queue_segment_write(id)?;
                    self.mark_dirty()
                }
                None => WriteOutcome::Discarded,
            }
        };
        if outcome.is_queued() {
            self.wait_for_next_read_completed();
        }
        Ok(outcome)
    }

    /// Blocks until one more read cycle completes. Returns `false` without
    /// waiting it out if the device is not armed or the polling task stops.
    pub fn wait_for_next_read_completed(&self) -> bool {
        let mut gate = self.gate.lock();
        let target = gate.read_completions + 1;
        while gate.read_completions < target {
            if !self.arming.is_armed() || !self.wait_for_callback(&mut gate) {
                return false;
            }
        }
        true
    }

    /// Skips physical reads while set; cycles still complete.
    pub fn suppress_reads(&self, suppress: bool) {
        if let Some(transport) = self.transport() {
            transport.suppress_reads(suppress);
        }
    }
}

impl CycleEvents for CausalityController {
    fn startup_complete(&self) {
        let mut gate = self.gate.lock();
        gate.running = true;
        gate.status = WriteStatus::Idle;
    }

    fn write_completed(&self) {
        let mut gate = self.gate.lock();
        if gate.status == WriteStatus::Dirty {
            gate.status = WriteStatus::PendingRead;
        }
        self.changed.notify_all();
    }

    fn read_completed(&self) {
        let mut gate = self.gate.lock();
        if gate.status == WriteStatus::PendingRead {
            gate.status = WriteStatus::Idle;
        }
        gate.read_completions += 1;
        self.changed.notify_all();
    }

    fn shutdown_complete(&self) {
        {
            let mut gate = self.gate.lock();
            gate.running = false;
            gate.status = WriteStatus::Idle;
            self.changed.notify_all();
        }
        while self.gate.lock().waiters > 0 {
            thread::yield_now();
        }
    }
}

impl core::fmt::Debug for CausalityController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let gate = self.gate.lock();
        f.debug_struct("CausalityController")
            .field("status", &gate.status)
            .field("read_completions", &gate.read_completions)
            .field("running", &gate.running)
            .field("arming", &self.arming.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;
    use crate::link::{
        error::LinkError,
        lifecycle::ArmingState,
        test_support::{self, SETTLE},
        transport::{PollingTransport, Segment, SimulatedLink, Window},
    };

    /// Transport whose cycles are driven by hand.
    struct ManualTransport {
        regs: Mutex<[u8; REGISTER_SPACE]>,
        reads: AtomicUsize,
    }

    impl ManualTransport {
        fn new() -> Self {
            Self {
                regs: Mutex::new([0; REGISTER_SPACE]),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for ManualTransport {
        fn create_segment(&self, id: SegmentId, _base: u8, _len: usize) -> Result<Arc<Segment>> {
            Err(crate::link::error::LinkError::UnknownSegment(id))
        }
        fn segment(&self, id: SegmentId) -> Result<Arc<Segment>> {
            Err(crate::link::error::LinkError::UnknownSegment(id))
        }
        fn queue_segment_read(&self, _id: SegmentId) -> Result<()> {
            Ok(())
        }
        fn queue_segment_write(&self, _id: SegmentId) -> Result<()> {
            Ok(())
        }
        fn read(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::AcqRel);
            let start = addr as usize;
            Ok(self.regs.lock()[start..start + len].to_vec())
        }
        fn write(&self, addr: u8, bytes: &[u8]) -> Result<()> {
            let start = addr as usize;
            self.regs.lock()[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        fn read_from_write_cache(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
            let start = addr as usize;
            Ok(self.regs.lock()[start..start + len].to_vec())
        }
        fn suppress_reads(&self, _suppress: bool) {}
        fn set_accepting_writes(&self, _accepting: bool) {}
        fn drain_pending_writes(&self) {}
        fn close(&self) {}
        fn is_running(&self) -> bool {
            true
        }
    }

    fn manual_gate() -> (Arc<CausalityController>, Arc<ManualTransport>) {
        let arming = Arc::new(ArmingCell::new());
        let gate = Arc::new(CausalityController::new(arming.clone()));
        let transport = Arc::new(ManualTransport::new());
        gate.attach(transport.clone());
        gate.startup_complete();
        arming.set(ArmingState::Armed);
        (gate, transport)
    }

    fn simulated_gate() -> (Arc<CausalityController>, Arc<PollingTransport>, Arc<SimulatedLink>) {
        let arming = Arc::new(ArmingCell::new());
        let gate = Arc::new(CausalityController::new(arming.clone()));
        let link = Arc::new(SimulatedLink::new());
        let transport = PollingTransport::builder()
            .window(Window::new(0x40, 0x10))
            .link(link.clone())
            .events(gate.clone())
            .start()
            .unwrap();
        transport.set_accepting_writes(true);
        gate.attach(transport.clone());
        arming.set(ArmingState::Armed);
        (gate, transport, link)
    }

    #[test]
    fn write_then_read_observes_the_write() {
        test_support::init_tracing();
        let (gate, transport, link) = simulated_gate();

        // Written, then read straight back through the gate
        assert_eq!(gate.write(0x45, &[50]).unwrap(), WriteOutcome::Queued);
        assert_eq!(gate.read(0x45, 1).unwrap(), ReadOutcome::Fresh(vec![50]));
        assert_eq!(link.peek(0x45, 1).unwrap(), vec![50]);
        assert_eq!(gate.write_status(), WriteStatus::Idle);

        // Consecutive writes each land before the next read
        for value in 1..=5u8 {
            assert!(gate.write8(0x46, value).unwrap().is_queued());
            assert_eq!(gate.read8(0x46).unwrap(), value);
        }
        transport.close();
    }

    #[test]
    fn read_waits_for_both_completions() {
        let (gate, transport) = manual_gate();
        assert!(gate.write(0x45, &[50]).unwrap().is_queued());
        assert_eq!(gate.write_status(), WriteStatus::Dirty);

        let (tx, rx) = mpsc::channel();
        let reader = {
            let gate = gate.clone();
            thread::spawn(move || {
                let _ = tx.send(gate.read(0x45, 1).unwrap());
            })
        };

        // Dirty: the read is held back entirely
        assert!(rx.recv_timeout(SETTLE).is_err());
        assert_eq!(transport.reads.load(Ordering::Acquire), 0);

        // A read cycle alone does not carry the write
        gate.read_completed();
        assert_eq!(gate.write_status(), WriteStatus::Dirty);

        gate.write_completed();
        assert_eq!(gate.write_status(), WriteStatus::PendingRead);
        assert!(rx.recv_timeout(SETTLE).is_err());
        assert_eq!(transport.reads.load(Ordering::Acquire), 0);

        gate.read_completed();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, ReadOutcome::Fresh(vec![50]));
        reader.join().unwrap();
    }

    #[test]
    fn write_then_read_completion_releases_the_read() {
        let (gate, _transport) = manual_gate();
        assert!(gate.write(0x45, &[50]).unwrap().is_queued());

        let (tx, rx) = mpsc::channel();
        let reader = {
            let gate = gate.clone();
            thread::spawn(move || {
                let _ = tx.send(gate.read(0x45, 1).unwrap());
            })
        };
        while gate.waiter_count() == 0 {
            thread::yield_now();
        }

        gate.write_completed();
        gate.read_completed();
        assert_eq!(gate.write_status(), WriteStatus::Idle);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, ReadOutcome::Fresh(vec![50]));
        reader.join().unwrap();
    }

    #[test]
    fn writers_racing_the_polling_loop_read_their_own_bytes() {
        let (gate, transport, _link) = simulated_gate();

        let workers: Vec<_> = (0..4u8)
            .map(|n| {
                let gate = gate.clone();
                thread::spawn(move || {
                    let addr = 0x40 + n;
                    for value in 0..50u8 {
                        assert!(gate.write8(addr, value).unwrap().is_queued());
                        assert_eq!(gate.read8(addr).unwrap(), value);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        transport.close();
    }

    #[test]
    fn ranges_outside_the_window_are_refused() {
        let (gate, transport, _link) = simulated_gate();

        // Window is 0x40..0x50; the header below it is carried too
        assert_eq!(
            gate.write(0x60, &[1]),
            Err(LinkError::OutOfBounds { addr: 0x60, len: 1 })
        );
        assert_eq!(
            gate.read(0x4F, 2),
            Err(LinkError::OutOfBounds { addr: 0x4F, len: 2 })
        );
        assert_eq!(gate.write_status(), WriteStatus::Idle);
        assert!(gate.read(0x00, 1).unwrap().is_fresh());
        transport.close();
    }

    #[test]
    fn unavailable_device_is_reported() {
        let arming = Arc::new(ArmingCell::new());
        let gate = CausalityController::new(arming.clone());

        // Never armed
        assert_eq!(gate.write(0x10, &[1]).unwrap(), WriteOutcome::Discarded);
        assert_eq!(
            gate.read(0x10, 3).unwrap(),
            ReadOutcome::Unavailable(vec![0, 0, 0])
        );
        assert!(!gate.wait_for_next_read_completed());

        // Ranges are still checked
        assert!(gate.read(0xFF, 2).is_err());
        assert!(gate.write(0x10, &[]).is_err());
    }

    #[test]
    fn shutdown_releases_every_waiter() {
        let (gate, _transport) = manual_gate();
        assert!(gate.write8(0x20, 7).unwrap().is_queued());

        let (tx, rx) = mpsc::channel();
        let mut workers = Vec::new();
        for n in 0..3 {
            let gate = gate.clone();
            let tx = tx.clone();
            workers.push(thread::spawn(move || {
                // Reads hold the serialization lock, so only one of them waits
                if n == 0 {
                    let _ = tx.send(gate.read(0x20, 1).unwrap().is_fresh());
                } else {
                    let _ = tx.send(gate.wait_for_next_read_completed());
                }
            }));
        }
        while gate.waiter_count() < 3 {
            thread::yield_now();
        }

        gate.arming().set(ArmingState::ToDisarmed);
        gate.shutdown_complete();

        for _ in 0..3 {
            assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(gate.waiter_count(), 0);
        assert_eq!(gate.write_status(), WriteStatus::Idle);
    }

    #[test]
    fn read_completions_advance_waiters() {
        let (gate, _transport) = manual_gate();
        let before = gate.read_completion_count();

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_for_next_read_completed())
        };
        while gate.waiter_count() == 0 {
            thread::yield_now();
        }
        gate.read_completed();

        assert!(waiter.join().unwrap());
        assert_eq!(gate.read_completion_count(), before + 1);
    }

    #[test]
    fn segment_writes_go_through_the_gate() {
        let (gate, transport, link) = simulated_gate();
        transport.create_segment(SegmentId(0), 0x03, 1).unwrap();

        assert!(gate.write_segment(SegmentId(0), &[0xBB]).unwrap().is_queued());
        // write_segment waited a read cycle; one more makes the write visible
        assert!(gate.wait_for_next_read_completed());
        assert_eq!(link.peek(0x03, 1).unwrap(), vec![0xBB]);
        assert!(gate.write_segment(SegmentId(9), &[0]).is_err());
        transport.close();
    }
}
