use core::marker::PhantomData;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use bitmaps::Bitmap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::link::{
    error::{LinkError, Result},
    helpers::{REGISTER_SPACE, range_span},
    transport::{CycleEvents, RegisterLink, Segment, SegmentId, Transport, Window},
};

const QUEUE_LIMIT: usize = SegmentId::LIMIT as usize;

/// Segment ids waiting for a cycle, each queued at most once.
struct SegmentQueue {
    order: VecDeque<SegmentId>,
    queued: Bitmap<QUEUE_LIMIT>,
}

impl SegmentQueue {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            queued: Bitmap::new(),
        }
    }

    fn push(&mut self, id: SegmentId) {
        let index = id.0 as usize;
        if !self.queued.get(index) {
            self.queued.set(index, true);
            self.order.push_back(id);
        }
    }

    fn pop(&mut self) -> Option<SegmentId> {
        let id = self.order.pop_front()?;
        self.queued.set(id.0 as usize, false);
        Some(id)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct WriteCache {
    bytes: [u8; REGISTER_SPACE],
    write_needed: bool,
    full_write_needed: bool,
    // Set from the snapshot until the cycle's writes reached the link
    in_flight: bool,
}

struct Shared {
    window: Window,
    poll_interval: Duration,
    link: Box<dyn RegisterLink>,
    events: Arc<dyn CycleEvents>,
    read_cache: Mutex<[u8; REGISTER_SPACE]>,
    write_cache: Mutex<WriteCache>,
    segments: RwLock<HashMap<SegmentId, Arc<Segment>>>,
    read_queue: Mutex<SegmentQueue>,
    write_queue: Mutex<SegmentQueue>,
    // Guards both the flag and every path that stages a write. The write
    // cycle holds it from its snapshot until `write_completed` has fired.
    accepting_writes: Mutex<bool>,
    // Signalled with the write cache lock after every write cycle.
    cycle_done: Condvar,
    // Held for the whole physical read of a cycle.
    suppress_reads: Mutex<bool>,
    running: AtomicBool,
}

/// Transport cache driven by a dedicated polling thread.
///
/// Each cycle reads the monitor window and any queued segments, fires
/// `read_completed`, then writes the window (if staged) and any queued
/// segments and fires `write_completed`.
pub struct PollingTransport {
    shared: Arc<Shared>,
    worker: Mutex<Option<(ThreadId, JoinHandle<()>)>>,
}

// Builder states
pub struct NeedWindow;
pub struct NeedLink;
pub struct NeedEvents;
pub struct Ready;

pub struct PollingTransportBuilder<State> {
    window: Option<Window>,
    link: Option<Box<dyn RegisterLink>>,
    events: Option<Arc<dyn CycleEvents>>,
    poll_interval: Duration,
    _state: PhantomData<State>,
}

impl PollingTransport {
    pub fn builder() -> PollingTransportBuilder<NeedWindow> {
        PollingTransportBuilder {
            window: None,
            link: None,
            events: None,
            poll_interval: Duration::ZERO,
            _state: PhantomData,
        }
    }

    pub fn window(&self) -> Window {
        self.shared.window
    }
}

impl PollingTransportBuilder<NeedWindow> {
    pub fn window(self, window: Window) -> PollingTransportBuilder<NeedLink> {
        PollingTransportBuilder {
            window: Some(window),
            link: None,
            events: None,
            poll_interval: self.poll_interval,
            _state: PhantomData,
        }
    }
}

impl PollingTransportBuilder<NeedLink> {
    pub fn link(self, link: impl RegisterLink + 'static) -> PollingTransportBuilder<NeedEvents> {
        PollingTransportBuilder {
            window: self.window,
            link: Some(Box::new(link)),
            events: None,
            poll_interval: self.poll_interval,
            _state: PhantomData,
        }
    }
}

impl PollingTransportBuilder<NeedEvents> {
    pub fn events(self, events: Arc<dyn CycleEvents>) -> PollingTransportBuilder<Ready> {
        PollingTransportBuilder {
            window: self.window,
            link: self.link,
            events: Some(events),
            poll_interval: self.poll_interval,
            _state: PhantomData,
        }
    }
}

impl PollingTransportBuilder<Ready> {
    /// Pause between cycles on top of link time.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawns the polling thread and returns once it has fired
    /// `startup_complete`.
    pub fn start(self) -> Result<Arc<PollingTransport>> {
        let (Some(window), Some(link), Some(events)) = (self.window, self.link, self.events)
        else {
            return Err(LinkError::Link("polling transport builder incomplete".into()));
        };
        range_span::<REGISTER_SPACE>(window.start, window.len)?;

        let shared = Arc::new(Shared {
            window,
            poll_interval: self.poll_interval,
            link,
            events,
            read_cache: Mutex::new([0; REGISTER_SPACE]),
            write_cache: Mutex::new(WriteCache {
                bytes: [0; REGISTER_SPACE],
                write_needed: false,
                full_write_needed: false,
                in_flight: false,
            }),
            segments: RwLock::new(HashMap::new()),
            read_queue: Mutex::new(SegmentQueue::new()),
            write_queue: Mutex::new(SegmentQueue::new()),
            accepting_writes: Mutex::new(false),
            cycle_done: Condvar::new(),
            suppress_reads: Mutex::new(false),
            running: AtomicBool::new(true),
        });

        let (started_tx, started_rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("register-poll".into())
            .spawn(move || worker_shared.run(started_tx))
            .map_err(|e| LinkError::Link(format!("failed to spawn polling thread: {e}")))?;
        let thread_id = handle.thread().id();

        started_rx
            .recv()
            .map_err(|_| LinkError::Link("polling thread exited during startup".into()))?;

        Ok(Arc::new(PollingTransport {
            shared,
            worker: Mutex::new(Some((thread_id, handle))),
        }))
    }
}

impl Shared {
    fn run(&self, started: mpsc::Sender<()>) {
        tracing::debug!(start = self.window.start, len = self.window.len, "polling loop starting");
        self.events.startup_complete();
        let _ = started.send(());

        // Header bytes below the window go out on the first cycle only
        let mut full_active = true;
        let mut prune_after_read = true;

        while self.running.load(Ordering::Acquire) {
            self.read_cycle(full_active);
            self.write_cycle(&mut full_active, &mut prune_after_read);

            if !self.link.is_open() {
                tracing::warn!("link closed; polling loop stopping");
                break;
            }
            if !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }
        }

        self.running.store(false, Ordering::Release);
        self.signal_cycle_done();
        self.events.shutdown_complete();
        tracing::debug!("polling loop stopped");
    }

    fn active_range(&self, full_active: bool) -> (u8, usize) {
        if full_active {
            (0, self.window.end())
        } else {
            (self.window.start, self.window.len)
        }
    }

    fn read_cycle(&self, full_active: bool) {
        {
            let suppressed = self.suppress_reads.lock();
            if !*suppressed {
                let (first, len) = self.active_range(full_active);
                let mut active = vec![0u8; len];
                match self.link.read(first, &mut active) {
                    Ok(()) => {
                        let start = first as usize;
                        self.read_cache.lock()[start..start + len].copy_from_slice(&active);
                    }
                    Err(err) => tracing::warn!(%err, "could not read monitor window"),
                }

                while let Some(id) = self.read_queue.lock().pop() {
                    let Some(segment) = self.segments.read().get(&id).cloned() else {
                        continue;
                    };
                    let mut bytes = vec![0u8; segment.len()];
                    match self.link.read(segment.base(), &mut bytes) {
                        Ok(()) => segment.store_read(&bytes),
                        Err(err) => tracing::warn!(%err, segment = %id, "could not read segment"),
                    }
                }
            }
        }
        self.events.read_completed();
    }

    fn write_cycle(&self, full_active: &mut bool, prune_after_read: &mut bool) {
        let staging = self.accepting_writes.lock();
        let staged = {
            let mut cache = self.write_cache.lock();
            if cache.full_write_needed {
                *full_active = true;
                cache.full_write_needed = false;
                *prune_after_read = true;
            } else if *prune_after_read {
                *full_active = false;
                *prune_after_read = false;
            }
            let (first, len) = self.active_range(*full_active);
            let start = first as usize;
            let bytes = cache.bytes[start..start + len].to_vec();
            let needed = cache.write_needed;
            cache.write_needed = false;
            cache.in_flight = true;
            needed.then_some((first, bytes))
        };

        if let Some((first, bytes)) = staged {
            if let Err(err) = self.link.write(first, &bytes) {
                tracing::warn!(%err, "could not write monitor window");
            }
        }

        while let Some(id) = self.write_queue.lock().pop() {
            let Some(segment) = self.segments.read().get(&id).cloned() else {
                continue;
            };
            let bytes = segment.snapshot_write();
            if let Err(err) = self.link.write(segment.base(), &bytes) {
                tracing::warn!(%err, segment = %id, "could not write segment");
            }
        }

        self.events.write_completed();
        drop(staging);
        self.signal_cycle_done();
    }

    fn signal_cycle_done(&self) {
        self.write_cache.lock().in_flight = false;
        self.cycle_done.notify_all();
    }
}

impl Transport for PollingTransport {
    fn create_segment(&self, id: SegmentId, base: u8, len: usize) -> Result<Arc<Segment>> {
        if id.0 >= SegmentId::LIMIT {
            return Err(LinkError::InvalidValue {
                what: "segment id",
                value: id.0 as f64,
            });
        }
        range_span::<REGISTER_SPACE>(base, len)?;

        let mut segments = self.shared.segments.write();
        if segments.contains_key(&id) {
            return Err(LinkError::DuplicateSegment(id));
        }
        let segment = Arc::new(Segment::new(id, base, len));
        segments.insert(id, segment.clone());
        Ok(segment)
    }

    fn segment(&self, id: SegmentId) -> Result<Arc<Segment>> {
        self.shared
            .segments
            .read()
            .get(&id)
            .cloned()
            .ok_or(LinkError::UnknownSegment(id))
    }

    fn queue_segment_read(&self, id: SegmentId) -> Result<()> {
        self.segment(id)?;
        self.shared.read_queue.lock().push(id);
        Ok(())
    }

    fn queue_segment_write(&self, id: SegmentId) -> Result<()> {
        self.segment(id)?;
        let accepting = self.shared.accepting_writes.lock();
        if *accepting {
            self.shared.write_queue.lock().push(id);
        }
        Ok(())
    }

    fn read(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
        let (start, end) = self.shared.window.check_range(addr, len)?;
        Ok(self.shared.read_cache.lock()[start..end].to_vec())
    }

    fn write(&self, addr: u8, bytes: &[u8]) -> Result<()> {
        let (start, end) = self.shared.window.check_range(addr, bytes.len())?;
        let accepting = self.shared.accepting_writes.lock();
        if *accepting {
            let mut cache = self.shared.write_cache.lock();
            cache.bytes[start..end].copy_from_slice(bytes);
            cache.write_needed = true;
            if addr < self.shared.window.start {
                cache.full_write_needed = true;
            }
        }
        Ok(())
    }

    fn read_from_write_cache(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
        let (start, end) = range_span::<REGISTER_SPACE>(addr, len)?;
        Ok(self.shared.write_cache.lock().bytes[start..end].to_vec())
    }

    fn suppress_reads(&self, suppress: bool) {
        *self.shared.suppress_reads.lock() = suppress;
    }

    fn set_accepting_writes(&self, accepting: bool) {
        *self.shared.accepting_writes.lock() = accepting;
    }

    fn drain_pending_writes(&self) {
        let on_worker = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(|(thread_id, _)| *thread_id == thread::current().id());
        if on_worker {
            // Only the loop itself could drain them
            return;
        }
        let shared = &self.shared;
        let mut cache = shared.write_cache.lock();
        while shared.running.load(Ordering::Acquire)
            && (cache.write_needed || cache.in_flight || !shared.write_queue.lock().is_empty())
        {
            shared.cycle_done.wait(&mut cache);
        }
    }

    fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some((thread_id, handle)) = worker {
            if thread_id == thread::current().id() {
                // Closing from a cycle callback; the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                tracing::error!("polling thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PollingTransport")
            .field("window", &self.shared.window)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::link::transport::SimulatedLink;

    #[derive(Default)]
    struct Counter {
        reads: AtomicU64,
        writes: AtomicU64,
        started: AtomicBool,
        stopped: AtomicBool,
    }

    impl CycleEvents for Counter {
        fn startup_complete(&self) {
            self.started.store(true, Ordering::Release);
        }
        fn read_completed(&self) {
            self.reads.fetch_add(1, Ordering::AcqRel);
        }
        fn write_completed(&self) {
            self.writes.fetch_add(1, Ordering::AcqRel);
        }
        fn shutdown_complete(&self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    fn start(link: Arc<SimulatedLink>, events: Arc<Counter>) -> Arc<PollingTransport> {
        let transport = PollingTransport::builder()
            .window(Window::new(0x40, 0x10))
            .link(link)
            .events(events)
            .start()
            .unwrap();
        transport.set_accepting_writes(true);
        transport
    }

    fn wait_reads(events: &Counter, n: u64) {
        let target = events.reads.load(Ordering::Acquire) + n;
        while events.reads.load(Ordering::Acquire) < target {
            thread::yield_now();
        }
    }

    #[test]
    fn start_and_close_fire_lifecycle_events() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link, events.clone());

        assert!(events.started.load(Ordering::Acquire));
        assert!(transport.is_running());

        transport.close();
        transport.close();
        assert!(!transport.is_running());
        assert!(events.stopped.load(Ordering::Acquire));
    }

    #[test]
    fn main_window_round_trip() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());

        transport.write(0x45, &[50]).unwrap();
        assert_eq!(transport.read_from_write_cache(0x45, 1).unwrap(), vec![50]);
        transport.drain_pending_writes();
        wait_reads(&events, 2);

        assert_eq!(link.peek(0x45, 1).unwrap(), vec![50]);
        assert_eq!(transport.read(0x45, 1).unwrap(), vec![50]);
        transport.close();
    }

    #[test]
    fn writes_are_dropped_while_not_accepting() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());
        transport.set_accepting_writes(false);

        transport.write(0x41, &[9]).unwrap();
        assert_eq!(transport.read_from_write_cache(0x41, 1).unwrap(), vec![0]);
        transport.close();
    }

    #[test]
    fn ranges_outside_the_window_are_rejected() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());

        assert_eq!(
            transport.write(0x60, &[7]).unwrap_err(),
            LinkError::OutOfBounds { addr: 0x60, len: 1 }
        );
        assert_eq!(
            transport.read(0x50, 1).unwrap_err(),
            LinkError::OutOfBounds { addr: 0x50, len: 1 }
        );
        assert_eq!(transport.read_from_write_cache(0x60, 1).unwrap(), vec![0]);

        // Header plus window is in range
        assert_eq!(transport.read(0x00, 0x50).unwrap().len(), 0x50);
        transport.close();
        assert_eq!(link.peek(0x60, 1).unwrap(), vec![0]);
    }

    #[test]
    fn drain_returns_once_the_writes_reached_the_link() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::from_millis(2)));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());

        for value in 1..=20u8 {
            transport.write(0x48, &[value]).unwrap();
            transport.drain_pending_writes();
            assert_eq!(link.peek(0x48, 1).unwrap(), vec![value]);
        }

        // Nothing pending: returns without waiting on a cycle
        transport.drain_pending_writes();
        transport.close();
        transport.drain_pending_writes();
    }

    #[test]
    fn segments_move_through_their_own_buffers() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());

        let segment = transport.create_segment(SegmentId(4), 0x70, 32).unwrap();
        assert_eq!(
            transport.create_segment(SegmentId(4), 0x70, 32).unwrap_err(),
            LinkError::DuplicateSegment(SegmentId(4))
        );

        segment.with_write_buffer(|buf| buf[4] = 0x42);
        transport.queue_segment_write(SegmentId(4)).unwrap();
        transport.queue_segment_write(SegmentId(4)).unwrap();
        transport.drain_pending_writes();
        wait_reads(&events, 1);
        assert_eq!(link.peek(0x74, 1).unwrap(), vec![0x42]);

        link.poke(0x75, &[0x99]).unwrap();
        transport.queue_segment_read(SegmentId(4)).unwrap();
        wait_reads(&events, 2);
        assert_eq!(segment.with_read_buffer(|buf| buf[5]), 0x99);

        // Queued twice, transmitted once
        let segment_writes = link
            .recent_writes()
            .iter()
            .filter(|(addr, _)| *addr == 0x70)
            .count();
        assert_eq!(segment_writes, 1);
        transport.close();
    }

    #[test]
    fn unknown_segments_are_rejected() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link, events);

        assert_eq!(
            transport.queue_segment_read(SegmentId(9)),
            Err(LinkError::UnknownSegment(SegmentId(9)))
        );
        assert!(transport.create_segment(SegmentId(1), 0xF0, 32).is_err());
        transport.close();
    }

    #[test]
    fn low_writes_cover_the_header() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());
        wait_reads(&events, 2);

        transport.write(0x03, &[0xBB]).unwrap();
        transport.drain_pending_writes();
        wait_reads(&events, 2);

        assert_eq!(link.peek(0x03, 1).unwrap(), vec![0xBB]);
        assert!(link.recent_writes().contains(&(0x00, 0x50)));
        transport.close();
    }

    #[test]
    fn suppressed_reads_still_complete_cycles() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());
        wait_reads(&events, 1);

        transport.suppress_reads(true);
        link.poke(0x48, &[7]).unwrap();
        wait_reads(&events, 3);
        assert_eq!(transport.read(0x48, 1).unwrap(), vec![0]);

        transport.suppress_reads(false);
        wait_reads(&events, 2);
        assert_eq!(transport.read(0x48, 1).unwrap(), vec![7]);
        transport.close();
    }

    #[test]
    fn unplugged_link_stops_the_loop() {
        let link = Arc::new(SimulatedLink::with_delay(Duration::ZERO));
        let events = Arc::new(Counter::default());
        let transport = start(link.clone(), events.clone());

        link.close();
        while !events.stopped.load(Ordering::Acquire) {
            thread::yield_now();
        }
        assert!(!transport.is_running());
        transport.close();
    }
}
