//! Several independent I2C ports sharing one controller link.
//!
//! Every port owns a 32-byte segment with the layout
//!
//! ```text
//! [mode][i2c addr][mem addr][len][payload: 27 bytes][action flag]
//!   0       1         2       3     4 ..= 30             31
//! ```
//!
//! plus a one-byte segment aliasing just the action flag, so toggling the
//! flag does not resend the payload. A single status byte carries one busy
//! bit per port; a clear bit means the port is ready. After every read
//! cycle the ready ports with a registered callback are notified in
//! ascending port order.
//!
//! Callbacks run on the polling thread and must not call back into gated
//! reads or writes of the same controller.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bitmaps::Bitmap;
use parking_lot::{Mutex, RwLock};

use crate::link::{
    causality::CausalityController,
    error::{LinkError, Result},
    helpers::check_port,
    transport::{CycleEvents, Segment, SegmentId, Transport},
    wire::{ActionFlag, WireByte},
};

pub const OFFSET_MODE: usize = 0;
pub const OFFSET_I2C_ADDRESS: usize = 1;
pub const OFFSET_MEMORY_ADDRESS: usize = 2;
pub const OFFSET_LENGTH: usize = 3;
pub const OFFSET_PAYLOAD: usize = 4;
pub const OFFSET_ACTION_FLAG: usize = 31;
pub const PORT_SEGMENT_LEN: usize = 32;
/// Largest payload one port transfer can carry.
pub const PAYLOAD_MAX: usize = 27;
/// Ports one status byte can describe.
pub const MAX_PORTS: usize = 8;

/// Payload snapshot taken under a segment lock.
pub type Payload = heapless::Vec<u8, PAYLOAD_MAX>;

/// Where a module keeps its ports and how it encodes their modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    /// Base address of each port's segment, indexed by port.
    pub port_bases: &'static [u8],
    /// Busy bit of each port within the status byte.
    pub ready_bits: &'static [u8],
    pub status_addr: u8,
    /// Segment id of port 0; port `n` uses `segment_key + n`.
    pub segment_key: u8,
    /// Segment id of port 0's flag-only alias.
    pub flag_only_segment_key: u8,
    pub read_mode_byte: u8,
    pub write_mode_byte: u8,
    pub max_write_latency_ms: u32,
}

impl PortLayout {
    pub fn port_count(&self) -> usize {
        self.port_bases.len()
    }

    fn segment_id(&self, port: usize) -> SegmentId {
        SegmentId(self.segment_key + port as u8)
    }

    fn flag_only_id(&self, port: usize) -> SegmentId {
        SegmentId(self.flag_only_segment_key + port as u8)
    }
}

/// Told when a port finished its last transfer and can take another.
pub trait PortReadyCallback: Send + Sync {
    fn port_is_ready(&self, port: usize);
}

impl<F: Fn(usize) + Send + Sync> PortReadyCallback for F {
    fn port_is_ready(&self, port: usize) {
        self(port)
    }
}

/// Told when ready notifications for a port start and stop flowing.
pub trait PortReadyBeginEnd: Send + Sync {
    fn on_port_ready_begin(&self, port: usize);
    fn on_port_ready_end(&self, port: usize);
}

struct Port {
    segment: RwLock<Arc<Segment>>,
    flag_only: RwLock<Arc<Segment>>,
    // Mode byte last requested, reported while not armed
    last_mode: AtomicU8,
    callback: RwLock<Option<Arc<dyn PortReadyCallback>>>,
}

pub struct PortMultiplexer {
    layout: PortLayout,
    gate: Arc<CausalityController>,
    ports: Vec<Port>,
    begin_end: Mutex<Vec<Option<Arc<dyn PortReadyBeginEnd>>>>,
    notifications_active: AtomicBool,
}

impl PortMultiplexer {
    pub fn new(layout: PortLayout, gate: Arc<CausalityController>) -> Self {
        debug_assert_eq!(layout.port_bases.len(), layout.ready_bits.len());
        debug_assert!(layout.port_count() <= MAX_PORTS);

        let ports = layout
            .port_bases
            .iter()
            .enumerate()
            .map(|(port, &base)| Port {
                segment: RwLock::new(Arc::new(Segment::new(
                    layout.segment_id(port),
                    base,
                    PORT_SEGMENT_LEN,
                ))),
                flag_only: RwLock::new(Arc::new(Segment::new(
                    layout.flag_only_id(port),
                    base + OFFSET_ACTION_FLAG as u8,
                    1,
                ))),
                last_mode: AtomicU8::new(0),
                callback: RwLock::new(None),
            })
            .collect();

        Self {
            layout,
            gate,
            ports,
            begin_end: Mutex::new(vec![None; layout.port_count()]),
            notifications_active: AtomicBool::new(false),
        }
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    pub fn port_count(&self) -> usize {
        self.layout.port_count()
    }

    fn port(&self, port: usize) -> Result<&Port> {
        check_port(port, self.port_count())?;
        Ok(&self.ports[port])
    }

    fn segment(&self, port: usize) -> Result<Arc<Segment>> {
        Ok(self.port(port)?.segment.read().clone())
    }

    fn check_length(len: usize) -> Result<()> {
        if len > PAYLOAD_MAX {
            return Err(LinkError::BufferTooLarge {
                len,
                max: PAYLOAD_MAX,
            });
        }
        Ok(())
    }

    /// Creates every port segment on a freshly opened transport.
    pub fn create_segments(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        for (port, slot) in self.ports.iter().enumerate() {
            let base = self.layout.port_bases[port];
            let segment =
                transport.create_segment(self.layout.segment_id(port), base, PORT_SEGMENT_LEN)?;
            let flag_only = transport.create_segment(
                self.layout.flag_only_id(port),
                base + OFFSET_ACTION_FLAG as u8,
                1,
            )?;
            *slot.segment.write() = segment;
            *slot.flag_only.write() = flag_only;
            slot.last_mode.store(0, Ordering::Release);
        }
        Ok(())
    }

    fn enable_mode(&self, mode: u8, port: usize, i2c_addr: u8, mem_addr: u8, len: usize) -> Result<()> {
        let slot = self.port(port)?;
        Self::check_length(len)?;
        slot.segment.read().with_write_buffer(|buf| {
            buf[OFFSET_MODE] = mode;
            buf[OFFSET_I2C_ADDRESS] = i2c_addr;
            buf[OFFSET_MEMORY_ADDRESS] = mem_addr;
            buf[OFFSET_LENGTH] = len as u8;
            slot.last_mode.store(mode, Ordering::Release);
        });
        Ok(())
    }

    /// Stages a read of `len` bytes at `mem_addr` from the device at
    /// `i2c_addr`. Nothing is sent until the port is written to the
    /// controller.
    pub fn enable_read_mode(&self, port: usize, i2c_addr: u8, mem_addr: u8, len: usize) -> Result<()> {
        self.enable_mode(self.layout.read_mode_byte, port, i2c_addr, mem_addr, len)
    }

    /// Stages a write of `len` payload bytes to `mem_addr` on `i2c_addr`.
    pub fn enable_write_mode(&self, port: usize, i2c_addr: u8, mem_addr: u8, len: usize) -> Result<()> {
        self.enable_mode(self.layout.write_mode_byte, port, i2c_addr, mem_addr, len)
    }

    /// Stores `mode` as the port's mode byte and as its last requested mode.
    pub fn set_mode_byte(&self, port: usize, mode: u8) -> Result<()> {
        let slot = self.port(port)?;
        slot.segment.read().with_write_buffer(|buf| {
            buf[OFFSET_MODE] = mode;
            slot.last_mode.store(mode, Ordering::Release);
        });
        Ok(())
    }

    /// Rewrites flag bits of the staged mode byte, leaving the last
    /// requested mode alone. Returns the new byte.
    pub fn update_mode_byte(&self, port: usize, f: impl FnOnce(u8) -> u8) -> Result<u8> {
        let segment = self.segment(port)?;
        Ok(segment.with_write_buffer(|buf| {
            buf[OFFSET_MODE] = f(buf[OFFSET_MODE]);
            buf[OFFSET_MODE]
        }))
    }

    pub fn copy_into_write_buffer(&self, port: usize, bytes: &[u8]) -> Result<()> {
        let segment = self.segment(port)?;
        Self::check_length(bytes.len())?;
        segment.with_write_buffer(|buf| {
            buf[OFFSET_PAYLOAD..OFFSET_PAYLOAD + bytes.len()].copy_from_slice(bytes);
        });
        Ok(())
    }

    fn payload_of(buf: &[u8]) -> Payload {
        let len = (buf[OFFSET_LENGTH] as usize).min(PAYLOAD_MAX);
        buf[OFFSET_PAYLOAD..OFFSET_PAYLOAD + len].iter().copied().collect()
    }

    /// Payload last read back from the port, sized by its length byte.
    pub fn read_buffer_copy(&self, port: usize) -> Result<Payload> {
        Ok(self.segment(port)?.with_read_buffer(Self::payload_of))
    }

    /// Payload staged for the next write, sized by its length byte.
    pub fn write_buffer_copy(&self, port: usize) -> Result<Payload> {
        Ok(self.segment(port)?.with_write_buffer(|buf| Self::payload_of(buf)))
    }

    fn stamp_flag(&self, port: usize, flag: ActionFlag) -> Result<()> {
        self.segment(port)?
            .with_write_buffer(|buf| buf[OFFSET_ACTION_FLAG] = flag.to_wire_byte());
        Ok(())
    }

    pub fn set_action_flag(&self, port: usize) -> Result<()> {
        self.stamp_flag(port, ActionFlag::Execute)
    }

    pub fn clear_action_flag(&self, port: usize) -> Result<()> {
        self.stamp_flag(port, ActionFlag::Idle)
    }

    /// Reads the flag back from the read buffer: the device clears it once
    /// the transfer ran, so it can lag the write buffer by a cycle.
    pub fn is_action_flag_set(&self, port: usize) -> Result<bool> {
        let segment = self.segment(port)?;
        Ok(segment.with_read_buffer(|buf| {
            ActionFlag::from_wire_byte(buf[OFFSET_ACTION_FLAG]) == ActionFlag::Execute
        }))
    }

    /// Queues the port's segment for the next read cycle.
    pub fn read_cache_from_controller(&self, port: usize) -> Result<()> {
        let id = self.layout.segment_id(port);
        check_port(port, self.port_count())?;
        match self.gate.transport() {
            Some(transport) => transport.queue_segment_read(id),
            None => Ok(()),
        }
    }

    /// Queues the whole port segment for the next write cycle.
    pub fn write_cache_to_controller(&self, port: usize) -> Result<()> {
        let id = self.layout.segment_id(port);
        check_port(port, self.port_count())?;
        match self.gate.transport() {
            Some(transport) => transport.queue_segment_write(id),
            None => Ok(()),
        }
    }

    /// Sends only the action flag byte.
    pub fn write_flag_only_to_controller(&self, port: usize) -> Result<()> {
        let slot = self.port(port)?;
        let full = slot.segment.read().clone();
        let flag_only = slot.flag_only.read().clone();
        {
            let full_buf = full.lock_write();
            let mut flag_buf = flag_only.lock_write();
            flag_buf[0] = full_buf[OFFSET_ACTION_FLAG];
        }
        match self.gate.transport() {
            Some(transport) => transport.queue_segment_write(flag_only.id()),
            None => Ok(()),
        }
    }

    fn reported_mode(&self, port: usize) -> Result<u8> {
        let slot = self.port(port)?;
        if self.gate.is_armed() {
            Ok(slot.segment.read().with_read_buffer(|buf| buf[OFFSET_MODE]))
        } else {
            Ok(slot.last_mode.load(Ordering::Acquire))
        }
    }

    /// Mode byte as read back while armed, as last requested otherwise.
    pub fn is_port_in_read_mode(&self, port: usize) -> Result<bool> {
        Ok(self.reported_mode(port)? == self.layout.read_mode_byte)
    }

    pub fn is_port_in_write_mode(&self, port: usize) -> Result<bool> {
        Ok(self.reported_mode(port)? == self.layout.write_mode_byte)
    }

    fn is_ready_in(&self, port: usize, status: u8) -> bool {
        // A device that is not armed never holds a caller up
        !self.gate.is_armed() || status & self.layout.ready_bits[port] == 0
    }

    pub fn is_port_ready(&self, port: usize) -> Result<bool> {
        check_port(port, self.port_count())?;
        let status = self.gate.read8(self.layout.status_addr)?;
        Ok(self.is_ready_in(port, status))
    }

    pub fn max_write_latency_ms(&self, port: usize) -> Result<u32> {
        check_port(port, self.port_count())?;
        Ok(self.layout.max_write_latency_ms)
    }

    /// Runs `f` on the port's read buffer under its read lock.
    pub fn with_read_cache<R>(&self, port: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        Ok(self.segment(port)?.with_read_buffer(f))
    }

    /// Runs `f` on the port's write buffer under its write lock.
    pub fn with_write_cache<R>(&self, port: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        Ok(self.segment(port)?.with_write_buffer(f))
    }

    /// Replaces any callback already registered on `port`.
    pub fn register_ready_callback(&self, port: usize, callback: Arc<dyn PortReadyCallback>) -> Result<()> {
        *self.port(port)?.callback.write() = Some(callback);
        Ok(())
    }

    /// Returns whether a callback was registered.
    pub fn deregister_ready_callback(&self, port: usize) -> Result<bool> {
        Ok(self.port(port)?.callback.write().take().is_some())
    }

    pub fn ready_callback(&self, port: usize) -> Result<Option<Arc<dyn PortReadyCallback>>> {
        Ok(self.port(port)?.callback.read().clone())
    }

    /// Replaces (and ends) any listener on `port`; begins the new one at
    /// once if notifications are flowing.
    pub fn register_ready_begin_end(&self, port: usize, listener: Arc<dyn PortReadyBeginEnd>) -> Result<()> {
        check_port(port, self.port_count())?;
        self.deregister_ready_begin_end(port)?;
        self.begin_end.lock()[port] = Some(listener.clone());
        if self.notifications_active.load(Ordering::Acquire) {
            listener.on_port_ready_begin(port);
        }
        Ok(())
    }

    /// Ends the listener on `port`, even if notifications are not flowing.
    /// Returns whether one was registered.
    pub fn deregister_ready_begin_end(&self, port: usize) -> Result<bool> {
        check_port(port, self.port_count())?;
        let previous = self.begin_end.lock()[port].take();
        match previous {
            Some(listener) => {
                listener.on_port_ready_end(port);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn ready_begin_end(&self, port: usize) -> Result<Option<Arc<dyn PortReadyBeginEnd>>> {
        check_port(port, self.port_count())?;
        Ok(self.begin_end.lock()[port].clone())
    }

    fn begin_end_listeners(&self) -> Vec<(usize, Arc<dyn PortReadyBeginEnd>)> {
        self.begin_end
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(port, listener)| listener.clone().map(|l| (port, l)))
            .collect()
    }

    fn dispatch_ready(&self) {
        let armed = self.gate.is_armed();
        let status = if armed {
            match self.gate.peek(self.layout.status_addr, 1) {
                Ok(bytes) => bytes[0],
                Err(err) => {
                    tracing::warn!(%err, "could not read port status");
                    return;
                }
            }
        } else {
            0
        };

        let mut ready = Bitmap::<MAX_PORTS>::new();
        for (port, slot) in self.ports.iter().enumerate() {
            if slot.callback.read().is_some() && self.is_ready_in(port, status) {
                ready.set(port, true);
            }
        }

        for port in &ready {
            let callback = self.ports[port].callback.read().clone();
            if let Some(callback) = callback {
                callback.port_is_ready(port);
            }
        }
    }
}

impl CycleEvents for PortMultiplexer {
    fn startup_complete(&self) {
        self.notifications_active.store(true, Ordering::Release);
        for (port, listener) in self.begin_end_listeners() {
            listener.on_port_ready_begin(port);
        }
    }

    fn read_completed(&self) {
        self.dispatch_ready();
    }

    fn shutdown_complete(&self) {
        for (port, listener) in self.begin_end_listeners() {
            listener.on_port_ready_end(port);
        }
        self.notifications_active.store(false, Ordering::Release);
    }
}

impl core::fmt::Debug for PortMultiplexer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PortMultiplexer")
            .field("ports", &self.port_count())
            .field("status_addr", &self.layout.status_addr)
            .field("active", &self.notifications_active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
