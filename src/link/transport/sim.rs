//! A simulated controller module for development without hardware.
//!
//! The register file lives behind a critical section so the polling task and
//! the host side (tests, demos) can both reach it. Device behaviour is
//! supplied by an optional [`Firmware`] hook.

use core::cell::RefCell;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use bitmaps::Bitmap;
use critical_section::Mutex;
use heapless::Deque;

use crate::link::{
    error::{LinkError, Result},
    helpers::{REGISTER_SPACE, range_span},
    transport::{OpenRequest, PollingTransport, RegisterLink, Transport, TransportFactory},
};

const RECENT_WRITES: usize = 32;

/// Device-side behaviour of a simulated module.
pub trait Firmware: Send {
    /// Runs after writable bytes land in the register file.
    fn on_write(&mut self, _addr: u8, _bytes: &[u8], _regs: &mut [u8; REGISTER_SPACE]) {}

    /// Runs before a read transaction is served.
    fn on_read(&mut self, _addr: u8, _len: usize, _regs: &mut [u8; REGISTER_SPACE]) {}
}

struct SimState {
    regs: [u8; REGISTER_SPACE],
    read_only: Bitmap<REGISTER_SPACE>,
    firmware: Option<Box<dyn Firmware>>,
    recent_writes: Deque<(u8, usize), RECENT_WRITES>,
}

pub struct SimulatedLink {
    state: Mutex<RefCell<SimState>>,
    open: AtomicBool,
    transactions: AtomicU64,
    delay: Duration,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_micros(500))
    }

    /// `delay` is slept per transaction to pace the polling task.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(RefCell::new(SimState {
                regs: [0; REGISTER_SPACE],
                read_only: Bitmap::new(),
                firmware: None,
                recent_writes: Deque::new(),
            })),
            open: AtomicBool::new(true),
            transactions: AtomicU64::new(0),
            delay,
        }
    }

    pub fn set_firmware(&self, firmware: impl Firmware + 'static) {
        critical_section::with(|cs| {
            self.state.borrow_ref_mut(cs).firmware = Some(Box::new(firmware));
        });
    }

    /// Link writes to `addr..addr+len` are dropped, as on status registers.
    pub fn set_read_only(&self, addr: u8, len: usize) -> Result<()> {
        let (start, end) = range_span::<REGISTER_SPACE>(addr, len)?;
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            for index in start..end {
                state.read_only.set(index, true);
            }
        });
        Ok(())
    }

    /// Reads the register file directly, bypassing firmware hooks.
    pub fn peek(&self, addr: u8, len: usize) -> Result<Vec<u8>> {
        let (start, end) = range_span::<REGISTER_SPACE>(addr, len)?;
        Ok(critical_section::with(|cs| {
            self.state.borrow_ref(cs).regs[start..end].to_vec()
        }))
    }

    /// Writes the register file directly, ignoring read-only marks.
    pub fn poke(&self, addr: u8, bytes: &[u8]) -> Result<()> {
        let (start, end) = range_span::<REGISTER_SPACE>(addr, bytes.len())?;
        critical_section::with(|cs| {
            self.state.borrow_ref_mut(cs).regs[start..end].copy_from_slice(bytes);
        });
        Ok(())
    }

    /// `(addr, len)` of the most recent link writes, oldest first.
    pub fn recent_writes(&self) -> Vec<(u8, usize)> {
        critical_section::with(|cs| {
            self.state
                .borrow_ref(cs)
                .recent_writes
                .iter()
                .copied()
                .collect()
        })
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Acquire)
    }

    /// Simulates unplugging: the polling task stops at its next check.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn reopen(&self) {
        self.open.store(true, Ordering::Release);
    }

    fn transact(&self) -> Result<()> {
        if !self.is_open() {
            return Err(LinkError::Link("simulated device closed".into()));
        }
        self.transactions.fetch_add(1, Ordering::AcqRel);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(())
    }
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterLink for SimulatedLink {
    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<()> {
        let (start, end) = range_span::<REGISTER_SPACE>(addr, buf.len())?;
        self.transact()?;
        critical_section::with(|cs| {
            let mut guard = self.state.borrow_ref_mut(cs);
            let state = &mut *guard;
            if let Some(firmware) = state.firmware.as_mut() {
                firmware.on_read(addr, buf.len(), &mut state.regs);
            }
            buf.copy_from_slice(&state.regs[start..end]);
        });
        Ok(())
    }

    fn write(&self, addr: u8, bytes: &[u8]) -> Result<()> {
        let (start, _) = range_span::<REGISTER_SPACE>(addr, bytes.len())?;
        self.transact()?;
        critical_section::with(|cs| {
            let mut guard = self.state.borrow_ref_mut(cs);
            let state = &mut *guard;
            for (i, byte) in bytes.iter().enumerate() {
                if !state.read_only.get(start + i) {
                    state.regs[start + i] = *byte;
                }
            }
            if state.recent_writes.is_full() {
                state.recent_writes.pop_front();
            }
            let _ = state.recent_writes.push_back((addr, bytes.len()));
            if let Some(firmware) = state.firmware.as_mut() {
                firmware.on_write(addr, bytes, &mut state.regs);
            }
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for SimulatedLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedLink")
            .field("open", &self.is_open())
            .field("transactions", &self.transactions())
            .finish_non_exhaustive()
    }
}

/// Opens polling transports over one shared [`SimulatedLink`].
pub struct SimulatedFactory {
    link: Arc<SimulatedLink>,
    available: AtomicBool,
}

impl SimulatedFactory {
    pub fn new(link: Arc<SimulatedLink>) -> Self {
        Self {
            link,
            available: AtomicBool::new(true),
        }
    }

    pub fn link(&self) -> &Arc<SimulatedLink> {
        &self.link
    }

    /// While unavailable, [`TransportFactory::open`] fails as if nothing
    /// were plugged in.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

impl TransportFactory for SimulatedFactory {
    fn open(&self, request: OpenRequest<'_>) -> Result<Arc<dyn Transport>> {
        if !self.available.load(Ordering::Acquire) {
            return Err(LinkError::DeviceUnavailable);
        }
        self.link.reopen();
        let transport = PollingTransport::builder()
            .window(request.window)
            .link(self.link.clone())
            .events(request.events)
            .poll_interval(request.config.poll_interval())
            .start()?;
        Ok(transport)
    }
}
