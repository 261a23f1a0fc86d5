//! The transport cache: the background polling task, its segment buffers,
//! and the physical links it drives.
//!
//! The synchronization core only talks to [`Transport`]; everything in this
//! module below that trait is one concrete way of providing it.

mod link;
mod polling;
mod segment;
mod sim;

use std::sync::Arc;

use crate::link::{
    config::LinkConfig,
    error::{LinkError, Result},
    helpers::{REGISTER_SPACE, range_span},
};

pub use link::{LinkFactory, PretendLink, RegisterLink};
pub use polling::{PollingTransport, PollingTransportBuilder};
pub use segment::{Segment, SegmentId};
pub use sim::{Firmware, SimulatedFactory, SimulatedLink};

/// Register range polled on every cycle.
///
/// Addresses below `start` (the device header) are only transferred on the
/// first cycle and after a write lands there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u8,
    pub len: usize,
}

impl Window {
    pub const fn new(start: u8, len: usize) -> Self {
        Self { start, len }
    }

    /// One past the last polled address.
    pub const fn end(&self) -> usize {
        self.start as usize + self.len
    }

    /// Checks that `addr..addr+len` lies within the header and the window,
    /// the only bytes the main caches carry.
    pub fn check_range(&self, addr: u8, len: usize) -> Result<(usize, usize)> {
        let (start, end) = range_span::<REGISTER_SPACE>(addr, len)?;
        if end > self.end() {
            return Err(LinkError::OutOfBounds { addr, len });
        }
        Ok((start, end))
    }
}

/// Notifications fired by the polling task, always on its own thread.
///
/// `write_completed` covers every write staged before it fires; staging is
/// held off while it runs, so handlers must not stage writes themselves.
pub trait CycleEvents: Send + Sync {
    fn startup_complete(&self) {}
    fn read_completed(&self) {}
    fn write_completed(&self) {}
    fn shutdown_complete(&self) {}
}

/// Segmented register cache kept in sync with a device by a background task.
pub trait Transport: Send + Sync {
    /// Defines a segment with its own read and write buffers.
    fn create_segment(&self, id: SegmentId, base: u8, len: usize) -> Result<Arc<Segment>>;

    fn segment(&self, id: SegmentId) -> Result<Arc<Segment>>;

    /// Refresh the segment's read buffer on the next read cycle.
    fn queue_segment_read(&self, id: SegmentId) -> Result<()>;

    /// Transmit the segment's write buffer on the next write cycle.
    /// Ignored while writes are not accepted.
    fn queue_segment_write(&self, id: SegmentId) -> Result<()>;

    /// Bytes from the most recent read cycle. Only the header and the
    /// window are kept; other ranges are `OutOfBounds`.
    fn read(&self, addr: u8, len: usize) -> Result<Vec<u8>>;

    /// Stages bytes for the next write cycle. Ignored while writes are not
    /// accepted. Ranges past the window are `OutOfBounds`.
    fn write(&self, addr: u8, bytes: &[u8]) -> Result<()>;

    /// Bytes most recently staged for writing.
    fn read_from_write_cache(&self, addr: u8, len: usize) -> Result<Vec<u8>>;

    /// Skip physical reads (read cycles still complete) while set.
    fn suppress_reads(&self, suppress: bool);

    fn set_accepting_writes(&self, accepting: bool);

    /// Returns once nothing is left to write, or the task stopped.
    fn drain_pending_writes(&self);

    /// Stops the task and waits for it to finish. Idempotent.
    fn close(&self);

    fn is_running(&self) -> bool;
}

/// Everything a factory needs to start a transport for one controller.
pub struct OpenRequest<'a> {
    pub window: Window,
    pub config: &'a LinkConfig,
    pub events: Arc<dyn CycleEvents>,
}

/// Opens transports for arming, and for pretending when no device answers.
pub trait TransportFactory: Send + Sync {
    fn open(&self, request: OpenRequest<'_>) -> Result<Arc<dyn Transport>>;

    /// A transport whose device acknowledges every write and reads as zeros.
    fn open_pretend(&self, request: OpenRequest<'_>) -> Result<Arc<dyn Transport>> {
        let link = PretendLink::new(request.config.pretend_transaction_delay());
        let transport = PollingTransport::builder()
            .window(request.window)
            .link(link)
            .events(request.events)
            .poll_interval(request.config.poll_interval())
            .start()?;
        Ok(transport)
    }
}

impl<F: TransportFactory + ?Sized> TransportFactory for Arc<F> {
    fn open(&self, request: OpenRequest<'_>) -> Result<Arc<dyn Transport>> {
        (**self).open(request)
    }

    fn open_pretend(&self, request: OpenRequest<'_>) -> Result<Arc<dyn Transport>> {
        (**self).open_pretend(request)
    }
}
