use std::{sync::Arc, thread, time::Duration};

use crate::link::{
    error::Result,
    transport::{OpenRequest, PollingTransport, Transport, TransportFactory},
};

/// Physical register I/O against one device.
///
/// Called only from the polling task. A link that stops reporting open ends
/// the task.
pub trait RegisterLink: Send + Sync {
    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<()>;

    fn write(&self, addr: u8, bytes: &[u8]) -> Result<()>;

    fn is_open(&self) -> bool {
        true
    }
}

impl<L: RegisterLink + ?Sized> RegisterLink for Arc<L> {
    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<()> {
        (**self).read(addr, buf)
    }

    fn write(&self, addr: u8, bytes: &[u8]) -> Result<()> {
        (**self).write(addr, bytes)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

impl<L: RegisterLink + ?Sized> RegisterLink for Box<L> {
    fn read(&self, addr: u8, buf: &mut [u8]) -> Result<()> {
        (**self).read(addr, buf)
    }

    fn write(&self, addr: u8, bytes: &[u8]) -> Result<()> {
        (**self).write(addr, bytes)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Stand-in for an absent device: writes are acknowledged and dropped,
/// reads return zeros, and every transaction takes roughly as long as a
/// real one so the polling task does not spin.
#[derive(Debug, Clone)]
pub struct PretendLink {
    transaction_delay: Duration,
}

impl PretendLink {
    pub fn new(transaction_delay: Duration) -> Self {
        Self { transaction_delay }
    }

    fn pause(&self) {
        if !self.transaction_delay.is_zero() {
            thread::sleep(self.transaction_delay);
        }
    }
}

impl RegisterLink for PretendLink {
    fn read(&self, _addr: u8, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.pause();
        Ok(())
    }

    fn write(&self, _addr: u8, _bytes: &[u8]) -> Result<()> {
        self.pause();
        Ok(())
    }
}

/// Factory for real hardware: `opener` produces a fresh link per arming.
pub struct LinkFactory<O> {
    opener: O,
}

impl<O, L> LinkFactory<O>
where
    O: Fn() -> Result<L> + Send + Sync,
    L: RegisterLink + 'static,
{
    pub fn new(opener: O) -> Self {
        Self { opener }
    }
}

impl<O, L> TransportFactory for LinkFactory<O>
where
    O: Fn() -> Result<L> + Send + Sync,
    L: RegisterLink + 'static,
{
    fn open(&self, request: OpenRequest<'_>) -> Result<Arc<dyn Transport>> {
        let link = (self.opener)()?;
        let transport = PollingTransport::builder()
            .window(request.window)
            .link(link)
            .events(request.events)
            .poll_interval(request.config.poll_interval())
            .start()?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretend_link_reads_zeros() {
        let link = PretendLink::new(Duration::ZERO);
        let mut buf = [0xAAu8; 4];
        link.write(0x10, &[1, 2, 3]).unwrap();
        link.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert!(link.is_open());
    }
}
