//! Legacy module: six ports for older sensors, each usable as an analog
//! input or as an I2C port.
//!
//! Port modes are flag bytes rather than plain read or write selectors, so
//! the 9V supply and digital line bits are edited in place on the staged
//! mode byte.

use std::sync::Arc;

use crate::link::{
    bytes::Registers,
    config::LinkConfig,
    controller::UsbController,
    error::{LinkError, Result},
    helpers::{check_channel, check_port, scale},
    lifecycle::DeviceHooks,
    multiplexer::{PortLayout, PortMultiplexer},
    transport::{Transport, TransportFactory, Window},
};

pub const WINDOW: Window = Window::new(0x03, 0x0D);

pub const PORT_LAYOUT: PortLayout = PortLayout {
    port_bases: &[0x10, 0x30, 0x50, 0x70, 0x90, 0xB0],
    ready_bits: &[0x01, 0x02, 0x04, 0x08, 0x10, 0x20],
    status_addr: 0x03,
    segment_key: 0,
    flag_only_segment_key: 6,
    read_mode_byte: 0x81,
    write_mode_byte: 0x01,
    max_write_latency_ms: 60,
};

pub const PORT_COUNT: usize = 6;
pub const DIGITAL_LINE_MAX: usize = 1;
pub const MAX_ANALOG_INPUT_VOLTAGE: f64 = 5.0;

const ADDRESS_ANALOG_INPUT: u8 = 0x04;
const ANALOG_INPUT_MASK: u16 = 0x3FF;

const MODE_ANALOG: u8 = 0x00;
const MODE_9V: u8 = 0x02;
const MODE_DIGITAL_LINE: [u8; DIGITAL_LINE_MAX + 1] = [0x04, 0x08];

/// Only these ports can switch their 9V supply.
const PORTS_9V: [usize; 2] = [4, 5];

pub struct LegacyModule {
    usb: UsbController,
    ports: Arc<PortMultiplexer>,
}

impl LegacyModule {
    pub fn new(
        name: impl Into<String>,
        config: LinkConfig,
        factory: impl TransportFactory + 'static,
    ) -> Self {
        let usb = UsbController::new(name, WINDOW, config, factory);
        let ports = Arc::new(PortMultiplexer::new(PORT_LAYOUT, usb.gate().clone()));
        usb.hub().set_listener(ports.clone());
        Self { usb, ports }
    }

    lifecycle_methods!();

    pub fn ports(&self) -> &Arc<PortMultiplexer> {
        &self.ports
    }

    /// Puts every port in analog read mode.
    pub fn initialize_hardware(&self) -> Result<()> {
        for port in 0..PORT_COUNT {
            self.enable_analog_read_mode(port)?;
        }
        Ok(())
    }

    /// Raw 10-bit reading of a port in analog mode.
    pub fn analog_input_raw(&self, port: usize) -> Result<u16> {
        check_port(port, PORT_COUNT)?;
        let addr = ADDRESS_ANALOG_INPUT + 2 * port as u8;
        let outcome = self.usb.gate().read(addr, 2)?;
        Ok(Registers::new(outcome.bytes()).u16_le_at(0) & ANALOG_INPUT_MASK)
    }

    pub fn analog_input_voltage(&self, port: usize) -> Result<f64> {
        let raw = self.analog_input_raw(port)?;
        Ok(scale(
            raw as f64,
            0.0,
            ANALOG_INPUT_MASK as f64,
            0.0,
            MAX_ANALOG_INPUT_VOLTAGE,
        ))
    }

    pub fn enable_analog_read_mode(&self, port: usize) -> Result<()> {
        self.ports.set_mode_byte(port, MODE_ANALOG)?;
        self.ports.write_cache_to_controller(port)
    }

    /// Switches the 9V supply of port 4 or 5.
    pub fn enable_9v(&self, port: usize, enable: bool) -> Result<()> {
        check_port(port, PORT_COUNT)?;
        if !PORTS_9V.contains(&port) {
            return Err(LinkError::NotCapable { port });
        }
        self.edit_mode_flag(port, MODE_9V, enable)
    }

    pub fn set_digital_line(&self, port: usize, line: usize, set: bool) -> Result<()> {
        check_channel("digital line", line, DIGITAL_LINE_MAX)?;
        self.edit_mode_flag(port, MODE_DIGITAL_LINE[line], set)
    }

    fn edit_mode_flag(&self, port: usize, flag: u8, set: bool) -> Result<()> {
        let mode = self.ports.update_mode_byte(port, |mode| {
            if set { mode | flag } else { mode & !flag }
        })?;
        tracing::trace!(device = %self.usb.name(), port, mode, "port mode");
        self.ports.write_cache_to_controller(port)
    }
}

impl DeviceHooks for LegacyModule {
    fn on_arm(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        self.ports.create_segments(transport)
    }
}

impl core::fmt::Debug for LegacyModule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LegacyModule")
            .field("usb", &self.usb)
            .field("ports", &self.ports)
            .finish()
    }
}
