//! Device interface module: six I2C ports plus analog, digital, LED and
//! pulse-width channels.
//!
//! The I2C ports are served by a [`PortMultiplexer`], reachable through
//! [`DeviceInterfaceModule::ports`]. Analog and pulse outputs live in their
//! own segments and are queued straight to the transport; every other
//! register goes through the write gate.

use std::sync::Arc;

use crate::link::{
    bytes::{Registers, RegistersMut},
    config::LinkConfig,
    controller::UsbController,
    error::Result,
    helpers::{check_channel, check_port, scale},
    lifecycle::DeviceHooks,
    multiplexer::{PortLayout, PortMultiplexer},
    transport::{SegmentId, Transport, TransportFactory, Window},
    wire::{AnalogOutputMode, WireByte},
};

pub const WINDOW: Window = Window::new(0x03, 0x15);

pub const I2C_LAYOUT: PortLayout = PortLayout {
    port_bases: &[0x30, 0x50, 0x70, 0x90, 0xB0, 0xD0],
    ready_bits: &[0x01, 0x02, 0x04, 0x08, 0x10, 0x20],
    status_addr: 0x03,
    segment_key: 4,
    flag_only_segment_key: 10,
    read_mode_byte: 0x80,
    write_mode_byte: 0x00,
    max_write_latency_ms: 20,
};

pub const ANALOG_INPUT_MAX: usize = 7;
pub const DIGITAL_CHANNEL_MAX: usize = 7;
pub const LED_MAX: usize = 1;
pub const OUTPUT_PORT_MAX: usize = 1;
pub const MAX_ANALOG_INPUT_VOLTAGE: f64 = 5.0;

const ADDRESS_ANALOG_INPUT: u8 = 0x04;
const ADDRESS_DIGITAL_INPUT_STATE: u8 = 0x14;
const ADDRESS_DIGITAL_IO_CONTROL: u8 = 0x15;
const ADDRESS_DIGITAL_OUTPUT_STATE: u8 = 0x16;
const ADDRESS_LED_SET: u8 = 0x17;
const LED_MASKS: [u8; LED_MAX + 1] = [0x01, 0x02];
const ANALOG_INPUT_MASK: u16 = 0x3FF;

const ADDRESS_VOLTAGE_OUTPUT: [u8; OUTPUT_PORT_MAX + 1] = [0x18, 0x1E];
const VOLTAGE_OUTPUT_SEGMENTS: [SegmentId; OUTPUT_PORT_MAX + 1] = [SegmentId(0), SegmentId(1)];
const VOLTAGE_OUTPUT_LEN: usize = 5;
const OFFSET_VOLTAGE: usize = 0;
const OFFSET_FREQUENCY: usize = 2;
const OFFSET_WAVEFORM: usize = 4;

const ADDRESS_PULSE_OUTPUT: [u8; OUTPUT_PORT_MAX + 1] = [0x24, 0x28];
const PULSE_OUTPUT_SEGMENTS: [SegmentId; OUTPUT_PORT_MAX + 1] = [SegmentId(2), SegmentId(3)];
const PULSE_OUTPUT_LEN: usize = 4;
const OFFSET_PULSE_TIME: usize = 0;
const OFFSET_PULSE_PERIOD: usize = 2;

/// Direction of a digital channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalChannelMode {
    Input,
    Output,
}

fn digital_mask(channel: usize) -> u8 {
    1 << channel
}

pub struct DeviceInterfaceModule {
    usb: UsbController,
    ports: Arc<PortMultiplexer>,
}

impl DeviceInterfaceModule {
    pub fn new(
        name: impl Into<String>,
        config: LinkConfig,
        factory: impl TransportFactory + 'static,
    ) -> Self {
        let usb = UsbController::new(name, WINDOW, config, factory);
        let ports = Arc::new(PortMultiplexer::new(I2C_LAYOUT, usb.gate().clone()));
        usb.hub().set_listener(ports.clone());
        Self { usb, ports }
    }

    lifecycle_methods!();

    /// The module's I2C ports.
    pub fn ports(&self) -> &Arc<PortMultiplexer> {
        &self.ports
    }

    pub fn analog_input_voltage(&self, channel: usize) -> Result<f64> {
        check_channel("analog input", channel, ANALOG_INPUT_MAX)?;
        let addr = ADDRESS_ANALOG_INPUT + 2 * channel as u8;
        let outcome = self.usb.gate().read(addr, 2)?;
        let ten_bits = Registers::new(outcome.bytes()).u16_le_at(0) & ANALOG_INPUT_MASK;
        Ok(scale(
            ten_bits as f64,
            0.0,
            ANALOG_INPUT_MASK as f64,
            0.0,
            MAX_ANALOG_INPUT_VOLTAGE,
        ))
    }

    pub fn digital_channel_mode(&self, channel: usize) -> Result<DigitalChannelMode> {
        check_channel("digital", channel, DIGITAL_CHANNEL_MAX)?;
        let control = self.digital_io_control_byte()?;
        Ok(if control & digital_mask(channel) != 0 {
            DigitalChannelMode::Output
        } else {
            DigitalChannelMode::Input
        })
    }

    /// Flips one direction bit, starting from the control byte last staged.
    pub fn set_digital_channel_mode(&self, channel: usize, mode: DigitalChannelMode) -> Result<()> {
        check_channel("digital", channel, DIGITAL_CHANNEL_MAX)?;
        let control = self.staged_byte(ADDRESS_DIGITAL_IO_CONTROL)?;
        let control = match mode {
            DigitalChannelMode::Output => control | digital_mask(channel),
            DigitalChannelMode::Input => control & !digital_mask(channel),
        };
        self.set_digital_io_control_byte(control)
    }

    /// Output channels report what they drive, input channels what they see.
    pub fn digital_channel_state(&self, channel: usize) -> Result<bool> {
        let byte = match self.digital_channel_mode(channel)? {
            DigitalChannelMode::Output => self.digital_output_state_byte()?,
            DigitalChannelMode::Input => self.digital_input_state_byte()?,
        };
        Ok(byte & digital_mask(channel) != 0)
    }

    /// Ignored for channels in input mode.
    pub fn set_digital_channel_state(&self, channel: usize, state: bool) -> Result<()> {
        if self.digital_channel_mode(channel)? != DigitalChannelMode::Output {
            return Ok(());
        }
        let output = self.staged_byte(ADDRESS_DIGITAL_OUTPUT_STATE)?;
        let output = if state {
            output | digital_mask(channel)
        } else {
            output & !digital_mask(channel)
        };
        self.set_digital_output_byte(output)
    }

    pub fn digital_input_state_byte(&self) -> Result<u8> {
        self.usb.gate().read8(ADDRESS_DIGITAL_INPUT_STATE)
    }

    pub fn digital_io_control_byte(&self) -> Result<u8> {
        self.usb.gate().read8(ADDRESS_DIGITAL_IO_CONTROL)
    }

    pub fn set_digital_io_control_byte(&self, control: u8) -> Result<()> {
        let _ = self.usb.gate().write8(ADDRESS_DIGITAL_IO_CONTROL, control)?;
        Ok(())
    }

    pub fn digital_output_state_byte(&self) -> Result<u8> {
        self.usb.gate().read8(ADDRESS_DIGITAL_OUTPUT_STATE)
    }

    pub fn set_digital_output_byte(&self, output: u8) -> Result<()> {
        let _ = self.usb.gate().write8(ADDRESS_DIGITAL_OUTPUT_STATE, output)?;
        Ok(())
    }

    pub fn led_state(&self, channel: usize) -> Result<bool> {
        check_channel("led", channel, LED_MAX)?;
        Ok(self.usb.gate().read8(ADDRESS_LED_SET)? & LED_MASKS[channel] != 0)
    }

    pub fn set_led(&self, channel: usize, on: bool) -> Result<()> {
        check_channel("led", channel, LED_MAX)?;
        let leds = self.staged_byte(ADDRESS_LED_SET)?;
        let leds = if on {
            leds | LED_MASKS[channel]
        } else {
            leds & !LED_MASKS[channel]
        };
        let _ = self.usb.gate().write8(ADDRESS_LED_SET, leds)?;
        Ok(())
    }

    fn staged_byte(&self, addr: u8) -> Result<u8> {
        Ok(self.usb.gate().read_from_write_cache(addr, 1)?[0])
    }

    /// Raw output level of an analog voltage port.
    pub fn set_analog_output_voltage(&self, port: usize, level: i16) -> Result<()> {
        check_port(port, OUTPUT_PORT_MAX + 1)?;
        self.update_output(VOLTAGE_OUTPUT_SEGMENTS[port], |regs| {
            regs.set_i16_le_at(OFFSET_VOLTAGE, level)
        })
    }

    pub fn set_analog_output_frequency(&self, port: usize, hertz: u16) -> Result<()> {
        check_port(port, OUTPUT_PORT_MAX + 1)?;
        self.update_output(VOLTAGE_OUTPUT_SEGMENTS[port], |regs| {
            regs.set_u16_le_at(OFFSET_FREQUENCY, hertz)
        })
    }

    pub fn set_analog_output_mode(&self, port: usize, mode: AnalogOutputMode) -> Result<()> {
        check_port(port, OUTPUT_PORT_MAX + 1)?;
        self.update_output(VOLTAGE_OUTPUT_SEGMENTS[port], |regs| {
            regs.set_u8_at(OFFSET_WAVEFORM, mode.to_wire_byte())
        })
    }

    pub fn set_pulse_width_output_time(&self, port: usize, micros: u16) -> Result<()> {
        check_port(port, OUTPUT_PORT_MAX + 1)?;
        self.update_output(PULSE_OUTPUT_SEGMENTS[port], |regs| {
            regs.set_u16_le_at(OFFSET_PULSE_TIME, micros)
        })
    }

    pub fn set_pulse_width_period(&self, port: usize, micros: u16) -> Result<()> {
        check_port(port, OUTPUT_PORT_MAX + 1)?;
        self.update_output(PULSE_OUTPUT_SEGMENTS[port], |regs| {
            regs.set_u16_le_at(OFFSET_PULSE_PERIOD, micros)
        })
    }

    // Edits an output segment and queues it. Without a transport there is
    // nothing to edit.
    fn update_output(&self, id: SegmentId, edit: impl FnOnce(&mut RegistersMut<'_>)) -> Result<()> {
        let Some(transport) = self.usb.gate().transport() else {
            return Ok(());
        };
        let segment = transport.segment(id)?;
        segment.with_write_buffer(|buf| edit(&mut RegistersMut::new(buf)));
        transport.queue_segment_write(id)
    }
}

impl DeviceHooks for DeviceInterfaceModule {
    fn on_arm(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        for port in 0..=OUTPUT_PORT_MAX {
            transport.create_segment(
                VOLTAGE_OUTPUT_SEGMENTS[port],
                ADDRESS_VOLTAGE_OUTPUT[port],
                VOLTAGE_OUTPUT_LEN,
            )?;
            transport.create_segment(
                PULSE_OUTPUT_SEGMENTS[port],
                ADDRESS_PULSE_OUTPUT[port],
                PULSE_OUTPUT_LEN,
            )?;
        }
        self.ports.create_segments(transport)
    }
}

impl core::fmt::Debug for DeviceInterfaceModule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceInterfaceModule")
            .field("usb", &self.usb)
            .field("ports", &self.ports)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::link::{
        error::LinkError,
        test_support::{self, RecordingCallback},
    };

    #[test]
    fn analog_inputs_are_ten_bit() {
        let (module, link) = test_support::armed_interface_module();
        link.poke(0x08, &[0xFF, 0xFF]).unwrap();
        link.poke(0x12, &[0x00, 0x02]).unwrap();
        test_support::settle(module.usb().gate());

        // High bits above the tenth are noise
        assert!((module.analog_input_voltage(2).unwrap() - 5.0).abs() < 1e-9);
        let expected = 512.0 / 1023.0 * 5.0;
        assert!((module.analog_input_voltage(7).unwrap() - expected).abs() < 1e-9);
        assert_eq!(
            module.analog_input_voltage(8),
            Err(LinkError::InvalidChannel {
                what: "analog input",
                channel: 8,
                max: 7
            })
        );
        module.close().unwrap();
    }

    #[test]
    fn digital_channels_follow_their_mode() {
        let (module, link) = test_support::armed_interface_module();

        module
            .set_digital_channel_mode(3, DigitalChannelMode::Output)
            .unwrap();
        module
            .set_digital_channel_mode(5, DigitalChannelMode::Output)
            .unwrap();
        module
            .set_digital_channel_mode(5, DigitalChannelMode::Input)
            .unwrap();
        assert_eq!(module.digital_io_control_byte().unwrap(), 0x08);
        assert_eq!(
            module.digital_channel_mode(3).unwrap(),
            DigitalChannelMode::Output
        );

        // Output: driven state reads back
        module.set_digital_channel_state(3, true).unwrap();
        assert!(module.digital_channel_state(3).unwrap());
        assert_eq!(module.digital_output_state_byte().unwrap(), 0x08);

        // Input: writes are ignored, the pin level is reported
        module.set_digital_channel_state(0, true).unwrap();
        assert_eq!(module.digital_output_state_byte().unwrap(), 0x08);
        link.poke(0x14, &[0x01]).unwrap();
        test_support::settle(module.usb().gate());
        assert!(module.digital_channel_state(0).unwrap());
        assert!(module.digital_channel_state(9).is_err());
        module.close().unwrap();
    }

    #[test]
    fn leds_keep_each_other() {
        let (module, _link) = test_support::armed_interface_module();

        module.set_led(1, true).unwrap();
        module.set_led(0, true).unwrap();
        module.set_led(1, false).unwrap();
        assert!(module.led_state(0).unwrap());
        assert!(!module.led_state(1).unwrap());
        assert!(module.set_led(2, true).is_err());
        module.close().unwrap();
    }

    #[test]
    fn outputs_are_little_endian_segments() {
        let (module, link) = test_support::armed_interface_module();

        module.set_analog_output_voltage(1, -500).unwrap();
        module.set_analog_output_frequency(1, 1000).unwrap();
        module
            .set_analog_output_mode(1, AnalogOutputMode::Square)
            .unwrap();
        module.set_pulse_width_output_time(0, 1500).unwrap();
        module.set_pulse_width_period(0, 20000).unwrap();
        test_support::settle(module.usb().gate());

        let volts = (-500i16).to_le_bytes();
        assert_eq!(
            link.peek(0x1E, 5).unwrap(),
            vec![volts[0], volts[1], 0xE8, 0x03, 0x02]
        );
        assert_eq!(link.peek(0x24, 4).unwrap(), vec![0xDC, 0x05, 0x20, 0x4E]);
        assert!(module.set_pulse_width_period(2, 0).is_err());
        module.close().unwrap();
    }

    #[test]
    fn i2c_ports_notify_when_ready() {
        let (module, link) = test_support::armed_interface_module();
        let ports = module.ports();
        assert_eq!(ports.port_count(), 6);
        assert_eq!(ports.max_write_latency_ms(5).unwrap(), 20);

        // Everything busy except port 4
        link.poke(0x03, &[0x2F]).unwrap();
        test_support::settle(module.usb().gate());
        let (callback, rx) = RecordingCallback::new();
        let callback = Arc::new(callback);
        ports.register_ready_callback(4, callback.clone()).unwrap();
        ports.register_ready_callback(5, callback).unwrap();

        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
        }
        module.close().unwrap();
    }

    #[test]
    fn outputs_without_a_transport_are_skipped() {
        test_support::init_tracing();
        let module = DeviceInterfaceModule::new(
            "idle module",
            test_support::fast_config(),
            test_support::unavailable_factory(),
        );
        module.set_analog_output_voltage(0, 100).unwrap();
        module.set_led(0, true).unwrap();
        assert!(!module.led_state(0).unwrap());
    }
}
