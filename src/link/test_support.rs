//! Rigs and recorders shared by the unit tests.

use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::link::{
    causality::CausalityController,
    config::LinkConfig,
    devices::{DeviceInterfaceModule, LegacyModule, MotorController, ServoController},
    helpers::REGISTER_SPACE,
    multiplexer::{PortReadyBeginEnd, PortReadyCallback},
    transport::{Firmware, SimulatedFactory, SimulatedLink},
};

/// Long enough for a handful of simulated cycles.
pub const SETTLE: Duration = Duration::from_millis(50);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_config() -> LinkConfig {
    LinkConfig {
        pretend_transaction_delay_us: 200,
        ..LinkConfig::default()
    }
}

/// Waits out two read cycles: one to carry whatever was queued, one to read
/// it back.
pub fn settle(gate: &Arc<CausalityController>) {
    for _ in 0..2 {
        gate.wait_for_next_read_completed();
    }
}

pub fn unavailable_factory() -> SimulatedFactory {
    let factory = SimulatedFactory::new(Arc::new(SimulatedLink::new()));
    factory.set_available(false);
    factory
}

/// Forwards every ready port to a channel.
pub struct RecordingCallback(Mutex<mpsc::Sender<usize>>);

impl RecordingCallback {
    pub fn new() -> (Self, mpsc::Receiver<usize>) {
        let (tx, rx) = mpsc::channel();
        (Self(Mutex::new(tx)), rx)
    }
}

impl PortReadyCallback for RecordingCallback {
    fn port_is_ready(&self, port: usize) {
        let _ = self.0.lock().send(port);
    }
}

/// Sends `(port, true)` on begin and `(port, false)` on end.
pub struct RecordingBeginEnd(Mutex<mpsc::Sender<(usize, bool)>>);

impl RecordingBeginEnd {
    pub fn new() -> (Self, mpsc::Receiver<(usize, bool)>) {
        let (tx, rx) = mpsc::channel();
        (Self(Mutex::new(tx)), rx)
    }
}

impl PortReadyBeginEnd for RecordingBeginEnd {
    fn on_port_ready_begin(&self, port: usize) {
        let _ = self.0.lock().send((port, true));
    }

    fn on_port_ready_end(&self, port: usize) {
        let _ = self.0.lock().send((port, false));
    }
}

const MOTOR_MODE: [usize; 2] = [0x44, 0x47];
const MOTOR_ENCODER: [usize; 2] = [0x4C, 0x50];
const RESET_MODE: u8 = 0x03;

/// Motor firmware that clears an encoder a fixed number of reads after a
/// reset mode lands.
pub struct MotorFirmware {
    reads: u32,
    last_mode: [u8; 2],
    countdown: [Option<u32>; 2],
}

impl MotorFirmware {
    pub fn new(reads: u32) -> Self {
        Self {
            reads,
            last_mode: [0; 2],
            countdown: [None; 2],
        }
    }
}

fn covers(addr: u8, len: usize, target: usize) -> bool {
    (addr as usize..addr as usize + len).contains(&target)
}

impl Firmware for MotorFirmware {
    fn on_write(&mut self, addr: u8, bytes: &[u8], regs: &mut [u8; REGISTER_SPACE]) {
        for motor in 0..2 {
            if !covers(addr, bytes.len(), MOTOR_MODE[motor]) {
                continue;
            }
            let mode = regs[MOTOR_MODE[motor]] & RESET_MODE;
            // Window writes repeat the mode byte; only a change starts a reset
            if mode == RESET_MODE && self.last_mode[motor] != RESET_MODE {
                self.countdown[motor] = Some(self.reads);
            }
            self.last_mode[motor] = mode;
        }
    }

    fn on_read(&mut self, addr: u8, len: usize, regs: &mut [u8; REGISTER_SPACE]) {
        for motor in 0..2 {
            let encoder = MOTOR_ENCODER[motor];
            if !covers(addr, len, encoder) {
                continue;
            }
            if let Some(left) = self.countdown[motor] {
                if left <= 1 {
                    regs[encoder..encoder + 4].fill(0);
                    self.countdown[motor] = None;
                } else {
                    self.countdown[motor] = Some(left - 1);
                }
            }
        }
    }
}

fn simulated_link(read_only: (u8, usize)) -> Arc<SimulatedLink> {
    init_tracing();
    let link = Arc::new(SimulatedLink::new());
    link.set_read_only(read_only.0, read_only.1).unwrap();
    link
}

/// Armed motor controller; encoders and battery are device-driven.
pub fn armed_motor_controller() -> (MotorController, Arc<SimulatedLink>) {
    let link = simulated_link((0x4C, 10));
    let motors = MotorController::new(
        "motor rig",
        fast_config(),
        SimulatedFactory::new(link.clone()),
    );
    motors.arm().unwrap();
    (motors, link)
}

pub fn armed_servo_controller() -> (ServoController, Arc<SimulatedLink>) {
    init_tracing();
    let link = Arc::new(SimulatedLink::new());
    let servos = ServoController::new(
        "servo rig",
        fast_config(),
        SimulatedFactory::new(link.clone()),
    );
    servos.arm().unwrap();
    (servos, link)
}

/// Armed interface module; status, analog inputs and digital inputs are
/// device-driven.
pub fn armed_interface_module() -> (DeviceInterfaceModule, Arc<SimulatedLink>) {
    let link = simulated_link((0x03, 0x12));
    let module = DeviceInterfaceModule::new(
        "interface rig",
        fast_config(),
        SimulatedFactory::new(link.clone()),
    );
    module.arm().unwrap();
    (module, link)
}

pub fn armed_legacy_module() -> (LegacyModule, Arc<SimulatedLink>) {
    let link = simulated_link((0x03, 0x0D));
    let legacy = LegacyModule::new(
        "legacy rig",
        fast_config(),
        SimulatedFactory::new(link.clone()),
    );
    legacy.arm().unwrap();
    (legacy, link)
}
