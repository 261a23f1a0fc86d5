use crate::link::transport::SegmentId;

/// Errors reported by the register link and the drivers built on it.
///
/// Precondition violations (bad port, bad sub-device, oversized buffer) are
/// returned before anything is attempted. Hardware that is slow to respond
/// is never an error; it is absorbed by bounded resends.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    /// Port index outside `0..count`.
    #[error("port {port} is invalid; valid ports are 0..{}", .count.saturating_sub(1))]
    InvalidPort { port: usize, count: usize },

    /// Payload longer than the port's data region.
    #[error("buffer is too large ({len} bytes), max size is {max} bytes")]
    BufferTooLarge { len: usize, max: usize },

    /// Motor or servo index outside `first..=last`.
    #[error("sub-device {index} is invalid; valid indices are {first}..{last}")]
    InvalidSubDevice { index: usize, first: usize, last: usize },

    /// Analog, digital, LED or output channel outside `0..=max`.
    #[error("{what} channel {channel} is invalid; valid channels are 0..{max}")]
    InvalidChannel {
        what: &'static str,
        channel: usize,
        max: usize,
    },

    /// Value outside its accepted interval (or NaN).
    #[error("illegal {what} {value}")]
    InvalidValue { what: &'static str, value: f64 },

    /// Port lacks the requested capability.
    #[error("port {port} cannot supply 9v")]
    NotCapable { port: usize },

    /// Address range outside the register space, or outside what the
    /// transport keeps in sync.
    #[error("range {addr:#04x}+{len} is out of bounds")]
    OutOfBounds { addr: u8, len: usize },

    /// Operation attempted with zero length.
    #[error("operation attempted with zero length")]
    ZeroLength,

    /// No segment with this id was created.
    #[error("segment {0} does not exist")]
    UnknownSegment(SegmentId),

    /// A segment with this id already exists.
    #[error("segment {0} already exists")]
    DuplicateSegment(SegmentId),

    /// Lifecycle transition not allowed from the current state.
    #[error("illegal state: can't {op}() from state {state}")]
    IllegalState { op: &'static str, state: &'static str },

    /// No device answered when the transport was opened.
    #[error("device unavailable")]
    DeviceUnavailable,

    /// Physical link failure.
    #[error("link failure: {0}")]
    Link(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration loading errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML syntax: {0}")]
    Parse(String),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

pub type Result<T, E = LinkError> = core::result::Result<T, E>;
