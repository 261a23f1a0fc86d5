//! Address-range and value-scaling helpers shared by the transport and the
//! drivers.

use crate::link::error::{LinkError, Result};

/// Size of a controller module's register space in bytes.
pub const REGISTER_SPACE: usize = 256;

/// Calculates the byte offset range for an address and length.
///
/// Returns `(start_offset, end_offset)` where end is exclusive,
/// or an error if the range is invalid.
///
/// # Type Parameters
/// * `TS` - Total size of the addressed space
///
/// # Errors
/// * [`LinkError::ZeroLength`] - if `len` is 0
/// * [`LinkError::OutOfBounds`] - if the range runs past `TS`
///
/// # Example
/// ```
/// use usb_register_sync::link::helpers::range_span;
///
/// assert_eq!(range_span::<256>(0x30, 32).unwrap(), (0x30, 0x50));
/// assert!(range_span::<256>(0xF0, 32).is_err());
/// ```
pub fn range_span<const TS: usize>(addr: u8, len: usize) -> Result<(usize, usize)> {
    if len == 0 {
        return Err(LinkError::ZeroLength);
    }

    let offset = addr as usize;
    let end = offset
        .checked_add(len)
        .ok_or(LinkError::OutOfBounds { addr, len })?;

    if end > TS {
        return Err(LinkError::OutOfBounds { addr, len });
    }

    Ok((offset, end))
}

/// Rejects an index outside `0..count`.
pub fn check_port(port: usize, count: usize) -> Result<()> {
    if port >= count {
        return Err(LinkError::InvalidPort { port, count });
    }
    Ok(())
}

/// Rejects an index outside `first..=last`.
pub fn check_sub_device(index: usize, first: usize, last: usize) -> Result<()> {
    if index < first || index > last {
        return Err(LinkError::InvalidSubDevice { index, first, last });
    }
    Ok(())
}

/// Rejects a channel outside `0..=max`.
pub fn check_channel(what: &'static str, channel: usize, max: usize) -> Result<()> {
    if channel > max {
        return Err(LinkError::InvalidChannel { what, channel, max });
    }
    Ok(())
}

/// Linearly maps `value` from `[min_in, max_in]` onto `[min_out, max_out]`.
pub fn scale(value: f64, min_in: f64, max_in: f64, min_out: f64, max_out: f64) -> f64 {
    let slope = (max_out - min_out) / (max_in - min_in);
    min_out + (value - min_in) * slope
}

/// Clips `value` into `[min, max]` and rejects NaN.
pub fn clip_checked(what: &'static str, value: f64, min: f64, max: f64) -> Result<f64> {
    if value.is_nan() {
        return Err(LinkError::InvalidValue { what, value });
    }
    Ok(value.clamp(min, max))
}
