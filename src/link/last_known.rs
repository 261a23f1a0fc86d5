use std::time::{Duration, Instant};

/// Cached copy of a value last written to or read from a register.
///
/// A valid value can expire once it is older than the freshness window; an
/// invalid value never becomes valid again on its own. Invalidating keeps
/// the stored value reachable through [`LastKnown::raw_value`].
#[derive(Debug, Clone)]
pub struct LastKnown<T> {
    value: Option<T>,
    valid: bool,
    stamped: Instant,
    freshness: Duration,
}

impl<T: Clone + PartialEq> LastKnown<T> {
    pub const DEFAULT_FRESHNESS: Duration = Duration::from_millis(500);

    pub fn new() -> Self {
        Self::with_freshness(Self::DEFAULT_FRESHNESS)
    }

    pub fn with_freshness(freshness: Duration) -> Self {
        Self {
            value: None,
            valid: false,
            stamped: Instant::now(),
            freshness,
        }
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Valid and not yet expired.
    pub fn is_valid(&self) -> bool {
        self.valid && self.stamped.elapsed() <= self.freshness
    }

    /// Value if valid and fresh.
    pub fn value(&self) -> Option<T> {
        if self.is_valid() {
            self.value.clone()
        } else {
            None
        }
    }

    /// Value if valid, ignoring freshness.
    pub fn non_timed_value(&self) -> Option<T> {
        if self.valid { self.value.clone() } else { None }
    }

    /// Stored value regardless of validity.
    pub fn raw_value(&self) -> Option<T> {
        self.value.clone()
    }

    /// Stores `value` as known and restarts the freshness window.
    /// Returns the previously stored value.
    pub fn set_value(&mut self, value: T) -> Option<T> {
        let prev = self.value.replace(value);
        self.valid = true;
        self.stamped = Instant::now();
        prev
    }

    /// Valid, fresh and equal to `value`.
    pub fn is_value(&self, value: &T) -> bool {
        self.is_valid() && self.value.as_ref() == Some(value)
    }

    /// Stores `value` unless it is already the valid, fresh value.
    /// Returns whether the caller needs to act on a change.
    pub fn update_value(&mut self, value: T) -> bool {
        if self.is_value(&value) {
            false
        } else {
            self.set_value(value);
            true
        }
    }
}

impl<T: Clone + PartialEq> Default for LastKnown<T> {
    fn default() -> Self {
        Self::new()
    }
}
