//! Bounded integer pools for host ports and broker client ids.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Which scarce resource a pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Host TCP port the gateway container publishes its API on.
    Port,
    /// Broker API client id.
    ClientId,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port => write!(f, "port"),
            Self::ClientId => write!(f, "client_id"),
        }
    }
}

/// Values a [`ResourcePool`] can hold.
pub trait PoolValue: Copy + Ord + fmt::Display + Into<u64> + TryFrom<u64> {}

impl PoolValue for u16 {}
impl PoolValue for u32 {}

/// An inclusive integer range with an allocate/release contract.
///
/// Allocation always returns the lowest free value. Exhaustion is an error,
/// never a wraparound.
#[derive(Debug, Clone)]
pub struct ResourcePool<T: PoolValue> {
    kind: ResourceKind,
    range_start: T,
    range_end: T,
    used: BTreeSet<T>,
}

/// Pool of host ports.
pub type PortPool = ResourcePool<u16>;

/// Pool of broker client ids.
pub type ClientIdPool = ResourcePool<u32>;

impl<T: PoolValue> ResourcePool<T> {
    /// Create an empty pool over `range_start..=range_end`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the range is inverted.
    pub fn new(kind: ResourceKind, range_start: T, range_end: T) -> GatewayResult<Self> {
        if range_start > range_end {
            return Err(GatewayError::Config(format!(
                "{kind} range start {range_start} is after end {range_end}"
            )));
        }
        Ok(Self {
            kind,
            range_start,
            range_end,
            used: BTreeSet::new(),
        })
    }

    /// Reserve the lowest unused value.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ResourceExhausted`] when every value is taken.
    pub fn allocate(&mut self) -> GatewayResult<T> {
        let start: u64 = self.range_start.into();
        let end: u64 = self.range_end.into();

        let free = (start..=end)
            .filter_map(|raw| T::try_from(raw).ok())
            .find(|candidate| !self.used.contains(candidate));

        match free {
            Some(value) => {
                self.used.insert(value);
                Ok(value)
            },
            None => Err(GatewayError::ResourceExhausted {
                resource: self.kind,
                range_start: start,
                range_end: end,
            }),
        }
    }

    /// Return `value` to the pool. Releasing a value not held is a no-op.
    ///
    /// Returns whether the value was held.
    pub fn release(&mut self, value: T) -> bool {
        self.used.remove(&value)
    }

    /// Whether `value` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, value: T) -> bool {
        self.used.contains(&value)
    }

    /// Release every value.
    pub fn clear(&mut self) {
        self.used.clear();
    }

    /// Which resource this pool holds.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Total number of values in the range.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        let start: u64 = self.range_start.into();
        let end: u64 = self.range_end.into();
        end.saturating_sub(start).saturating_add(1)
    }

    /// Number of values currently allocated.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    /// Number of values still free.
    #[must_use]
    pub fn available(&self) -> u64 {
        let in_use = u64::try_from(self.used.len()).unwrap_or(u64::MAX);
        self.capacity().saturating_sub(in_use)
    }

    /// Sorted snapshot of the allocated values.
    #[must_use]
    pub fn used(&self) -> Vec<T> {
        self.used.iter().copied().collect()
    }
}
