//! Type-safe wrappers for protocol primitives.
//!
//! These newtypes prevent mixing up values that share an underlying
//! representation but carry different semantic meanings: a generation
//! is not a session epoch, even though both are u64s on the wire.

use std::fmt;
use std::sync::Arc;

use bytes::BufMut;

use crate::encode::ToByte;
use crate::error::Result;

/// Stable identity of a cluster member.
///
/// Declared by the peer in its Join handshake and retained for the life
/// of the session. The registry guarantees no two live sessions carry the
/// same identity at once.
///
/// Backed by `Arc<str>` so the id can be cloned freely in routing paths
/// and table scans without reallocating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(Arc<str>);

impl ServerId {
    /// Borrow the raw identity string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        ServerId(Arc::from(value))
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        ServerId(Arc::from(value.as_str()))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for ServerId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

/// Coordinate key of a fixed-size partition of world space.
///
/// Regions are never created or destroyed; the universe of regions is
/// implicit in the coordinates in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        RegionPos { x, z }
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

impl ToByte for RegionPos {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(self.x);
        buffer.put_i32(self.z);
        Ok(())
    }
}

/// Per-region fencing token.
///
/// Strictly increases on every reassignment of the region. A message
/// referencing an older generation than the ownership table's current one
/// is stale and must be dropped, never honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    /// Generation of a region's first assignment.
    pub const INITIAL: Self = Generation(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Generation(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The generation after one reassignment.
    #[inline]
    pub const fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl From<u64> for Generation {
    fn from(value: u64) -> Self {
        Generation(value)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for Generation {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_u64(self.0);
        Ok(())
    }
}

/// Process-wide monotonic id stamped on every admitted session.
///
/// A reconnect produces a fresh epoch; events referencing a superseded
/// epoch (a late disconnect notice, a stale loss report) are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionEpoch(pub u64);

impl SessionEpoch {
    #[inline]
    pub const fn new(value: u64) -> Self {
        SessionEpoch(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Load sample carried in every Heartbeat frame.
///
/// Servers report their average tick length, ticks per second, and how
/// many regions they currently simulate. The master's own heartbeats
/// carry an all-zero report.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadReport {
    /// Average tick length in milliseconds.
    pub tick_millis: f64,
    /// Ticks per second the server is sustaining.
    pub tps: f32,
    /// Number of regions the server currently simulates.
    pub owned_regions: u64,
}

impl LoadReport {
    pub const fn new(tick_millis: f64, tps: f32, owned_regions: u64) -> Self {
        LoadReport {
            tick_millis,
            tps,
            owned_regions,
        }
    }
}

impl ToByte for LoadReport {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_f64(self.tick_millis);
        buffer.put_f32(self.tps);
        buffer.put_u64(self.owned_regions);
        Ok(())
    }
}
