//! Core identifiers for the Bluestack host stack
//!
//! Newtypes for the integers and addresses that flow through executors,
//! state machines and the request correlator. None of them carry protocol
//! meaning on their own; profiles assign that.

use core::fmt;
use core::ops::Deref;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Signal
// ----------------------------------------------------------------------------

/// Integer tag selecting which handler a task executor invokes for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signal(u32);

impl Signal {
    /// Create a new signal tag
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Opcode
// ----------------------------------------------------------------------------

/// Protocol-defined integer identifying a message's semantic type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Opcode(u32);

impl Opcode {
    /// Create a new opcode
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Opcode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

/// Six-byte device address of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddr([u8; 6]);

impl PeerAddr {
    /// Create a new address from 6 bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build an address from a 16-bit mesh unicast address
    pub fn from_unicast(addr: u16) -> Self {
        let [hi, lo] = addr.to_be_bytes();
        Self([0, 0, 0, 0, hi, lo])
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerAddr {
    type Err = crate::StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean: String = s
            .strip_prefix("0x")
            .unwrap_or(s)
            .chars()
            .filter(|c| *c != ':')
            .collect();

        let bytes = hex::decode(&clean)
            .map_err(|_| crate::StackError::config_error(format!("invalid peer address '{s}'")))?;

        if bytes.len() != 6 {
            return Err(crate::StackError::config_error(format!(
                "peer address must be 6 bytes, got {}",
                bytes.len()
            )));
        }

        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes);
        Ok(Self(addr))
    }
}

impl Deref for PeerAddr {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Context Key
// ----------------------------------------------------------------------------

/// Scope for request correlation and bulk cancellation: a peer plus a
/// sub-session (application key index, channel, connection handle...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub peer: PeerAddr,
    pub sub_context: u16,
}

impl ContextKey {
    pub const fn new(peer: PeerAddr, sub_context: u16) -> Self {
        Self { peer, sub_context }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.sub_context)
    }
}

// ----------------------------------------------------------------------------
// Request and Timer Handles
// ----------------------------------------------------------------------------

/// Handle returned for every request that expects a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Handle for a one-shot timer armed through a [`crate::TimerService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}
