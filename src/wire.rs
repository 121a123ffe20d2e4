//! Wire representation of handles.
//!
//! Peers either hand us a handle that is already a host integer, or the raw
//! bytes of a big-endian integer exactly as wide as [`HandleId`].

use crate::error::{HandleError, Result};
use crate::HandleId;

/// Width of a handle on the wire, in bytes.
pub const WIRE_HANDLE_LEN: usize = std::mem::size_of::<HandleId>();

/// A handle as received from a peer, before validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireHandle<'a> {
    /// Already decoded into host representation.
    Native(HandleId),
    /// Big-endian bytes; must be exactly [`WIRE_HANDLE_LEN`] long.
    Bytes(&'a [u8]),
}

impl From<HandleId> for WireHandle<'_> {
    fn from(handle: HandleId) -> Self {
        WireHandle::Native(handle)
    }
}

impl<'a> From<&'a [u8]> for WireHandle<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        WireHandle::Bytes(bytes)
    }
}

/// Convert a received handle into a [`HandleId`].
///
/// This only checks the shape of the input; whether the handle was ever issued
/// is for [`HandleTable::lookup`](crate::HandleTable::lookup) to decide.
pub fn decode_wire_handle(wire: WireHandle<'_>) -> Result<HandleId> {
    match wire {
        WireHandle::Native(handle) => Ok(handle),
        WireHandle::Bytes(bytes) => {
            let raw: [u8; WIRE_HANDLE_LEN] = bytes.try_into().map_err(|_| {
                HandleError::InvalidArgument(format!(
                    "wire handle must be {WIRE_HANDLE_LEN} bytes, got {}",
                    bytes.len()
                ))
            })?;
            Ok(HandleId::from_be_bytes(raw))
        }
    }
}

/// Big-endian bytes for sending `handle` to a peer.
#[inline]
pub fn encode_wire_handle(handle: HandleId) -> [u8; WIRE_HANDLE_LEN] {
    handle.to_be_bytes()
}
