//! Endpoint directory: (domain, node, port) addressing and per-endpoint
//! connection state.
//!
//! Handles are the packed triple, so they cross thread and core boundaries
//! as a plain `u32`. The directory itself is a bounded table (slab-backed,
//! at most [`MAX_ENDPOINTS`] live entries) owned by one core; resolution of
//! a handle that was never registered here, or was torn down, fails with
//! `UnknownEndpoint`.

use std::collections::HashMap;
use std::sync::Arc;

use slab::Slab;

use crate::error::{Error, Result};
use crate::fabric::MsgQueue;
use crate::session::ChannelKind;

/// Maximum live endpoints per core.
pub const MAX_ENDPOINTS: usize = 32;

/// Domain field range (8 bits in the packed handle).
pub const MAX_DOMAINS: u32 = 1 << 8;
/// Node field range (8 bits in the packed handle).
pub const MAX_NODES: u32 = 1 << 8;
/// Port field range (16 bits in the packed handle).
pub const MAX_PORTS: u32 = 1 << 16;

/// Opaque endpoint handle: `domain << 24 | node << 16 | port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(u32);

impl EndpointHandle {
    /// Pack a triple, validating each field against the configured range.
    pub fn encode(domain: u32, node: u32, port: u32) -> Result<Self> {
        if domain >= MAX_DOMAINS || node >= MAX_NODES || port >= MAX_PORTS {
            return Err(Error::InvalidAddress);
        }
        Ok(EndpointHandle((domain << 24) | (node << 16) | port))
    }

    /// Unpack into (domain, node, port).
    pub fn decode(self) -> (u32, u32, u32) {
        (self.0 >> 24, (self.0 >> 16) & 0xff, self.0 & 0xffff)
    }

    pub fn domain(self) -> u32 {
        self.0 >> 24
    }

    pub fn node(self) -> u32 {
        (self.0 >> 16) & 0xff
    }

    pub fn port(self) -> u32 {
        self.0 & 0xffff
    }

    /// Raw wire form, for passing across FFI-ish boundaries.
    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        EndpointHandle(raw)
    }
}

/// Receive-queue descriptor recorded against a connected endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RecvQueueDesc {
    pub remote: EndpointHandle,
    pub kind: ChannelKind,
}

pub(crate) struct EndpointEntry {
    pub(crate) handle: EndpointHandle,
    pub(crate) connected: bool,
    pub(crate) recv_desc: Option<RecvQueueDesc>,
    pub(crate) queue: Arc<MsgQueue>,
}

/// Bounded lookup table of this core's live endpoints.
pub struct Directory {
    domain: u32,
    node: u32,
    entries: Slab<EndpointEntry>,
    by_port: HashMap<u32, usize>,
}

impl Directory {
    pub(crate) fn new(domain: u32, node: u32) -> Self {
        Directory {
            domain,
            node,
            entries: Slab::with_capacity(MAX_ENDPOINTS),
            by_port: HashMap::new(),
        }
    }

    /// Register a local endpoint on `port`. Idempotent: registering an
    /// already-live port returns the existing handle and leaves the entry
    /// untouched, so two live handles never alias one slot.
    pub(crate) fn register(
        &mut self,
        port: u32,
        queue: impl FnOnce() -> Arc<MsgQueue>,
    ) -> Result<(EndpointHandle, bool)> {
        if port >= MAX_PORTS {
            return Err(Error::InvalidAddress);
        }
        if let Some(&key) = self.by_port.get(&port) {
            return Ok((self.entries[key].handle, false));
        }
        if self.entries.len() >= MAX_ENDPOINTS {
            return Err(Error::PoolExhausted);
        }
        let handle = EndpointHandle::encode(self.domain, self.node, port)?;
        let key = self.entries.insert(EndpointEntry {
            handle,
            connected: false,
            recv_desc: None,
            queue: queue(),
        });
        self.by_port.insert(port, key);
        Ok((handle, true))
    }

    /// Tear down a local endpoint, returning its queue for closing.
    pub(crate) fn unregister(&mut self, handle: EndpointHandle) -> Result<Arc<MsgQueue>> {
        let key = self.key_of(handle)?;
        if self.entries[key].connected {
            return Err(Error::AlreadyConnected);
        }
        let entry = self.entries.remove(key);
        self.by_port.remove(&handle.port());
        Ok(entry.queue)
    }

    /// Resolve a handle back to its triple; only handles live in this
    /// directory resolve.
    pub fn resolve(&self, handle: EndpointHandle) -> Result<(u32, u32, u32)> {
        self.key_of(handle)?;
        Ok(handle.decode())
    }

    pub(crate) fn entry(&self, handle: EndpointHandle) -> Result<&EndpointEntry> {
        let key = self.key_of(handle)?;
        Ok(&self.entries[key])
    }

    pub(crate) fn mark_connected(
        &mut self,
        handle: EndpointHandle,
        remote: EndpointHandle,
        kind: ChannelKind,
    ) -> Result<()> {
        let key = self.key_of(handle)?;
        let entry = &mut self.entries[key];
        entry.connected = true;
        entry.recv_desc = Some(RecvQueueDesc { remote, kind });
        Ok(())
    }

    pub(crate) fn mark_disconnected(&mut self, handle: EndpointHandle) -> Result<()> {
        let key = self.key_of(handle)?;
        let entry = &mut self.entries[key];
        entry.connected = false;
        entry.recv_desc = None;
        Ok(())
    }

    pub(crate) fn drain(&mut self) -> Vec<(u32, Arc<MsgQueue>)> {
        self.by_port.clear();
        self.entries
            .drain()
            .map(|entry| (entry.handle.port(), entry.queue))
            .collect()
    }

    fn key_of(&self, handle: EndpointHandle) -> Result<usize> {
        let (domain, node, port) = handle.decode();
        if domain != self.domain || node != self.node {
            return Err(Error::UnknownEndpoint);
        }
        match self.by_port.get(&port) {
            Some(&key) if self.entries[key].handle == handle => Ok(key),
            _ => Err(Error::UnknownEndpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<MsgQueue> {
        MsgQueue::new(4)
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        assert_eq!(EndpointHandle::encode(256, 0, 0), Err(Error::InvalidAddress));
        assert_eq!(EndpointHandle::encode(0, 256, 0), Err(Error::InvalidAddress));
        assert_eq!(
            EndpointHandle::encode(0, 0, 65536),
            Err(Error::InvalidAddress)
        );
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let h = EndpointHandle::encode(3, 7, 4242).unwrap();
        assert_eq!(h.decode(), (3, 7, 4242));
        assert_eq!(EndpointHandle::from_raw(h.as_raw()), h);
    }

    #[test]
    fn test_register_idempotent() {
        let mut dir = Directory::new(0, 0);
        let (h1, created1) = dir.register(101, queue).unwrap();
        let (h2, created2) = dir.register(101, queue).unwrap();
        assert_eq!(h1, h2);
        assert!(created1);
        assert!(!created2);
    }

    #[test]
    fn test_resolve_unknown() {
        let dir = Directory::new(0, 0);
        let h = EndpointHandle::encode(0, 0, 5).unwrap();
        assert_eq!(dir.resolve(h), Err(Error::UnknownEndpoint));
        // Foreign node's handle never resolves locally.
        let foreign = EndpointHandle::encode(0, 1, 5).unwrap();
        assert_eq!(dir.resolve(foreign), Err(Error::UnknownEndpoint));
    }

    #[test]
    fn test_unregister_then_resolve_fails() {
        let mut dir = Directory::new(0, 0);
        let (h, _) = dir.register(7, queue).unwrap();
        assert!(dir.resolve(h).is_ok());
        dir.unregister(h).unwrap();
        assert_eq!(dir.resolve(h), Err(Error::UnknownEndpoint));
    }

    #[test]
    fn test_unregister_connected_rejected() {
        let mut dir = Directory::new(0, 0);
        let (h, _) = dir.register(7, queue).unwrap();
        let remote = EndpointHandle::encode(0, 1, 5).unwrap();
        dir.mark_connected(h, remote, ChannelKind::Packet).unwrap();
        assert_eq!(dir.unregister(h), Err(Error::AlreadyConnected));
        dir.mark_disconnected(h).unwrap();
        assert!(dir.unregister(h).is_ok());
    }

    #[test]
    fn test_bounded_table() {
        let mut dir = Directory::new(0, 0);
        for port in 0..MAX_ENDPOINTS as u32 {
            dir.register(port, queue).unwrap();
        }
        assert_eq!(
            dir.register(MAX_ENDPOINTS as u32, queue).map(|_| ()),
            Err(Error::PoolExhausted)
        );
    }
}
