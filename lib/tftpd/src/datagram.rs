//! Datagram values and the factory that owns their buffer pools. A
//! datagram rents one data buffer and one ancillary (control) buffer
//! from the factory and hands both back on drop through a weak
//! back-reference. The factory must outlive every datagram it produced;
//! if it does not, the buffers are simply dropped instead of pooled.

use crate::pool::{BufferPool, Lease};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

/// Largest UDP payload; typical TFTP use stays at 516 bytes or less.
pub const DATA_BUFFER_SIZE: usize = 0xFFFF;
/// Room for receive-path ancillary data (pktinfo).
pub const CONTROL_BUFFER_SIZE: usize = 0x80;

#[inline]
fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

pub struct DatagramFactory {
    data_pool: BufferPool,
    control_pool: BufferPool,
    this: Weak<DatagramFactory>,
}

impl DatagramFactory {
    pub fn new(pool_size: usize) -> Arc<DatagramFactory> {
        Arc::new_cyclic(|this| DatagramFactory {
            data_pool: BufferPool::new(DATA_BUFFER_SIZE, pool_size),
            control_pool: BufferPool::new(CONTROL_BUFFER_SIZE, pool_size),
            this: this.clone(),
        })
    }

    /// Rents buffers for a new datagram. Pool exhaustion yields an
    /// assembly in the invalid state; callers must check `is_valid`
    /// before use.
    pub fn start_assembly(&self) -> DatagramAssembly {
        let data = self.data_pool.alloc();
        let control = self.control_pool.alloc();

        let (data, control) = match (data, control) {
            (Some(data), Some(control)) => (Some(data), Some(control)),
            (data, control) => {
                // One pool may have delivered; hand that buffer straight back.
                if let Some(lease) = data {
                    self.data_pool.free(lease);
                }
                if let Some(lease) = control {
                    self.control_pool.free(lease);
                }
                (None, None)
            }
        };

        DatagramAssembly {
            factory: self.this.clone(),
            data,
            control,
            source: unspecified(),
            dest: unspecified(),
            broadcast: false,
            data_size: 0,
        }
    }

    /// Assembles an outgoing datagram carrying `payload`, addressed back
    /// to the source of `request`. `None` when the pools are exhausted.
    pub fn build_response(&self, payload: &[u8], request: &Datagram) -> Option<Datagram> {
        let mut assembly = self.start_assembly();

        if !assembly.is_valid() || payload.len() > DATA_BUFFER_SIZE {
            return None;
        }

        assembly.data_mut()[..payload.len()].copy_from_slice(payload);
        assembly
            .set_data_size(payload.len())
            .set_destination(request.source());

        assembly.finalize()
    }

    /// Buffers currently available; equals the pool size when no
    /// datagram is outstanding.
    pub fn free_buffers(&self) -> usize {
        self.data_pool.free_count()
    }

    fn reclaim(&self, data: Lease, control: Lease) {
        self.data_pool.free(data);
        self.control_pool.free(control);
    }
}

/// Builder for one datagram: buffers first, then metadata, then
/// `finalize`. Dropping an assembly returns its buffers.
pub struct DatagramAssembly {
    factory: Weak<DatagramFactory>,
    data: Option<Lease>,
    control: Option<Lease>,
    source: SocketAddr,
    dest: SocketAddr,
    broadcast: bool,
    data_size: usize,
}

impl DatagramAssembly {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.data.is_some() && self.control.is_some()
    }

    #[inline]
    pub fn set_source(&mut self, addr: SocketAddr) -> &mut Self {
        self.source = addr;
        self
    }

    #[inline]
    pub fn set_destination(&mut self, addr: SocketAddr) -> &mut Self {
        self.dest = addr;
        self
    }

    #[inline]
    pub fn set_broadcast(&mut self, broadcast: bool) -> &mut Self {
        self.broadcast = broadcast;
        self
    }

    #[inline]
    pub fn set_data_size(&mut self, size: usize) -> &mut Self {
        debug_assert!(size <= DATA_BUFFER_SIZE);
        self.data_size = size.min(DATA_BUFFER_SIZE);
        self
    }

    /// The whole data buffer, for marshalling an outgoing message.
    /// Empty on an invalid assembly.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.data.as_mut() {
            Some(lease) => lease.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Both buffers at once, for the receive path where the data buffer
    /// takes the payload while the control buffer takes ancillary data.
    pub fn split_buffers_mut(&mut self) -> Option<(&mut [u8], &mut Vec<u8>)> {
        match (self.data.as_mut(), self.control.as_mut()) {
            (Some(data), Some(control)) => Some((data.as_mut_slice(), control.vec_mut())),
            _ => None,
        }
    }

    /// Seals the assembly into an owned datagram. `None` when the
    /// assembly never got its buffers.
    pub fn finalize(mut self) -> Option<Datagram> {
        let data = self.data.take()?;
        let control = self.control.take()?;

        Some(Datagram {
            broadcast: self.broadcast,
            source: self.source,
            dest: self.dest,
            data,
            data_size: self.data_size,
            control,
            factory: self.factory.clone(),
        })
    }
}

impl Drop for DatagramAssembly {
    fn drop(&mut self) {
        if let (Some(data), Some(control)) = (self.data.take(), self.control.take()) {
            if let Some(factory) = self.factory.upgrade() {
                factory.reclaim(data, control);
            }
        }
    }
}

/// One received or outgoing UDP payload plus its addressing metadata.
pub struct Datagram {
    broadcast: bool,
    source: SocketAddr,
    dest: SocketAddr,
    data: Lease,
    data_size: usize,
    control: Lease,
    factory: Weak<DatagramFactory>,
}

impl Datagram {
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    #[inline]
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// For a received datagram, the local address the packet arrived at,
    /// recovered from ancillary data.
    #[inline]
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data.as_slice()[..self.data_size]
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }
}

impl Drop for Datagram {
    fn drop(&mut self) {
        // Swap zero-length leases in so the real ones can move out; the
        // placeholders are never pooled because the factory reference is
        // consumed with them.
        let data = std::mem::replace(&mut self.data, Lease::placeholder());
        let control = std::mem::replace(&mut self.control, Lease::placeholder());

        if let Some(factory) = self.factory.upgrade() {
            factory.reclaim(data, control);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_datagram(factory: &DatagramFactory, payload: &[u8]) -> Datagram {
        let mut assembly = factory.start_assembly();
        assert!(assembly.is_valid());

        assembly.data_mut()[..payload.len()].copy_from_slice(payload);
        assembly.set_data_size(payload.len());
        assembly.finalize().unwrap()
    }

    #[test]
    fn test_assembly_roundtrip() {
        let factory = DatagramFactory::new(2);

        let source = "10.1.2.3:5000".parse().unwrap();
        let mut assembly = factory.start_assembly();
        assembly.data_mut()[..3].copy_from_slice(b"abc");
        assembly.set_data_size(3).set_source(source).set_broadcast(true);

        let datagram = assembly.finalize().unwrap();

        assert_eq!(datagram.data(), b"abc");
        assert_eq!(datagram.data_size(), 3);
        assert_eq!(datagram.source(), source);
        assert!(datagram.is_broadcast());
    }

    #[test]
    fn test_exhaustion_yields_invalid_assembly() {
        let factory = DatagramFactory::new(1);

        let held = make_datagram(&factory, b"x");

        let assembly = factory.start_assembly();
        assert!(!assembly.is_valid());
        assert!(assembly.finalize().is_none());

        drop(held);
        assert!(factory.start_assembly().is_valid());
    }

    #[test]
    fn test_drop_returns_buffers() {
        let factory = DatagramFactory::new(2);
        assert_eq!(factory.free_buffers(), 2);

        let first = make_datagram(&factory, b"1");
        let second = make_datagram(&factory, b"2");
        assert_eq!(factory.free_buffers(), 0);

        drop(first);
        assert_eq!(factory.free_buffers(), 1);
        drop(second);
        assert_eq!(factory.free_buffers(), 2);
    }

    #[test]
    fn test_dropped_assembly_returns_buffers() {
        let factory = DatagramFactory::new(1);

        let assembly = factory.start_assembly();
        assert!(assembly.is_valid());
        drop(assembly);

        assert_eq!(factory.free_buffers(), 1);
    }

    #[test]
    fn test_build_response_targets_request_source() {
        let factory = DatagramFactory::new(2);

        let source = "192.168.1.50:40000".parse().unwrap();
        let mut assembly = factory.start_assembly();
        assembly.set_source(source).set_data_size(0);
        let request = assembly.finalize().unwrap();

        let response = factory.build_response(b"reply", &request).unwrap();

        assert_eq!(response.dest(), source);
        assert_eq!(response.data(), b"reply");
    }

    #[test]
    fn test_datagram_outliving_factory_is_harmless() {
        let factory = DatagramFactory::new(1);
        let datagram = make_datagram(&factory, b"x");

        drop(factory);
        drop(datagram);
    }
}
