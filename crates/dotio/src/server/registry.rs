use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::{Inbound, Outbound};
use crate::frame::{FrameReader, FrameWriter};

/// One active peer connection and its stream handles.
pub struct Device {
    peer: SocketAddr,
    inbound: Inbound,
    outbound: Outbound,
    connected_at: Instant,
}

impl Device {
    /// Take ownership of `stream`. The connection closes once the device and
    /// every handle cloned from it are dropped.
    pub fn new(peer: SocketAddr, stream: TcpStream, max_frame_len: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            peer,
            inbound: Inbound::new(FrameReader::with_max_frame_len(read_half, max_frame_len)),
            outbound: Outbound::new(FrameWriter::with_max_frame_len(write_half, max_frame_len)),
            connected_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn inbound(&self) -> &Inbound {
        &self.inbound
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("peer", &self.peer)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`DeviceRegistry::get_or_create`].
#[derive(Debug)]
pub enum Registration {
    /// A new device was inserted. Dropping the guard removes it again.
    Created(DeviceGuard),
    /// A device for this peer was already live; it is returned untouched.
    Existing(Arc<Device>),
}

/// Tracks live devices by peer address.
///
/// At most one device exists per peer at a time. Safe to mutate from any number
/// of session tasks.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<SocketAddr, Arc<Device>, ahash::RandomState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live device for `peer`, or insert the one built by `make`.
    ///
    /// `make` only runs when no device is registered for `peer`.
    pub fn get_or_create<F>(self: &Arc<Self>, peer: SocketAddr, make: F) -> Registration
    where
        F: FnOnce() -> Device,
    {
        use dashmap::mapref::entry::Entry;

        let device = match self.devices.entry(peer) {
            Entry::Occupied(slot) => return Registration::Existing(Arc::clone(slot.get())),
            Entry::Vacant(slot) => {
                let device = Arc::new(make());
                slot.insert(Arc::clone(&device));
                device
            }
        };

        // the shard lock is released here; len() takes every shard lock
        debug!(peer = %peer, devices = self.devices.len(), "Device added");
        Registration::Created(DeviceGuard {
            device,
            registry: Arc::clone(self),
        })
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<Device>> {
        self.devices.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the device for `peer`. Removing an absent peer is a no-op.
    pub fn remove(&self, peer: &SocketAddr) -> Option<Arc<Device>> {
        let removed = self.devices.remove(peer).map(|(_, device)| device);
        if removed.is_some() {
            debug!(peer = %peer, devices = self.devices.len(), "Device removed");
        }
        removed
    }

    /// Remove `device` only if it is still the one registered for its peer.
    fn remove_device(&self, device: &Arc<Device>) {
        let peer = device.peer();
        if self
            .devices
            .remove_if(&peer, |_, current| Arc::ptr_eq(current, device))
            .is_some()
        {
            debug!(peer = %peer, devices = self.devices.len(), "Device removed");
        }
    }

    /// Point-in-time copy of the live devices. May be stale under concurrent churn.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.devices.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Holds a registered device. When dropped, the device is removed from the registry.
pub struct DeviceGuard {
    device: Arc<Device>,
    registry: Arc<DeviceRegistry>,
}

impl DeviceGuard {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.registry.remove_device(&self.device);
    }
}

impl fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("peer", &self.device.peer())
            .finish()
    }
}
