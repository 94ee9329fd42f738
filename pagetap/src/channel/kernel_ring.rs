//! User-space side of the `EVENTS` BPF ring buffer.

use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use aya::maps::{Map, MapData, RingBuf};
use aya::Ebpf;
use log::debug;

use super::{wait_readable, RecordSource};
use crate::domain::ChannelError;

/// Name of the ring buffer map in the eBPF object.
pub const EVENTS_MAP: &str = "EVENTS";

pub struct KernelRing {
    ring: RingBuf<MapData>,
    // duplicate of the map fd, kept for poll(2)
    fd: OwnedFd,
}

impl KernelRing {
    /// Take the ring buffer map out of a loaded object.
    ///
    /// # Errors
    /// [`ChannelError::MapNotFound`] if the object has no `EVENTS` map, or a
    /// map error if it is not a ring buffer.
    pub fn take(bpf: &mut Ebpf) -> Result<Self, ChannelError> {
        let map = bpf.take_map(EVENTS_MAP).ok_or(ChannelError::MapNotFound(EVENTS_MAP))?;
        Self::from_map(map)
    }

    fn from_map(map: Map) -> Result<Self, ChannelError> {
        let fd = match &map {
            Map::RingBuf(data) => data.fd().as_fd().try_clone_to_owned().map_err(ChannelError::Poll)?,
            _ => return Err(ChannelError::MapNotFound(EVENTS_MAP)),
        };
        let ring = RingBuf::try_from(map)?;
        Ok(Self { ring, fd })
    }
}

impl RecordSource for KernelRing {
    fn name(&self) -> &'static str {
        "ring"
    }

    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, ChannelError> {
        if !wait_readable(self.fd.as_fd(), timeout)? {
            return Ok(0);
        }

        let mut delivered = 0;
        while let Some(item) = self.ring.next() {
            sink(&item);
            delivered += 1;
        }
        if delivered > 0 {
            debug!("drained {delivered} ring records");
        }
        Ok(delivered)
    }
}
