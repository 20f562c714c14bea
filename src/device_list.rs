use std::fmt;

use crate::{
    device::{DeviceId, DeviceRef},
    error::StatusError,
};

/// Size of one `{id, size}` record header.
pub const HEADER_SIZE: usize = 8;

fn padded(size: usize) -> usize {
    (size + 3) & !3
}

struct Node {
    device: DeviceRef,
    id: DeviceId,
    count: u32,
}

/// Registry of the machine's devices, in insertion order.
///
/// Registering the same id again bumps a use count; the entry goes away when
/// every registration has been removed. The list is also the save-state
/// codec: a sequence of `{u32 id, u32 size}` headers each followed by the
/// device blob padded to 4 bytes, ended by an all-zero header.
#[derive(Default)]
pub struct DeviceList {
    nodes: Vec<Node>,
}

impl fmt::Debug for DeviceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| (n.id, n.count)))
            .finish()
    }
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Returns the use count of its id afterwards.
    pub fn add(&mut self, device: DeviceRef) -> u32 {
        let id = device.borrow().id();
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.count += 1;
            return node.count;
        }
        tracing::debug!("[DEVLIST] Add {}", id);
        self.nodes.push(Node {
            device,
            id,
            count: 1,
        });
        1
    }

    pub fn del(&mut self, device: &DeviceRef) -> bool {
        let id = device.borrow().id();
        self.del_id(id)
    }

    /// Drop one registration of `id`. Returns false if the id is unknown.
    pub fn del_id(&mut self, id: DeviceId) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.id == id) else {
            return false;
        };
        self.nodes[pos].count -= 1;
        if self.nodes[pos].count == 0 {
            tracing::debug!("[DEVLIST] Remove {}", id);
            self.nodes.remove(pos);
        }
        true
    }

    pub fn find(&self, id: DeviceId) -> Option<DeviceRef> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.device.clone())
    }

    pub fn count(&self, id: DeviceId) -> u32 {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Bytes needed by [`save_status`](Self::save_status).
    pub fn status_size(&self) -> usize {
        let records: usize = self
            .nodes
            .iter()
            .map(|n| n.device.borrow().status_size())
            .filter(|&size| size > 0)
            .map(|size| HEADER_SIZE + padded(size))
            .sum();
        records + HEADER_SIZE
    }

    /// Serialise every stateful device in registration order.
    pub fn save_status(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.status_size());
        for node in &self.nodes {
            let dev = node.device.borrow();
            let size = dev.status_size();
            if size == 0 {
                continue;
            }
            out.extend_from_slice(&node.id.raw().to_le_bytes());
            out.extend_from_slice(&(size as u32).to_le_bytes());
            let start = out.len();
            out.resize(start + padded(size), 0);
            if !dev.save_status(&mut out[start..start + size]) {
                tracing::warn!("[DEVLIST] {} failed to save its state", node.id);
            }
        }
        out.extend_from_slice(&[0; HEADER_SIZE]);
        out
    }

    /// Verify a state stream against the registered devices without touching them.
    ///
    /// Records for ids not registered here are skipped.
    pub fn check_status(&self, data: &[u8]) -> Result<(), StatusError> {
        for record in Records::new(data) {
            let (id, blob) = record?;
            if let Some(dev) = self.find(id) {
                let expected = dev.borrow().status_size();
                if expected != blob.len() {
                    return Err(StatusError::SizeMismatch {
                        id,
                        expected,
                        found: blob.len(),
                    });
                }
            } else {
                tracing::debug!("[DEVLIST] Skipping state of unknown device {}", id);
            }
        }
        Ok(())
    }

    /// Restore device state. The stream is checked first, so a stream that
    /// does not fit fails before any device is modified.
    pub fn load_status(&self, data: &[u8]) -> Result<(), StatusError> {
        self.check_status(data)?;
        for record in Records::new(data) {
            let (id, blob) = record?;
            if let Some(dev) = self.find(id) {
                if !dev.borrow_mut().load_status(blob) {
                    tracing::warn!("[DEVLIST] {} rejected its state", id);
                    return Err(StatusError::Rejected(id));
                }
            }
        }
        Ok(())
    }
}

/// Iterator over `(id, blob)` records of a state stream.
struct Records<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Records<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            done: false,
        }
    }

    fn u32_at(&self, at: usize) -> Option<u32> {
        self.data
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(DeviceId, &'a [u8]), StatusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (Some(id), Some(size)) = (self.u32_at(self.pos), self.u32_at(self.pos + 4)) else {
            self.done = true;
            return Some(Err(StatusError::Unterminated));
        };
        let id = DeviceId::from_raw(id);
        if id.is_none() {
            self.done = true;
            return None;
        }
        let start = self.pos + HEADER_SIZE;
        let size = size as usize;
        let Some(blob) = self.data.get(start..start + size) else {
            self.done = true;
            return Some(Err(StatusError::Truncated(self.pos)));
        };
        self.pos = start + padded(size);
        Some(Ok((id, blob)))
    }
}
