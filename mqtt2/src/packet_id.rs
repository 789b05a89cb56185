//! Packet identifier allocation.
//!
//! An identifier stays reserved from the moment an exchange opens until the
//! exchange closes, so no two open exchanges ever share one.

use std::collections::HashSet;

/// Allocates non-zero 16-bit packet identifiers.
#[derive(Debug)]
pub(crate) struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Reserve the next free identifier, or `None` when all 65535 are taken.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.in_use.len() >= u16::MAX as usize {
            return None;
        }

        loop {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if self.in_use.insert(id) {
                return Some(id);
            }
        }
    }

    /// Free an identifier once its exchange has closed.
    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    #[cfg(test)]
    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    #[cfg(test)]
    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Free every identifier.
    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}
