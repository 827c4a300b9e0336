//! The slice of the architecture description the analyzer depends on.

use crate::memory_location::{MemoryDomain, MemoryLocation};

/// Endianness of the target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Big,
    Little,
}

pub trait Architecture {
    fn byte_order(&self) -> Endian;

    /// Whether the location belongs to memory that code outside the analyzed function may
    /// write. Reaching definitions are not tracked through such locations.
    fn is_global_memory(&self, location: &MemoryLocation) -> bool;
}

/// An architecture description sufficient for most targets: a byte order, and the whole
/// [`MemoryDomain::Memory`] domain treated as global.
#[derive(Clone, Copy, Debug)]
pub struct GenericArchitecture {
    pub byte_order: Endian,
}

impl Architecture for GenericArchitecture {
    fn byte_order(&self) -> Endian {
        self.byte_order
    }

    fn is_global_memory(&self, location: &MemoryLocation) -> bool {
        location.domain() == MemoryDomain::Memory
    }
}
