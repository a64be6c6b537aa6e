//! Fixed-capacity descriptor pools
//!
//! Queue heads and transfer descriptors come from statically sized arenas
//! addressed by integer handles. A separate stack of free indices makes
//! allocation and release O(1) and never touches DMA-visible memory
//! except to reset an entry when it is handed out.

use core::marker::PhantomData;

use heapless::Vec;

use super::ehci::{PoolEntry, dma_address};

/// Handle to an entry of a [`DescriptorPool`]
pub struct Handle<T> {
    index: u8,
    _entry: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u8,
            _entry: PhantomData,
        }
    }

    /// Slot index inside the pool
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

/// Arena of `N` descriptors with a free-index stack
pub struct DescriptorPool<T: PoolEntry, const N: usize> {
    entries: [T; N],
    free: Vec<u8, N>,
    allocated: [bool; N],
}

impl<T: PoolEntry, const N: usize> DescriptorPool<T, N> {
    /// Pool with every entry free
    pub fn new() -> Self {
        let mut free = Vec::new();
        // Lowest index on top of the stack.
        for index in (0..N).rev() {
            let _ = free.push(index as u8);
        }
        Self {
            entries: core::array::from_fn(|_| T::default()),
            free,
            allocated: [false; N],
        }
    }

    /// Take a free entry, reset to its initial state
    pub fn allocate(&mut self) -> Option<Handle<T>> {
        let index = self.free.pop()? as usize;
        self.allocated[index] = true;
        self.entries[index].reset();
        Some(Handle::new(index))
    }

    /// Return an entry to the pool
    pub fn free(&mut self, handle: Handle<T>) {
        let index = handle.index();
        debug_assert!(self.allocated[index], "double free of pool entry {}", index);
        if !self.allocated[index] {
            log::warn!("pool: ignoring double free of entry {}", index);
            return;
        }
        self.allocated[index] = false;
        let _ = self.free.push(index as u8);
    }

    /// Entry behind a handle
    pub fn get(&self, handle: Handle<T>) -> &T {
        &self.entries[handle.index()]
    }

    /// Bus address of an entry
    pub fn address_of(&self, handle: Handle<T>) -> u32 {
        dma_address(self.get(handle))
    }

    /// Map a bus address back to the allocated entry it points at
    pub fn handle_at(&self, address: u32) -> Option<Handle<T>> {
        let base = dma_address(self.entries.as_ptr());
        let size = core::mem::size_of::<T>() as u32;
        let offset = address.wrapping_sub(base);
        if offset % size != 0 {
            return None;
        }
        let index = (offset / size) as usize;
        if index < N && self.allocated[index] {
            Some(Handle::new(index))
        } else {
            None
        }
    }

    /// Whether a handle is currently allocated
    pub fn is_allocated(&self, handle: Handle<T>) -> bool {
        self.allocated[handle.index()]
    }

    /// Entries still available
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total capacity
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: PoolEntry, const N: usize> Default for DescriptorPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
