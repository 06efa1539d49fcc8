/// Fixed-capacity, index-addressed circular store of frame-aligned slots
///
/// The buffer does no locking and no waiting. Callers own exclusivity (the
/// pipeline keeps every ring behind the shared state mutex) and decide through
/// the cursor protocol when a slot may be written or read.
use crate::error::{Result, WindowingError};

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
}

impl<T> RingBuffer<T> {
    /// Allocate a buffer of `capacity` empty slots
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(WindowingError::config("ring buffer capacity must be positive"));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            WindowingError::resource(format!("cannot allocate {} ring slots: {}", capacity, e))
        })?;
        slots.resize_with(capacity, || None);
        Ok(Self { slots })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Physical slot holding logical `index`
    pub fn slot_of(&self, index: usize) -> usize {
        index % self.capacity()
    }

    /// Store `value` at `index mod capacity`, replacing whatever was there
    pub fn write(&mut self, index: usize, value: T) {
        let slot = self.slot_of(index);
        self.slots[slot] = Some(value);
    }

    /// Value currently stored for logical `index`, if the slot was ever written
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots[self.slot_of(index)].as_ref()
    }

    /// Physical slots for `count` logical indices starting at `start`, in logical order
    pub fn sorted_slots(&self, start: usize, count: usize) -> Vec<usize> {
        (start..start + count).map(|i| self.slot_of(i)).collect()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy `count` values starting at logical `start`, walking forward with wraparound
    ///
    /// The caller must already know through the cursors that every requested
    /// slot holds live data; an empty slot is reported as an error rather than
    /// silently skipped.
    pub fn read_range(&self, start: usize, count: usize) -> Result<Vec<T>> {
        if count > self.capacity() {
            return Err(WindowingError::config(format!(
                "cannot read {} slots from a ring of capacity {}",
                count,
                self.capacity()
            )));
        }
        self.sorted_slots(start, count)
            .into_iter()
            .map(|slot| {
                self.slots[slot].clone().ok_or_else(|| {
                    WindowingError::resource(format!("ring slot {} read before it was written", slot))
                })
            })
            .collect()
    }
}
