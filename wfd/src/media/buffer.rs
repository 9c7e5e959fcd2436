//! Codec buffer-slot bookkeeping.
//!
//! A codec port owns a small fixed pool of buffers; at any instant every
//! slot is in exactly one ownership state, and transitions only happen
//! through explicit acknowledgments. This is the enforcement point for
//! the handoff between our actors, the codec component and the consumer
//! of decoded output.

use shared::error::{Error, Result};

/// Upper bound on slots per port.
pub const MAX_BUFFER_SLOTS: usize = 32;

/// Who may touch a buffer right now.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SlotOwner {
    /// Free for us to fill or recycle.
    Us,
    /// Handed to the codec component.
    Component,
    /// Client side: lent to the producer of input data.
    Upstream,
    /// Client side: lent to the consumer of output data.
    Downstream,
    /// Queued to the native window for display.
    NativeWindow,
}

#[derive(Debug)]
struct Slot {
    owner: SlotOwner,
    /// Fence the next reader must wait on before touching the memory.
    fence: Option<u64>,
}

/// Ownership tracker for one codec port's buffers.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Slot>,
    /// Set once end-of-stream has been signalled on this port; never
    /// cleared for the life of the session.
    saw_eos: bool,
}

impl SlotPool {
    pub fn new(count: usize) -> Result<SlotPool> {
        if count == 0 || count > MAX_BUFFER_SLOTS {
            return Err(Error::ErrInvalidOperation);
        }
        Ok(SlotPool {
            slots: (0..count)
                .map(|_| Slot {
                    owner: SlotOwner::Us,
                    fence: None,
                })
                .collect(),
            saw_eos: false,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owner(&self, index: usize) -> Option<SlotOwner> {
        self.slots.get(index).map(|s| s.owner)
    }

    /// Index of some slot we currently own, if any.
    pub fn find_owned(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.owner == SlotOwner::Us)
    }

    /// Moves a slot from `from` to `to`, attaching the fence the next
    /// owner must wait on. The transition must start from the slot's
    /// actual state; anything else is a caller bug.
    pub fn transfer(
        &mut self,
        index: usize,
        from: SlotOwner,
        to: SlotOwner,
        fence: Option<u64>,
    ) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(Error::ErrTrackIndexOutOfRange)?;

        assert_eq!(
            slot.owner, from,
            "slot {index} owned by {:?}, expected {from:?}",
            slot.owner
        );
        slot.owner = to;
        slot.fence = fence;
        Ok(())
    }

    /// Takes the fence a new owner must wait on before reading.
    pub fn take_fence(&mut self, index: usize) -> Option<u64> {
        self.slots.get_mut(index).and_then(|s| s.fence.take())
    }

    /// Records end-of-stream; monotonic for the life of the port.
    pub fn mark_eos(&mut self) {
        self.saw_eos = true;
    }

    pub fn saw_eos(&self) -> bool {
        self.saw_eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_slot_starts_owned_by_us() {
        let pool = SlotPool::new(4).unwrap();
        for i in 0..4 {
            assert_eq!(pool.owner(i), Some(SlotOwner::Us));
        }
        assert_eq!(pool.find_owned(), Some(0));
    }

    #[test]
    fn test_pool_size_limits() {
        assert!(SlotPool::new(0).is_err());
        assert!(SlotPool::new(MAX_BUFFER_SLOTS).is_ok());
        assert!(SlotPool::new(MAX_BUFFER_SLOTS + 1).is_err());
    }

    #[test]
    fn test_transfer_round_trip_with_fence() {
        let mut pool = SlotPool::new(2).unwrap();

        pool.transfer(0, SlotOwner::Us, SlotOwner::Component, None)
            .unwrap();
        assert_eq!(pool.owner(0), Some(SlotOwner::Component));
        assert_eq!(pool.find_owned(), Some(1));

        // The component returns the buffer with a fence attached; the
        // next reader must pick it up exactly once.
        pool.transfer(0, SlotOwner::Component, SlotOwner::Us, Some(7))
            .unwrap();
        assert_eq!(pool.take_fence(0), Some(7));
        assert_eq!(pool.take_fence(0), None);
    }

    #[test]
    #[should_panic(expected = "slot 0 owned by")]
    fn test_transfer_from_wrong_state_panics() {
        let mut pool = SlotPool::new(1).unwrap();
        pool.transfer(0, SlotOwner::Component, SlotOwner::Us, None)
            .unwrap();
    }

    #[test]
    fn test_eos_is_monotonic() {
        let mut pool = SlotPool::new(1).unwrap();
        assert!(!pool.saw_eos());
        pool.mark_eos();
        pool.mark_eos();
        assert!(pool.saw_eos());
    }
}
