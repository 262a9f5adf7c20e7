//! Bounded circular packet store
//!
//! Packets are written at `add_ptr` and drained at `send_ptr`; both advance
//! modulo the capacity. A packet stays in its slot after it has been sent so
//! it can be looked up for retransmission until the producer wraps around and
//! overwrites it. The slot for a sequence number is `sequence mod capacity`,
//! which holds as long as the producer appends consecutive sequences.

use crate::error::ConduitError;
use crate::types::Packet;

#[cfg(feature = "logging")]
use tracing::debug;

/// Fixed-capacity ring of packets awaiting (re)transmission
#[derive(Debug)]
pub struct PacketStore {
    slots: Vec<Option<Packet>>,
    mask: usize,
    add_ptr: usize,
    send_ptr: usize,
    count: usize,
}

impl PacketStore {
    /// Create an empty store
    ///
    /// `capacity` must be a power of two and at least 2.
    pub fn new(capacity: usize) -> Result<Self, ConduitError> {
        Self::starting_at(capacity, 0)
    }

    /// Create an empty store whose first append will carry `sequence`
    pub fn starting_at(capacity: usize, sequence: u16) -> Result<Self, ConduitError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(ConduitError::InvalidParameter(format!(
                "store capacity {} is not a power of two >= 2",
                capacity
            )));
        }
        if capacity > 1 << 16 {
            return Err(ConduitError::InvalidParameter(format!(
                "store capacity {} exceeds the sequence space",
                capacity
            )));
        }

        let mask = capacity - 1;
        let start = sequence as usize & mask;
        Ok(Self {
            slots: vec![None; capacity],
            mask,
            add_ptr: start,
            send_ptr: start,
            count: 0,
        })
    }

    /// Slot that holds `sequence`
    #[inline]
    fn slot_of(&self, sequence: u16) -> usize {
        sequence as usize & self.mask
    }

    /// Append a packet at the producer pointer
    ///
    /// Fails with `StoreFull` when every slot holds an unsent packet; the
    /// store is left untouched in that case.
    pub fn append(&mut self, packet: Packet) -> Result<(), ConduitError> {
        if self.count >= self.capacity() {
            return Err(ConduitError::StoreFull {
                capacity: self.capacity(),
            });
        }

        let slot = self.slot_of(packet.header.sequence);
        if slot != self.add_ptr {
            return Err(ConduitError::InvalidParameter(format!(
                "sequence {} maps to slot {} but the producer is at slot {}",
                packet.header.sequence, slot, self.add_ptr
            )));
        }

        self.slots[self.add_ptr] = Some(packet);
        self.add_ptr = (self.add_ptr + 1) & self.mask;
        self.count += 1;
        Ok(())
    }

    /// Take the next unsent packet
    ///
    /// The packet remains in its slot for later retransmission.
    pub fn pop_for_send(&mut self) -> Result<Packet, ConduitError> {
        if self.count == 0 {
            return Err(ConduitError::Empty);
        }

        let packet = self.slots[self.send_ptr]
            .clone()
            .ok_or(ConduitError::Empty)?;
        self.send_ptr = (self.send_ptr + 1) & self.mask;
        self.count -= 1;
        Ok(packet)
    }

    /// Look up a packet by sequence for retransmission
    ///
    /// Returns `NotFound` when the slot has been overwritten by a later
    /// sequence (or never written), never a different packet.
    pub fn lookup(&self, sequence: u16) -> Result<&Packet, ConduitError> {
        match &self.slots[self.slot_of(sequence)] {
            Some(packet) if packet.header.sequence == sequence => Ok(packet),
            _ => Err(ConduitError::NotFound(sequence)),
        }
    }

    /// Drop every queued-but-unsent packet
    ///
    /// Returns the number of packets skipped. Skipped packets remain
    /// available to [`lookup`](Self::lookup).
    pub fn skip_to_head(&mut self) -> usize {
        let skipped = self.count;
        self.send_ptr = self.add_ptr;
        self.count = 0;

        #[cfg(feature = "logging")]
        if skipped > 0 {
            debug!("Skipped {} unsent packets", skipped);
        }

        skipped
    }

    /// Number of queued-but-unsent packets
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if nothing is queued for sending
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free slots before `append` fails
    pub fn available(&self) -> usize {
        self.capacity() - self.count
    }

    /// Producer pointer
    pub fn add_ptr(&self) -> usize {
        self.add_ptr
    }

    /// Consumer pointer
    pub fn send_ptr(&self) -> usize {
        self.send_ptr
    }
}
