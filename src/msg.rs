// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Message data model: the per-slot control block living in the shared
// segment, the descriptor handed between requester and replier, and the
// layout arithmetic partitioning the pooled segment into fixed-size slots.

use std::sync::atomic::{AtomicU32, AtomicU64};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RsaError};
use crate::sync::{SharedCond, SharedMutex};

/// State machine of one in-flight message.
///
/// `Requesting -> {Replying ->} Replied | Abend`. `Replying` is an
/// informational intermediate set by the replier while it works; `Replied`
/// and `Abend` are terminal. `Abend` is reachable from any state: requester
/// timeout, malformed request, or service invocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgState {
    Requesting = 0,
    Replying = 1,
    Replied = 2,
    Abend = 3,
}

impl MsgState {
    pub fn from_u32(v: u32) -> MsgState {
        match v {
            0 => MsgState::Requesting,
            1 => MsgState::Replying,
            2 => MsgState::Replied,
            _ => MsgState::Abend,
        }
    }

    /// Whether a slot in this state may be released back to the pool.
    pub fn is_terminal(self) -> bool {
        matches!(self, MsgState::Replied | MsgState::Abend)
    }
}

/// Per-slot control block, one per in-flight message, living in the shared
/// segment ahead of the slot's body buffer.
///
/// `state` and `actual_reply_size` are guarded by `lock`; a reader may only
/// trust `actual_reply_size` after observing `Replied` under the lock.
#[repr(C)]
pub struct MsgControl {
    pub state: AtomicU32,
    pub actual_reply_size: AtomicU64,
    pub lock: SharedMutex,
    pub cond: SharedCond,
}

impl MsgControl {
    /// Initialise a control block in place (creator side only).
    ///
    /// The initial state is `Abend` (terminal) so a freshly acquired slot can
    /// be released without ever having carried a request.
    ///
    /// # Safety
    /// `this` must point into a mapped shared segment with room and alignment
    /// for a `MsgControl`, and must be initialised exactly once per segment.
    pub unsafe fn init(this: *mut MsgControl) -> std::io::Result<()> {
        (*this).state = AtomicU32::new(MsgState::Abend as u32);
        (*this).actual_reply_size = AtomicU64::new(0);
        SharedMutex::init(std::ptr::addr_of_mut!((*this).lock))?;
        SharedCond::init(std::ptr::addr_of_mut!((*this).cond))?;
        Ok(())
    }
}

/// Describes the memory layout of one message inside the pooled segment.
///
/// Plain data: serialisable so surrounding glue can ship it to the replying
/// process out of band. The body region holds the metadata bytes followed by
/// the request bytes; the remainder (up to `max_body_size`) is reserved for
/// the reply, which reuses the same buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDescriptor {
    /// FNV-1a hash of the channel name; ties the descriptor to its segment.
    pub segment_id: u64,
    pub control_offset: usize,
    pub control_size: usize,
    pub body_offset: usize,
    pub max_body_size: usize,
    pub metadata_size: usize,
    pub request_size: usize,
}

/// Magic value stamped into the segment header ("RSAMSG01").
pub const SEGMENT_MAGIC: u64 = 0x5253414d53473031;

/// Header at the start of the pooled segment, followed by `slot_count`
/// slots of `{ MsgControl, body[max_body_size] }`.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: u64,
    pub segment_id: u64,
    pub slot_count: u32,
    _reserved: u32,
    pub max_body_size: u64,
    /// Bit set = slot in use. Acquire/release CAS on this mask is the only
    /// pool-level coordination between concurrent callers.
    pub free_mask: AtomicU64,
}

const ALIGN: usize = 8;

fn align_up(v: usize) -> usize {
    (v + ALIGN - 1) & !(ALIGN - 1)
}

fn align_down(v: usize) -> usize {
    v & !(ALIGN - 1)
}

/// Resolved slot layout for a segment of `pool_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub header_size: usize,
    pub control_size: usize,
    pub slot_stride: usize,
    pub max_body_size: usize,
    pub slot_count: usize,
}

impl SlotLayout {
    /// Partition `pool_size` bytes into `slot_count` equal slots.
    ///
    /// Fails with `InvalidArgument` when the pool is too small to leave each
    /// slot at least `min_body_size` bytes of body capacity — the "minimum
    /// floor" on the configured pool size.
    pub fn compute(pool_size: usize, slot_count: usize, min_body_size: usize) -> Result<Self> {
        let header_size = align_up(std::mem::size_of::<SegmentHeader>());
        let control_size = align_up(std::mem::size_of::<MsgControl>());
        let usable = pool_size.saturating_sub(header_size);
        let slot_stride = align_down(usable / slot_count.max(1));
        if slot_count == 0 || slot_stride <= control_size + min_body_size {
            return Err(RsaError::InvalidArgument(format!(
                "memory pool of {pool_size} bytes is below the floor for \
                 {slot_count} slots of {min_body_size}+ byte bodies"
            )));
        }
        Ok(Self {
            header_size,
            control_size,
            slot_stride,
            max_body_size: slot_stride - control_size,
            slot_count,
        })
    }

    /// Reconstruct the layout of an already-initialised segment from its
    /// header fields.
    pub fn from_header(pool_size: usize, slot_count: usize, max_body_size: usize) -> Result<Self> {
        let header_size = align_up(std::mem::size_of::<SegmentHeader>());
        let control_size = align_up(std::mem::size_of::<MsgControl>());
        let slot_stride = control_size + max_body_size;
        let end = header_size + slot_count.saturating_mul(slot_stride);
        if slot_count == 0 || slot_count > 64 || end > pool_size {
            return Err(RsaError::InvalidArgument(
                "segment header describes a layout larger than the segment".into(),
            ));
        }
        Ok(Self {
            header_size,
            control_size,
            slot_stride,
            max_body_size,
            slot_count,
        })
    }

    pub fn control_offset(&self, idx: usize) -> usize {
        self.header_size + idx * self.slot_stride
    }

    pub fn body_offset(&self, idx: usize) -> usize {
        self.control_offset(idx) + self.control_size
    }

    /// Slot index owning `control_offset`, if it addresses a slot boundary.
    pub fn slot_of(&self, control_offset: usize) -> Option<usize> {
        let rel = control_offset.checked_sub(self.header_size)?;
        if rel % self.slot_stride != 0 {
            return None;
        }
        let idx = rel / self.slot_stride;
        (idx < self.slot_count).then_some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_partitions_pool() {
        let l = SlotLayout::compute(262144, 32, 512).unwrap();
        assert!(l.max_body_size >= 512);
        assert_eq!(l.slot_stride % 8, 0);
        assert!(l.control_offset(31) + l.slot_stride <= 262144);
        assert_eq!(l.body_offset(0), l.control_offset(0) + l.control_size);
    }

    #[test]
    fn layout_rejects_pool_below_floor() {
        assert!(SlotLayout::compute(4096, 32, 512).is_err());
        assert!(SlotLayout::compute(0, 1, 512).is_err());
    }

    #[test]
    fn slot_of_roundtrip() {
        let l = SlotLayout::compute(262144, 8, 512).unwrap();
        for i in 0..8 {
            assert_eq!(l.slot_of(l.control_offset(i)), Some(i));
        }
        assert_eq!(l.slot_of(l.control_offset(0) + 1), None);
        assert_eq!(l.slot_of(l.control_offset(8)), None);
    }

    #[test]
    fn state_transitions_terminal() {
        assert!(!MsgState::Requesting.is_terminal());
        assert!(!MsgState::Replying.is_terminal());
        assert!(MsgState::Replied.is_terminal());
        assert!(MsgState::Abend.is_terminal());
        assert_eq!(MsgState::from_u32(2), MsgState::Replied);
    }
}
