// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Shared-memory message channel: a pooled segment of fixed-size slots, each
// carrying one request and one reply between two processes. The requester
// acquires a slot, writes metadata + request, and blocks (bounded by the
// configured timeout) on the slot's condition variable; the replier reads
// the request, works, and publishes the reply into the same body buffer.
//
// Failure-handling contract: the requester never blocks past its timeout —
// on expiry it flips the slot to Abend itself. A late replier checks the
// slot state under the slot lock before publishing and discards its result
// when the call is no longer live, so it can never corrupt a slot that has
// already been reused for a new call.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::{RsaShmConfig, EXPECT_MSG_RESPONSE_SIZE_DEFAULT};
use crate::error::{Result, RsaError};
use crate::msg::{MsgControl, MsgDescriptor, MsgState, SegmentHeader, SlotLayout, SEGMENT_MAGIC};
use crate::shm::{fnv1a_64, ShmOpenMode, ShmSegment};

/// One side of a shared-memory message channel.
///
/// The creating side (`create`) owns the segment and the slot pool; the
/// attaching side (`open`) maps the same segment and serves requests.
/// Both sides address slots through [`MsgDescriptor`]s, which surrounding
/// glue ships between the processes out of band.
#[derive(Debug)]
pub struct ShmChannel {
    name: String,
    segment_id: u64,
    shm: ShmSegment,
    layout: SlotLayout,
    msg_timeout: Duration,
}

impl ShmChannel {
    /// Create the shared segment and initialise the slot pool.
    ///
    /// Fails with `InvalidArgument` when the configured pool size is below
    /// the floor needed for the control structures plus a usable body per
    /// slot. Any construction failure unwinds the mapping and unlinks the
    /// segment before returning.
    pub fn create(config: &RsaShmConfig) -> Result<Self> {
        config.validate()?;
        let layout = SlotLayout::compute(
            config.pool_size,
            config.max_concurrent,
            EXPECT_MSG_RESPONSE_SIZE_DEFAULT,
        )?;

        let shm = ShmSegment::acquire(&config.server_name, config.pool_size, ShmOpenMode::Create)?;
        let segment_id = fnv1a_64(config.server_name.as_bytes());

        // The segment is not visible to a well-behaved peer until the header
        // magic is written, so plain writes are fine during init.
        unsafe {
            for idx in 0..layout.slot_count {
                let ctl = shm.as_mut_ptr().add(layout.control_offset(idx)) as *mut MsgControl;
                MsgControl::init(ctl)?;
            }
            let hdr = shm.as_mut_ptr() as *mut SegmentHeader;
            (*hdr).segment_id = segment_id;
            (*hdr).slot_count = layout.slot_count as u32;
            (*hdr).max_body_size = layout.max_body_size as u64;
            (*hdr).free_mask.store(0, Ordering::Release);
            (*hdr).magic = SEGMENT_MAGIC;
        }

        debug!(
            "rsa-shm channel: created segment {} ({} slots, {} byte bodies)",
            config.server_name, layout.slot_count, layout.max_body_size
        );

        Ok(Self {
            name: config.server_name.clone(),
            segment_id,
            shm,
            layout,
            msg_timeout: config.msg_timeout,
        })
    }

    /// Attach to an existing segment created by the peer process.
    pub fn open(name: &str) -> Result<Self> {
        let shm = ShmSegment::acquire(name, 0, ShmOpenMode::Open)?;
        if shm.size() < std::mem::size_of::<SegmentHeader>() {
            return Err(RsaError::InvalidArgument(format!(
                "segment {name} is too small to hold a channel header"
            )));
        }
        let (segment_id, slot_count, max_body_size) = unsafe {
            let hdr = &*(shm.as_ptr() as *const SegmentHeader);
            if hdr.magic != SEGMENT_MAGIC {
                return Err(RsaError::InvalidArgument(format!(
                    "segment {name} does not carry a channel header"
                )));
            }
            (hdr.segment_id, hdr.slot_count as usize, hdr.max_body_size as usize)
        };
        let expected_id = fnv1a_64(name.as_bytes());
        if segment_id != expected_id {
            return Err(RsaError::InvalidArgument(format!(
                "segment {name} carries a mismatched segment id"
            )));
        }
        let layout = SlotLayout::from_header(shm.size(), slot_count, max_body_size)?;
        Ok(Self {
            name: name.to_string(),
            segment_id,
            shm,
            layout,
            msg_timeout: Duration::from_secs(crate::config::RSA_SHM_MSG_TIMEOUT_DEFAULT_IN_S),
        })
    }

    /// Channel / segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Body capacity of one slot; metadata + request (and the reply) must
    /// each fit in this many bytes.
    pub fn max_body_size(&self) -> usize {
        self.layout.max_body_size
    }

    /// The configured requester-side wait bound.
    pub fn msg_timeout(&self) -> Duration {
        self.msg_timeout
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.shm.as_ptr() as *const SegmentHeader) }
    }

    fn control(&self, idx: usize) -> &MsgControl {
        unsafe { &*(self.shm.as_ptr().add(self.layout.control_offset(idx)) as *const MsgControl) }
    }

    fn body_ptr(&self, idx: usize) -> *mut u8 {
        unsafe { self.shm.as_mut_ptr().add(self.layout.body_offset(idx)) }
    }

    /// Check a descriptor against this segment's identity and layout.
    fn slot_index(&self, desc: &MsgDescriptor) -> Result<usize> {
        if desc.segment_id != self.segment_id {
            return Err(RsaError::InvalidArgument(
                "descriptor does not belong to this channel".into(),
            ));
        }
        let idx = self.layout.slot_of(desc.control_offset).ok_or_else(|| {
            RsaError::InvalidArgument("descriptor control offset is not a slot boundary".into())
        })?;
        if desc.control_size != self.layout.control_size
            || desc.body_offset != self.layout.body_offset(idx)
            || desc.max_body_size != self.layout.max_body_size
            || desc.metadata_size + desc.request_size > desc.max_body_size
        {
            return Err(RsaError::InvalidArgument(
                "descriptor layout does not match the segment".into(),
            ));
        }
        Ok(idx)
    }

    /// Reserve a message slot from the pool.
    ///
    /// Fails with `ResourceExhausted` once the configured maximum number of
    /// concurrent invocations is in flight; this bound is the channel's
    /// admission-control knob.
    pub fn acquire(&self) -> Result<MsgDescriptor> {
        let full: u64 = if self.layout.slot_count == 64 {
            !0
        } else {
            (1u64 << self.layout.slot_count) - 1
        };
        let mask = &self.header().free_mask;
        let idx = loop {
            let cur = mask.load(Ordering::Acquire);
            let avail = !cur & full;
            if avail == 0 {
                return Err(RsaError::ResourceExhausted(format!(
                    "all {} message slots are in flight",
                    self.layout.slot_count
                )));
            }
            let idx = avail.trailing_zeros() as usize;
            if mask
                .compare_exchange_weak(
                    cur,
                    cur | (1u64 << idx),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break idx;
            }
            std::hint::spin_loop();
        };

        // The slot is ours alone until send(); plain resets are fine.
        let ctl = self.control(idx);
        ctl.state.store(MsgState::Abend as u32, Ordering::Relaxed);
        ctl.actual_reply_size.store(0, Ordering::Relaxed);

        Ok(MsgDescriptor {
            segment_id: self.segment_id,
            control_offset: self.layout.control_offset(idx),
            control_size: self.layout.control_size,
            body_offset: self.layout.body_offset(idx),
            max_body_size: self.layout.max_body_size,
            metadata_size: 0,
            request_size: 0,
        })
    }

    /// Write metadata + request into the slot body, mark it Requesting and
    /// signal the replier.
    ///
    /// Fails with `InvalidArgument` — without touching any slot state — when
    /// the payload exceeds the slot's body capacity.
    pub fn send(&self, desc: &mut MsgDescriptor, metadata: &[u8], request: &[u8]) -> Result<()> {
        let idx = self.slot_index(desc)?;
        let total = metadata.len() + request.len();
        if total > self.layout.max_body_size {
            return Err(RsaError::InvalidArgument(format!(
                "request of {total} bytes exceeds the {} byte body capacity",
                self.layout.max_body_size
            )));
        }

        let body = self.body_ptr(idx);
        unsafe {
            std::ptr::copy_nonoverlapping(metadata.as_ptr(), body, metadata.len());
            std::ptr::copy_nonoverlapping(
                request.as_ptr(),
                body.add(metadata.len()),
                request.len(),
            );
        }
        desc.metadata_size = metadata.len();
        desc.request_size = request.len();

        let ctl = self.control(idx);
        let _guard = ctl.lock.lock()?;
        ctl.actual_reply_size.store(0, Ordering::Relaxed);
        ctl.state
            .store(MsgState::Requesting as u32, Ordering::Relaxed);
        ctl.cond.signal()?;
        Ok(())
    }

    /// Replier side: take the request out of a slot.
    ///
    /// Requires the slot to still be Requesting — `InvalidState` means the
    /// requester already abandoned the call. On success the slot moves to
    /// Replying, the informational in-progress state.
    pub fn read_request(&self, desc: &MsgDescriptor) -> Result<(Vec<u8>, Vec<u8>)> {
        let idx = self.slot_index(desc)?;
        let ctl = self.control(idx);
        let _guard = ctl.lock.lock()?;
        let state = MsgState::from_u32(ctl.state.load(Ordering::Relaxed));
        if state != MsgState::Requesting {
            return Err(RsaError::InvalidState(format!(
                "slot is {state:?}, the call was abandoned before it was read"
            )));
        }
        ctl.state.store(MsgState::Replying as u32, Ordering::Relaxed);

        let body = self.body_ptr(idx);
        let metadata = unsafe {
            std::slice::from_raw_parts(body as *const u8, desc.metadata_size).to_vec()
        };
        let request = unsafe {
            std::slice::from_raw_parts(body.add(desc.metadata_size) as *const u8, desc.request_size)
                .to_vec()
        };
        Ok((metadata, request))
    }

    /// Block until the slot is Replied or Abend, bounded by `timeout`.
    ///
    /// On expiry the requester unilaterally abandons the call: the slot is
    /// flipped to Abend under the lock and `Timeout` is returned. An Abend
    /// published by the replier surfaces as `ServiceException`.
    pub fn wait_for_reply(&self, desc: &MsgDescriptor, timeout: Duration) -> Result<Vec<u8>> {
        let idx = self.slot_index(desc)?;
        let deadline = Instant::now() + timeout;
        let ctl = self.control(idx);
        let guard = ctl.lock.lock()?;
        loop {
            match MsgState::from_u32(ctl.state.load(Ordering::Relaxed)) {
                MsgState::Replied => {
                    let n = (ctl.actual_reply_size.load(Ordering::Relaxed) as usize)
                        .min(self.layout.max_body_size);
                    let reply = unsafe {
                        std::slice::from_raw_parts(self.body_ptr(idx) as *const u8, n).to_vec()
                    };
                    return Ok(reply);
                }
                MsgState::Abend => {
                    return Err(RsaError::ServiceException(
                        "replier abended the call".into(),
                    ));
                }
                MsgState::Requesting | MsgState::Replying => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                ctl.state.store(MsgState::Abend as u32, Ordering::Relaxed);
                info!(
                    "rsa-shm channel {}: request timed out after {timeout:?}, slot abandoned",
                    self.name
                );
                return Err(RsaError::Timeout);
            }
            ctl.cond.wait(&guard, Some(remaining))?;
        }
    }

    /// Publish a response into the slot, reusing the request's body buffer.
    ///
    /// Returns `Ok(false)` — writing nothing — when the call is no longer
    /// live (the requester timed out, or the slot was already finished): a
    /// late replier must discard its result rather than touch a slot that
    /// may have been reused. An oversized response abends the call and
    /// fails with `InvalidArgument`.
    pub fn reply(&self, desc: &MsgDescriptor, response: &[u8]) -> Result<bool> {
        let idx = self.slot_index(desc)?;
        let ctl = self.control(idx);
        let _guard = ctl.lock.lock()?;
        let state = MsgState::from_u32(ctl.state.load(Ordering::Relaxed));
        if !matches!(state, MsgState::Requesting | MsgState::Replying) {
            info!(
                "rsa-shm channel {}: dropping late reply, slot is {state:?}",
                self.name
            );
            return Ok(false);
        }
        if response.len() > self.layout.max_body_size {
            ctl.state.store(MsgState::Abend as u32, Ordering::Relaxed);
            ctl.cond.signal()?;
            return Err(RsaError::InvalidArgument(format!(
                "response of {} bytes exceeds the {} byte body capacity",
                response.len(),
                self.layout.max_body_size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(response.as_ptr(), self.body_ptr(idx), response.len());
        }
        ctl.actual_reply_size
            .store(response.len() as u64, Ordering::Relaxed);
        ctl.state.store(MsgState::Replied as u32, Ordering::Relaxed);
        ctl.cond.signal()?;
        Ok(true)
    }

    /// Publish a handler failure: flips a still-live call to Abend and wakes
    /// the requester. No-op when the call already finished.
    pub fn reply_abend(&self, desc: &MsgDescriptor) -> Result<()> {
        let idx = self.slot_index(desc)?;
        let ctl = self.control(idx);
        let _guard = ctl.lock.lock()?;
        let state = MsgState::from_u32(ctl.state.load(Ordering::Relaxed));
        if matches!(state, MsgState::Requesting | MsgState::Replying) {
            ctl.state.store(MsgState::Abend as u32, Ordering::Relaxed);
            ctl.cond.signal()?;
        }
        Ok(())
    }

    /// Return the slot to the pool.
    ///
    /// Only valid once the slot is terminal (Replied or Abend) and no thread
    /// still waits on it; a non-terminal slot fails with `InvalidState`.
    pub fn release(&self, desc: &MsgDescriptor) -> Result<()> {
        let idx = self.slot_index(desc)?;
        {
            let ctl = self.control(idx);
            let _guard = ctl.lock.lock()?;
            let state = MsgState::from_u32(ctl.state.load(Ordering::Relaxed));
            if !state.is_terminal() {
                return Err(RsaError::InvalidState(format!(
                    "slot is still {state:?}, release requires a finished call"
                )));
            }
        }
        self.header()
            .free_mask
            .fetch_and(!(1u64 << idx), Ordering::AcqRel);
        Ok(())
    }
}
