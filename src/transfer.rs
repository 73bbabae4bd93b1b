//! WRITE solicited-data transfers
//!
//! A WRITE command turns into a [`WriteTransfer`]: immediate data (when
//! negotiated) fills the front of the reassembly buffer, R2Ts solicit the
//! rest in bursts of at most MaxBurstLength, and matching Data-Out PDUs are
//! absorbed until the buffer is complete. Only then is the store written and
//! the SCSI response sent.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::RESERVED_TAG;
use std::sync::atomic::{AtomicU32, Ordering};

/// Target-wide Target Transfer Tag counter
static NEXT_TARGET_TRANSFER_TAG: AtomicU32 = AtomicU32::new(0);

/// Get and increment the target-wide TTT, skipping the reserved value
/// 0xFFFFFFFF.
pub fn next_target_transfer_tag() -> u32 {
    loop {
        let tag = NEXT_TARGET_TRANSFER_TAG.fetch_add(1, Ordering::SeqCst);
        if tag != RESERVED_TAG {
            return tag;
        }
    }
}

/// The next R2T to solicit for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct R2tPlan {
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_length: u32,
}

/// Reassembly state for one in-flight WRITE command, keyed by ITT
pub struct WriteTransfer {
    itt: u32,
    lba: u64,
    block_size: u32,
    ttt: u32,
    buf: Vec<u8>,
    /// Highest contiguous-end watermark of absorbed bytes. Data PDUs arrive
    /// in order (DataPDUInOrder=Yes is always negotiated), so a watermark is
    /// enough to detect completion.
    bytes_received: u32,
    /// Offset the next R2T will solicit from
    next_r2t_offset: u32,
    r2t_sn: u32,
}

impl WriteTransfer {
    pub fn new(itt: u32, lba: u64, blocks: u32, block_size: u32) -> Self {
        let total = blocks as usize * block_size as usize;
        WriteTransfer {
            itt,
            lba,
            block_size,
            ttt: next_target_transfer_tag(),
            buf: vec![0u8; total],
            bytes_received: 0,
            next_r2t_offset: 0,
            r2t_sn: 0,
        }
    }

    pub fn itt(&self) -> u32 {
        self.itt
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn ttt(&self) -> u32 {
        self.ttt
    }

    pub fn total_length(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received
    }

    /// Byte offset of the transfer on the medium
    pub fn storage_offset(&self) -> u64 {
        self.lba * self.block_size as u64
    }

    /// Absorb a burst of write data at the given buffer offset (immediate
    /// data lands at offset 0, Data-Out PDUs wherever the R2T asked).
    pub fn absorb(&mut self, offset: u32, data: &[u8]) -> ScsiResult<()> {
        let end = offset as usize + data.len();
        if end > self.buf.len() {
            return Err(IscsiError::Protocol(format!(
                "Data-Out overruns transfer: offset {} + {} > {}",
                offset,
                data.len(),
                self.buf.len()
            )));
        }
        self.buf[offset as usize..end].copy_from_slice(data);
        if end as u32 > self.bytes_received {
            self.bytes_received = end as u32;
        }
        // Solicitation never re-requests bytes that arrived unsolicited
        if self.bytes_received > self.next_r2t_offset {
            self.next_r2t_offset = self.bytes_received;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received as usize >= self.buf.len()
    }

    /// Plan the next R2T, honoring the MaxBurstLength ceiling. Returns None
    /// once every byte is either received or already solicited.
    pub fn next_r2t(&mut self, max_burst_length: u32) -> Option<R2tPlan> {
        let remaining = self.total_length().checked_sub(self.next_r2t_offset)?;
        if remaining == 0 {
            return None;
        }
        let desired = remaining.min(max_burst_length);
        let plan = R2tPlan {
            r2t_sn: self.r2t_sn,
            buffer_offset: self.next_r2t_offset,
            desired_length: desired,
        };
        self.r2t_sn += 1;
        self.next_r2t_offset += desired;
        Some(plan)
    }

    /// Consume the transfer, yielding the reassembled payload
    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
