//! Internet checksum offload
//!
//! RFC 1071 one's-complement arithmetic over big-endian 16-bit words. TX
//! insertion writes the complemented sum; RX reports the folded sum
//! unmodified so the host can combine it with its own pseudo-header.

use crate::ring::ChecksumCommand;
use qnic_common::DescriptorFault;

/// Unfolded one's-complement accumulation of `data`
///
/// A trailing odd byte is padded with zero.
#[inline]
pub fn ones_complement_sum(data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks
        .by_ref()
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u64)
        .sum();
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

/// Fold carries into 16 bits
#[inline]
pub fn fold(mut sum: u64) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Complemented checksum of `data`
#[inline]
pub fn checksum(data: &[u8]) -> u16 {
    !fold(ones_complement_sum(data))
}

/// Apply a TX checksum command in place
///
/// Sums `[start, end)` including whatever the checksum field holds (a
/// pseudo-header seed, or zero) and overwrites the field with the
/// complement. Returns the value written.
pub fn insert_checksum(frame: &mut [u8], cmd: ChecksumCommand) -> Result<u16, DescriptorFault> {
    let start = cmd.start as usize;
    let at = cmd.insert_at();
    if start >= frame.len() || at + 2 > frame.len() {
        return Err(DescriptorFault::ChecksumOutOfRange {
            start: cmd.start as u16,
            insert: at as u16,
        });
    }
    let csum = checksum(&frame[start..]);
    frame[at..at + 2].copy_from_slice(&csum.to_be_bytes());
    Ok(csum)
}

/// Receive checksum: folded sum of everything after `skip` bytes
pub fn rx_checksum(frame: &[u8], skip: usize) -> u16 {
    frame.get(skip..).map_or(0, |payload| fold(ones_complement_sum(payload)))
}
