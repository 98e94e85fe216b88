//! Bit-vector operations over one block of an ext2 bitmap
//!
//! Bit `n` lives in byte `n / 8` at position `n % 8`, least significant
//! first. A set bit marks the block or inode as used.

use crate::{Ext2Error, Result};

/// Decompose a bit index into (byte_pos, inner_pos)
fn decomposition(bit: usize) -> (usize, usize) {
    (bit / 8, bit % 8)
}

/// Mark `bit` as used
///
/// Setting a bit that is already set is a bug in the caller and panics.
pub fn set(bits: &mut [u8], bit: usize) -> Result<()> {
    let (byte_pos, inner_pos) = decomposition(bit);
    let byte = bits.get_mut(byte_pos).ok_or(Ext2Error::OutOfRange)?;
    assert!(*byte & (1u8 << inner_pos) == 0, "bit {} already set", bit);
    *byte |= 1u8 << inner_pos;
    Ok(())
}

/// Mark `bit` as free
///
/// Clearing a bit that is already clear is a bug in the caller and panics.
pub fn unset(bits: &mut [u8], bit: usize) -> Result<()> {
    let (byte_pos, inner_pos) = decomposition(bit);
    let byte = bits.get_mut(byte_pos).ok_or(Ext2Error::OutOfRange)?;
    assert!(*byte & (1u8 << inner_pos) != 0, "bit {} already clear", bit);
    *byte &= !(1u8 << inner_pos);
    Ok(())
}

/// Whether `bit` is set
pub fn is_set(bits: &[u8], bit: usize) -> Result<bool> {
    let (byte_pos, inner_pos) = decomposition(bit);
    let byte = bits.get(byte_pos).ok_or(Ext2Error::OutOfRange)?;
    Ok(*byte & (1u8 << inner_pos) != 0)
}

/// Index of the lowest clear bit
pub fn find_first_free(bits: &[u8]) -> Result<usize> {
    bits.iter()
        .enumerate()
        .find(|(_, byte)| **byte != u8::MAX)
        .map(|(byte_pos, byte)| byte_pos * 8 + byte.trailing_ones() as usize)
        .ok_or(Ext2Error::NoSpace)
}

/// Number of set bits among the first `limit` bits
///
/// Only used to cross-check the free counters kept in the superblock and
/// the group descriptor.
pub fn count_set(bits: &[u8], limit: usize) -> usize {
    let limit = limit.min(bits.len() * 8);
    let (full_bytes, tail) = decomposition(limit);
    let mut count: usize = bits[..full_bytes]
        .iter()
        .map(|byte| byte.count_ones() as usize)
        .sum();
    if tail > 0 {
        count += (bits[full_bytes] & ((1u8 << tail) - 1)).count_ones() as usize;
    }
    count
}
