//! Bit-level building blocks shared by all frame formats.
//!
//! This module contains big-endian integer helpers for fields which are not byte aligned or which
//! have widths not covered by the standard library (24 bit AOS counters, up to 56 bit USLP
//! counters), the frame error control checksums, the CCSDS pseudo-randomizer and the forward
//! error correction codes used on the space link.
pub mod bch;
pub mod crc;
pub mod randomizer;
pub mod rs;

/// Reads a big-endian unsigned integer which is `width` bytes wide.
///
/// # Panics
///
/// The buffer must hold at least `width` bytes and `width` must not exceed 8.
pub fn read_be_uint(buf: &[u8], width: usize) -> u64 {
    buf[..width]
        .iter()
        .fold(0_u64, |acc, byte| (acc << 8) | *byte as u64)
}

/// Writes the `width` least significant bytes of `value` into the buffer in big-endian order.
///
/// # Panics
///
/// The buffer must hold at least `width` bytes and `width` must not exceed 8.
pub fn write_be_uint(buf: &mut [u8], width: usize, value: u64) {
    for (idx, byte) in buf[..width].iter_mut().enumerate() {
        *byte = (value >> (8 * (width - 1 - idx))) as u8;
    }
}

#[inline]
pub fn read_be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

#[inline]
pub fn read_be_u24(buf: &[u8]) -> u32 {
    u32::from_be_bytes([0, buf[0], buf[1], buf[2]])
}

#[inline]
pub fn read_be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[inline]
pub fn write_be_u16(buf: &mut [u8], value: u16) {
    buf[0..2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn write_be_u24(buf: &mut [u8], value: u32) {
    buf[0..3].copy_from_slice(&value.to_be_bytes()[1..4]);
}

#[inline]
pub fn write_be_u32(buf: &mut [u8], value: u32) {
    buf[0..4].copy_from_slice(&value.to_be_bytes());
}

/// Difference `current - previous` in a sequence space with the given modulus.
#[inline]
pub fn seq_distance(previous: u64, current: u64, modulus: u64) -> u64 {
    (current.wrapping_sub(previous)).wrapping_add(modulus) % modulus
}
