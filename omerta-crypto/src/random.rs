//! Thin wrappers over the OS CSPRNG, kept in one place so every caller in the core
//! goes through the same path (and so it can be swapped for a deterministic RNG in tests).

use rand_core::RngCore;

#[inline]
pub fn next_u64_secure() -> u64 {
    rand::rngs::OsRng.next_u64()
}

#[inline]
pub fn next_u32_secure() -> u32 {
    rand::rngs::OsRng.next_u32()
}

#[inline]
pub fn fill_bytes_secure(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

#[inline]
pub fn bytes_secure<const N: usize>() -> [u8; N] {
    let mut b = [0u8; N];
    fill_bytes_secure(&mut b);
    b
}
