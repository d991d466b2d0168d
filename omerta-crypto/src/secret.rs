use zeroize::{Zeroize, ZeroizeOnDrop};

/// A fixed-size secret byte string that is zeroed on drop.
///
/// Used for anything that must not linger in memory after it goes out of scope: derived
/// symmetric keys, shared ECDH secrets, HKDF outputs. Cloning is allowed since callers
/// sometimes need to hold a secret in more than one place (e.g. a session and its cipher
/// pool), but every clone zeroes independently when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(pub [u8; N]);

impl<const N: usize> Secret<N> {
    #[inline]
    pub fn new(b: [u8; N]) -> Self {
        Self(b)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    #[inline]
    pub fn first_n<const M: usize>(&self) -> [u8; M] {
        assert!(M <= N);
        let mut out = [0u8; M];
        out.copy_from_slice(&self.0[..M]);
        out
    }
}

impl<const N: usize> std::fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0.ct_eq(&other.0).into()
    }
}

impl<const N: usize> Eq for Secret<N> {}
