//! Fixed-length byte blocks with XOR helpers for parity computation.

use std::ops::{BitXor, BitXorAssign};


/// Upper bound on the operands handed to one XOR pass, destination included.
pub const MAX_XOR_BLOCKS: usize = 5;

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
/// Block stores one stripe unit worth of bytes.
///
/// The length is fixed when the block is created; every block a stripe
/// touches has the stripe's block size.
pub struct Block(Box<[u8]>);

impl Block {
    #[inline]
    #[must_use]
    /// `zeroed` returns a zero-filled block of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0u8; len].into_boxed_slice())
    }

    #[inline]
    #[must_use]
    /// `filled` returns a block of `len` bytes all set to `byte`.
    pub fn filled(len: usize, byte: u8) -> Self {
        Self(vec![byte; len].into_boxed_slice())
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    #[must_use]
    /// `as_bytes` returns a shared view of the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    /// `as_bytes_mut` returns a mutable view of the underlying bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    #[inline]
    /// `clear` zeroes every byte without reallocating.
    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    #[inline]
    /// `copy_from` overwrites this block with the contents of `src`.
    ///
    /// # Panics
    /// Panics if the two blocks differ in length.
    pub fn copy_from(&mut self, src: &Self) {
        assert_eq!(
            self.len(),
            src.len(),
            "block copy between {} and {} bytes",
            self.len(),
            src.len()
        );
        self.0.copy_from_slice(&src.0);
    }

    #[inline]
    /// `xor_in_place` performs an in-place XOR with another block.
    ///
    /// # Arguments
    /// * `rhs` - The block to XOR into this one.
    pub fn xor_in_place(&mut self, rhs: &Self) {
        debug_assert_eq!(self.len(), rhs.len());
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= *b;
        }
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl From<Vec<u8>> for Block {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for Block {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl BitXor<&Self> for Block {
    type Output = Self;
    #[inline]
    fn bitxor(mut self, rhs: &Self) -> Self::Output {
        self.xor_in_place(rhs);
        self
    }
}

impl BitXorAssign<&Self> for Block {
    #[inline]
    fn bitxor_assign(&mut self, rhs: &Self) {
        self.xor_in_place(rhs);
    }
}

/// `xor_blocks` folds every source block into `dest`.
///
/// Sources are consumed in passes of at most `MAX_XOR_BLOCKS - 1` operands,
/// accumulating into `dest` across passes, so the result is the same for any
/// number of disks.
///
/// # Arguments
/// * `dest` - Accumulator; its previous contents take part in the XOR.
/// * `sources` - Blocks to fold in, each counted exactly once.
pub fn xor_blocks(dest: &mut Block, sources: &[&Block]) {
    for pass in sources.chunks(MAX_XOR_BLOCKS - 1) {
        xor_pass(dest, pass);
    }
}

fn xor_pass(dest: &mut Block, pass: &[&Block]) {
    debug_assert!(pass.len() < MAX_XOR_BLOCKS);
    let out = dest.as_bytes_mut();
    for (pos, byte) in out.iter_mut().enumerate() {
        let mut acc = *byte;
        for src in pass {
            acc ^= src.0[pos];
        }
        *byte = acc;
    }
}
