//! Pluggable fixed-width key and value codecs.

use std::marker::PhantomData;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A length-exact element codec: every element occupies exactly `width()`
/// bytes, and encode and decode agree on that width.
pub trait Codec<T>: Send + Sync {
    /// Bytes per element.
    fn width(&self) -> usize;

    /// Writes `item` into the first `width()` bytes of `dst`.
    fn encode(&self, item: &T, dst: &mut [u8]);

    /// Reads one element from the first `width()` bytes of `src`.
    fn decode(&self, src: &[u8]) -> T;
}

/// Raw copy of the in-memory representation, native byte order.
///
/// This is the default codec. It is portable only within a single endianness;
/// substitute a portable codec where cross-endian files matter.
pub struct CopyCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CopyCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CopyCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for CopyCodec<T>
where
    T: FromBytes + IntoBytes + Immutable,
{
    fn width(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn encode(&self, item: &T, dst: &mut [u8]) {
        dst[..self.width()].copy_from_slice(item.as_bytes());
    }

    fn decode(&self, src: &[u8]) -> T {
        // The slice is width-exact by the codec contract and T has no
        // alignment requirement on reads, so this cannot fail.
        T::read_from_bytes(&src[..self.width()]).expect("width-exact raw copy")
    }
}
