//! Fixed-size key contract and the key types shipped with the engine

use std::fmt;

/// A totally ordered key with a constant serialized width
///
/// All keys stored in one tree share `SIZE`, which together with the page
/// size determines how many entries fit in a page. `write_to` and
/// `read_from` always receive slices of exactly `SIZE` bytes, and reading
/// back what was written must produce an equal key.
pub trait FixedKey: Ord + Clone + fmt::Debug {
    /// Serialized width in bytes
    const SIZE: usize;

    /// Serialize into `buf`
    fn write_to(&self, buf: &mut [u8]);

    /// Deserialize a fresh key from `buf`
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! impl_fixed_key_for_int {
    ($($ty:ty),*) => {
        $(
            impl FixedKey for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                    bytes.copy_from_slice(&buf[..Self::SIZE]);
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_fixed_key_for_int!(i32, i64, u32, u64);

/// Two fixed keys ordered lexicographically (first, then second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompoundKey<A, B> {
    pub first: A,
    pub second: B,
}

impl<A, B> CompoundKey<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: FixedKey, B: FixedKey> FixedKey for CompoundKey<A, B> {
    const SIZE: usize = A::SIZE + B::SIZE;

    fn write_to(&self, buf: &mut [u8]) {
        self.first.write_to(&mut buf[..A::SIZE]);
        self.second.write_to(&mut buf[A::SIZE..Self::SIZE]);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            first: A::read_from(&buf[..A::SIZE]),
            second: B::read_from(&buf[A::SIZE..Self::SIZE]),
        }
    }
}

/// A key together with the caller-supplied offset it locates
///
/// Pairs order by key first and offset second, so equal keys stay adjacent
/// and a given `(key, offset)` has exactly one place in the tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPair<K> {
    pub key: K,
    pub offset: i32,
}

impl<K> KeyPair<K> {
    pub fn new(key: K, offset: i32) -> Self {
        Self { key, offset }
    }
}

impl<K: FixedKey> KeyPair<K> {
    /// Serialized width of a pair
    pub const SIZE: usize = K::SIZE + 4;

    /// The smallest pair carrying `key`
    pub(crate) fn lower_bound(key: &K) -> Self {
        Self::new(key.clone(), i32::MIN)
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        self.key.write_to(&mut buf[..K::SIZE]);
        buf[K::SIZE..Self::SIZE].copy_from_slice(&self.offset.to_le_bytes());
    }

    pub(crate) fn read_from(buf: &[u8]) -> Self {
        let key = K::read_from(&buf[..K::SIZE]);
        let offset = i32::from_le_bytes([
            buf[K::SIZE],
            buf[K::SIZE + 1],
            buf[K::SIZE + 2],
            buf[K::SIZE + 3],
        ]);
        Self { key, offset }
    }
}
