use std::cmp::Ordering;

/// Ordering of keys inside one table.
///
/// A table without an installed comparator orders keys bytewise.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Bytewise;

impl KeyComparator for Bytewise {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// A search key already decoded by the caller.
///
/// Seeking with an unpacked key lets the comparison skip decoding the
/// search key once per probe.
pub trait UnpackedKey {
    /// Compare a stored key against this search key.
    fn compare_stored(&self, stored: &[u8]) -> Ordering;
}

/// Search argument of a range seek.
#[derive(Clone, Copy)]
pub enum Probe<'a> {
    Raw(&'a [u8]),
    Unpacked(&'a dyn UnpackedKey),
}

impl<'a> Probe<'a> {
    /// Ordering of stored key relative to the probe.
    #[inline]
    pub fn compare(&self, cmp: &dyn KeyComparator, stored: &[u8]) -> Ordering {
        match self {
            Probe::Raw(key) => cmp.compare(stored, key),
            Probe::Unpacked(key) => key.compare_stored(stored),
        }
    }
}
