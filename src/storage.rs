//! Tagged buffer storage for in-flight operations.
//!
//! Every operation owns exactly one [`DataStorage`], chosen at construction
//! and never reassigned. Which alternative is legal depends on the
//! operation's kind: reads use [`DataStorage::ReadBufs`] or
//! [`DataStorage::Owned`], writes use [`DataStorage::WriteBufs`] or
//! [`DataStorage::Owned`], flush and open carry [`DataStorage::Empty`].
//!
//! Accessing the wrong alternative is a programming error and panics; it is
//! not a recoverable condition.

use smallvec::SmallVec;

/// Inline capacity for the buffer list of a vectored operation. Vectored
/// requests rarely carry more than a handful of buffers.
const INLINE_BUFS: usize = 4;

/// The buffer list of a vectored operation.
pub(crate) type BufList = SmallVec<[Vec<u8>; INLINE_BUFS]>;

/// What memory an operation reads into or writes from.
#[derive(Debug)]
pub(crate) enum DataStorage {
    /// No payload (flush, open).
    Empty,
    /// Read targets, one buffer per span of a vectored read. The buffers
    /// are taken over from the caller and handed back, truncated to the
    /// bytes actually delivered, once the operation finishes.
    ReadBufs(BufList),
    /// Write sources, one buffer per span of a vectored write. Ownership
    /// model as for `ReadBufs`.
    WriteBufs(BufList),
    /// A single buffer owned by the operation itself.
    Owned(Vec<u8>),
}

impl DataStorage {
    pub(crate) fn is_empty_variant(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub(crate) fn is_read_bufs(&self) -> bool {
        matches!(self, Self::ReadBufs(_))
    }

    pub(crate) fn is_write_bufs(&self) -> bool {
        matches!(self, Self::WriteBufs(_))
    }

    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    pub(crate) fn read_bufs(&self) -> &BufList {
        match self {
            Self::ReadBufs(bufs) => bufs,
            _ => panic!("storage does not hold read buffers"),
        }
    }

    pub(crate) fn read_bufs_mut(&mut self) -> &mut BufList {
        match self {
            Self::ReadBufs(bufs) => bufs,
            _ => panic!("storage does not hold read buffers"),
        }
    }

    pub(crate) fn write_bufs(&self) -> &BufList {
        match self {
            Self::WriteBufs(bufs) => bufs,
            _ => panic!("storage does not hold write buffers"),
        }
    }

    pub(crate) fn write_bufs_mut(&mut self) -> &mut BufList {
        match self {
            Self::WriteBufs(bufs) => bufs,
            _ => panic!("storage does not hold write buffers"),
        }
    }

    pub(crate) fn owned(&self) -> &Vec<u8> {
        match self {
            Self::Owned(buf) => buf,
            _ => panic!("storage does not hold an owned buffer"),
        }
    }

    pub(crate) fn owned_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Self::Owned(buf) => buf,
            _ => panic!("storage does not hold an owned buffer"),
        }
    }

    /// Number of transfer chunks this storage describes: one per buffer of
    /// a vectored operation, one for an owned buffer, zero when empty.
    pub(crate) fn chunk_count(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::ReadBufs(bufs) => bufs.len(),
            Self::WriteBufs(bufs) => bufs.len(),
            Self::Owned(_) => 1,
        }
    }

    /// Distributes `total` delivered bytes across the read buffers in
    /// order: earlier buffers fill completely, the first short buffer is
    /// truncated to what it received, and every buffer past the byte count
    /// ends up zero-sized. For an owned buffer this is a plain truncate.
    ///
    /// This is how a short read near end-of-file is surfaced.
    pub(crate) fn truncate_read(&mut self, total: i64) {
        let mut remaining = usize::try_from(total).unwrap_or(0);
        match self {
            Self::ReadBufs(bufs) => {
                for buf in bufs.iter_mut() {
                    let keep = remaining.min(buf.len());
                    buf.truncate(keep);
                    remaining -= keep;
                }
            }
            Self::Owned(buf) => buf.truncate(remaining),
            _ => panic!("storage is not a read target"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_exactly_one_alternative_is_active() {
        let storage = DataStorage::Owned(vec![1, 2, 3]);
        assert!(storage.is_owned());
        assert!(!storage.is_empty_variant());
        assert!(!storage.is_read_bufs());
        assert!(!storage.is_write_bufs());
    }

    #[test]
    #[should_panic(expected = "does not hold read buffers")]
    fn test_wrong_alternative_access_panics() {
        let storage = DataStorage::Owned(vec![0; 4]);
        let _ = storage.read_bufs();
    }

    #[test]
    #[should_panic(expected = "does not hold an owned buffer")]
    fn test_empty_has_no_owned_buffer() {
        let storage = DataStorage::Empty;
        let _ = storage.owned();
    }

    #[test]
    fn test_truncate_read_fills_front_to_back() {
        let mut storage =
            DataStorage::ReadBufs(smallvec![vec![0; 4], vec![0; 4], vec![0; 4]]);
        storage.truncate_read(6);
        let lens: Vec<usize> = storage.read_bufs().iter().map(Vec::len).collect();
        assert_eq!(lens, [4, 2, 0]);
    }

    #[test]
    fn test_truncate_read_full_delivery_keeps_all_buffers() {
        let mut storage = DataStorage::ReadBufs(smallvec![vec![0; 2], vec![0; 3]]);
        storage.truncate_read(5);
        let lens: Vec<usize> = storage.read_bufs().iter().map(Vec::len).collect();
        assert_eq!(lens, [2, 3]);
    }

    #[test]
    fn test_truncate_read_owned_buffer() {
        let mut storage = DataStorage::Owned(vec![0; 16]);
        storage.truncate_read(7);
        assert_eq!(storage.owned().len(), 7);
    }

    #[test]
    fn test_truncate_read_negative_total_clears() {
        let mut storage = DataStorage::Owned(vec![0; 8]);
        storage.truncate_read(-1);
        assert!(storage.owned().is_empty());
    }

    #[test]
    fn test_chunk_count_per_variant() {
        assert_eq!(DataStorage::Empty.chunk_count(), 0);
        assert_eq!(DataStorage::Owned(vec![0; 8]).chunk_count(), 1);
        let bufs: BufList = smallvec![vec![0; 1], vec![0; 2]];
        assert_eq!(DataStorage::ReadBufs(bufs).chunk_count(), 2);
    }
}
