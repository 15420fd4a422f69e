//! Optimistic lock coupling primitives.
//!
//! A node's entire synchronization state is one 64-bit atomic word: bit 0
//! marks the node obsolete, bit 1 is the write lock, and the remaining bits
//! are a version advanced by every write unlock. Readers snapshot the word,
//! read what they need, and re-validate the snapshot; any mismatch raises a
//! restart that unwinds to the tree's entry-point retry loop.

use larch_common::LarchError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Signal to abandon the current attempt and retry from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Restart;

/// Failure modes of an internal tree operation.
#[derive(Debug)]
pub(crate) enum OlcError {
    /// Retry from the root. Never escapes the entry-point loop and carries no
    /// payload.
    Restart,
    /// A real failure, surfaced to the caller.
    Fatal(LarchError),
}

impl From<Restart> for OlcError {
    fn from(_: Restart) -> Self {
        OlcError::Restart
    }
}

impl From<LarchError> for OlcError {
    fn from(err: LarchError) -> Self {
        OlcError::Fatal(err)
    }
}

pub(crate) type OlcResult<T> = Result<T, OlcError>;

const OBSOLETE: u64 = 0b01;
const LOCKED: u64 = 0b10;

/// Versioned latch word for one node.
pub(crate) struct VersionLatch {
    word: AtomicU64,
}

impl VersionLatch {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0b100),
        }
    }

    #[inline]
    fn is_locked(version: u64) -> bool {
        version & LOCKED == LOCKED
    }

    #[inline]
    fn is_obsolete(version: u64) -> bool {
        version & OBSOLETE == OBSOLETE
    }

    /// Snapshots the version; restarts if the node is write-locked or
    /// obsolete.
    #[inline]
    pub fn read_lock(&self) -> Result<u64, Restart> {
        let version = self.word.load(Ordering::Acquire);
        if Self::is_locked(version) || Self::is_obsolete(version) {
            return Err(Restart);
        }
        Ok(version)
    }

    /// Restarts if the word moved since `version` was snapshotted.
    #[inline]
    pub fn validate(&self, version: u64) -> Result<(), Restart> {
        if self.word.load(Ordering::Acquire) != version {
            return Err(Restart);
        }
        Ok(())
    }

    /// Upgrades a read snapshot to the write lock, returning the locked word.
    #[inline]
    pub fn upgrade(&self, version: u64) -> Result<u64, Restart> {
        match self.word.compare_exchange(
            version,
            version + LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(version + LOCKED),
            Err(_) => Err(Restart),
        }
    }

    /// Takes the write lock from scratch.
    #[allow(dead_code)]
    #[inline]
    pub fn write_lock(&self) -> Result<u64, Restart> {
        let version = self.read_lock()?;
        self.upgrade(version)
    }

    /// Releases the write lock and advances the version.
    #[inline]
    pub fn write_unlock(&self) {
        self.word.fetch_add(LOCKED, Ordering::Release);
    }

    /// Releases the write lock, advances the version, and marks the node
    /// obsolete. Deletion will need this; nothing calls it yet.
    #[allow(dead_code)]
    #[inline]
    pub fn write_unlock_obsolete(&self) {
        self.word.fetch_add(LOCKED | OBSOLETE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_latch_is_readable() {
        let latch = VersionLatch::new();
        let v = latch.read_lock().unwrap();
        assert_eq!(v, 0b100);
        latch.validate(v).unwrap();
    }

    #[test]
    fn test_upgrade_blocks_readers() {
        let latch = VersionLatch::new();
        let v = latch.read_lock().unwrap();
        latch.upgrade(v).unwrap();

        assert_eq!(latch.read_lock(), Err(Restart));
    }

    #[test]
    fn test_write_unlock_advances_version() {
        let latch = VersionLatch::new();
        let v = latch.read_lock().unwrap();

        latch.upgrade(v).unwrap();
        latch.write_unlock();

        let v2 = latch.read_lock().unwrap();
        assert_eq!(v2, v + 0b100);
        assert_eq!(latch.validate(v), Err(Restart));
    }

    #[test]
    fn test_stale_upgrade_fails() {
        let latch = VersionLatch::new();
        let v = latch.read_lock().unwrap();

        latch.upgrade(v).unwrap();
        latch.write_unlock();

        // The snapshot is stale now, so the CAS must fail.
        assert_eq!(latch.upgrade(v), Err(Restart));
    }

    #[test]
    fn test_write_lock_roundtrip() {
        let latch = VersionLatch::new();
        latch.write_lock().unwrap();
        assert_eq!(latch.write_lock(), Err(Restart));
        latch.write_unlock();
        latch.write_lock().unwrap();
    }

    #[test]
    fn test_obsolete_is_terminal_for_readers() {
        let latch = VersionLatch::new();
        latch.write_lock().unwrap();
        latch.write_unlock_obsolete();

        assert_eq!(latch.read_lock(), Err(Restart));
    }

    #[test]
    fn test_only_one_upgrade_wins() {
        use std::sync::Arc;

        let latch = Arc::new(VersionLatch::new());
        let v = latch.read_lock().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.upgrade(v).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }
}
