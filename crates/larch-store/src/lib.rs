//! Single-file paged heap store for larch.
//!
//! This crate provides:
//! - A heap file with a magic-checked header page
//! - Append-only allocation of fixed-size page slots
//! - Page-granular positioned reads and writes

mod heap;

pub use heap::HeapFile;
