//! Transactional configuration storage over two flash banks
//!
//! A single opaque payload (the current configuration) is persisted as an
//! append log across two erase-banks:
//!
//! - reads always return the most recently stored payload,
//! - a power cut at any instant during a store leaves a previous valid
//!   payload readable,
//! - banks are erased only when the active one is exhausted.
//!
//! The engine is generic over the [`FlashBank`] backend from
//! `txstore-hal`, so the same code runs against chip flash drivers and
//! against in-memory banks in tests.
//!
//! ```
//! use txstore_core::TxStore;
//! use txstore_hal::MemBank;
//!
//! let bank0 = MemBank::<64>::new(0xFF);
//! let bank1 = MemBank::<64>::new(0xFF);
//!
//! let mut store = TxStore::<_, _, u16>::new(bank0, bank1, b"defaults").unwrap();
//! assert_eq!(store.length().unwrap(), 8);
//!
//! store.write(b"new configuration").unwrap();
//! let mut buf = [0u8; 32];
//! let n = store.read(&mut buf).unwrap();
//! assert_eq!(&buf[..n], b"new configuration");
//! ```

#![no_std]
#![deny(unsafe_code)]

// This module must come first so the log shims are visible to the rest of
// the crate.
#[macro_use]
mod fmt;

pub mod record;
pub mod store;

pub use record::RecordLen;
pub use store::{Error, TxStore};

pub use txstore_hal::{BankError, FlashBank};
