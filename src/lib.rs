//! A small embeddable object store. Objects are opaque byte blobs, keyed by
//! hierarchical paths like `/Windows/Dialogs/Config`, and kept in a single
//! backing file that is scanned on open to rebuild the in-memory index.
//!
//! This is for configuration, window positions, application state, and
//! similar low-rate data. It is explicitly not a database: one coarse lock
//! serializes all operations, payloads are expected to be small, and the
//! hot path is "read everything at startup, write a little at shutdown".
//!
//! ```no_run
//! use cubby::{ObjStore, StoreFlags};
//!
//! let (store, created) = ObjStore::open("./", "settings", StoreFlags::default())?;
//! if created {
//!     store.add("/LastPos/Main", b"10,10,512,480", 16)?;
//! }
//! if let Some((version, bytes)) = store.read("/LastPos/Main", 0)? {
//!     println!("window position v{version}: {} bytes", bytes.len());
//! }
//! # Ok::<(), cubby::StoreError>(())
//! ```

#![forbid(unsafe_code)]

mod alloc;
mod backing;
mod dir;
mod engine;
mod error;
mod path;
mod prelude;
mod recover;
mod slot;

pub use engine::{LoadRes, ObjStore, StoreFlags, STORE_SUFFIX};
pub use error::{Result, StoreError};
pub use path::{CaseMode, StorePath, MAX_PATH_BYTES, MAX_SEGMENT_BYTES};
pub use recover::ValidateReport;
