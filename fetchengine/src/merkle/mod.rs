//! Binary-serialized Merkle tree: an immutable reference tree built once
//! from authoritative content, and a mutable, persisted state tree that
//! tracks which leaves have been verified locally so far.
//!
//! ```no_run
//! use fetchengine::merkle::build::InMemorySource;
//! use fetchengine::merkle::{MerkleRef, MerkleState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = b"ABCDEFGHIJ";
//! let reference = MerkleRef::build(&mut InMemorySource::new(data))?;
//! reference.save("/tmp/example.mref")?;
//!
//! let state = MerkleState::create_from_ref(
//!     &reference,
//!     "/tmp/example.mrkl",
//!     "/tmp/example.lock",
//! )?;
//! assert!(!state.is_valid(0));
//! # Ok(())
//! # }
//! ```

pub mod build;
mod error;
pub mod format;
mod reference;
mod state;

pub use error::MerkleError;
pub use reference::MerkleRef;
pub use state::{BitSetSnapshot, MerkleState};
