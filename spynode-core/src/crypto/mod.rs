//! Hashing primitives used by the spy node.
//!
//! Key management, signing, and address derivation are out of scope for this
//! crate (see the crate-level Non-goals) and are left to whatever wallet
//! component embeds the spy node.

pub mod hash;

pub use hash::{BlockHash, Hash, HashError, Txid};
