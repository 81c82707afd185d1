//! A Byzantine-fault-tolerant ordering service core.
//!
//! `plenum` totally orders client requests across a fixed validator
//! set, tolerating up to `f = (n - 1) / 3` faulty nodes. The heart of
//! the crate is the three-phase-commit replica pipeline in
//! [`consensus`], the view-change protocol in [`sync`] that replaces
//! a faulty primary without losing prepared batches, and the
//! Merkle-Patricia trie in [`state`] whose root commitments the
//! pipeline signs and agrees on.
//!
//! The crate deliberately ends at the replica boundary: the wire
//! transport, client tooling and request handlers are external
//! collaborators. A replica consumes events (peer messages and timer
//! expiries) and emits addressed envelopes; see [`replica::Replica`].

pub mod bls;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod cst;
pub mod error;
pub mod ledger;
pub mod messages;
pub mod monitor;
pub mod ordering;
pub mod replica;
pub mod state;
pub mod sync;
pub mod timeouts;
pub mod view;
