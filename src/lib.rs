//! Threshold key generation ceremonies over a gossip network
//!
//! ## Description
//!
//! A fixed set of peers jointly generate a t-of-n key: every peer ends up with a secret share and
//! the joint public key, and no peer ever learns the full secret. This crate contains the
//! *ceremony coordinator* that runs on each peer. It
//!
//! - turns the list of peer ids into the canonical party ordering every peer agrees on
//!   ([`peers`]),
//! - starts the keygen engine lazily and feeds it inbound messages in order ([`party`]),
//! - translates between engine messages and the hex/JSON gossip payloads ([`gossip`]),
//! - persists the finished key material and reports it to a callback exactly once
//!   ([`result`], [`storage`], [`notify`]).
//!
//! The multi-party protocol itself sits behind the [`engine::KeygenScheme`] trait. The crate
//! ships an implementation for *[secp256kfun FROST]* keygen in [`frost`].
//!
//! > ⚠ The FROST keygen rounds send secret shares over the gossip transport as is. Run it only
//! over an authenticated, encrypted transport.
//!
//! ## Usage Notes
//!
//! One [`coordinator::Coordinator`] runs one ceremony at a time. [`gossip::MemoryNetwork`]
//! connects several coordinators inside one process, which is what the `keygen-ceremony`
//! binary and the integration tests do.
//!
//! [secp256kfun FROST]: <https://docs.rs/schnorr_fun/latest/schnorr_fun/frost/index.html>

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod frost;
pub mod gossip;
pub mod notify;
pub mod party;
pub mod peers;
pub mod result;
pub mod storage;

pub use coordinator::{Coordinator, KeygenRequest};
pub use error::CeremonyError;
pub use result::KeygenResult;
