//! Shared library behind both zdns binaries: the persistent store (C1),
//! classifier (C2), policy engine (C3), STIX/TAXII object store and remote
//! client (C4), feed ingesters (C5), rule synchronizer (C6), RPZ renderer
//! (C9), ray id generation, config reads and the shared error type.

pub mod classifier;
pub mod config;
pub mod error;
pub mod feeds;
pub mod policy;
pub mod rayid;
pub mod rpz;
pub mod store;
pub mod stix;
pub mod sync;
pub mod taxii_client;
