#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Core protocol primitives: wire types, framing, and the two local stores.

/// Framing, checksumming, and clock-skew validation for the wire protocol.
pub mod codec;
/// Shared error taxonomy.
pub mod error;
/// Local Store Adapter and Metadata Store.
pub mod store;
/// Wire types, data model entities, and configuration.
pub mod types;
