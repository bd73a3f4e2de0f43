#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! The two stores, each owning one side of the data model (spec §3 Ownership):
//! the Local Store owns byte bodies, the Metadata Store owns records and the
//! sync log.

/// Local Store Adapter: thin contract over the host file namespace.
pub mod local;
/// Metadata Store: durable file records table and append-only sync log.
pub mod metadata;
