//! Shared client library for API types and HTTP clients.
//!
//! This library provides type definitions and HTTP client implementations
//! for the Switchboard API. Types are always available, while HTTP client
//! code is gated behind the `client` feature.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. Users must construct the types either by:
//! - Using builder methods
//! - Using deserialization
//!
//! Plain enums such as [`switchboard::v1::ConnectorType`] are left exhaustive
//! so that the server can match on them without wildcard arms.

pub mod switchboard;

/// The latest Switchboard client version.
#[cfg(feature = "client")]
pub type Switchboard = switchboard::v1::Client;

/// Switchboard v1 client.
#[cfg(feature = "client")]
pub type SwitchboardV1 = switchboard::v1::Client;
