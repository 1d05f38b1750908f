//! Integration and credential broker.
//!
//! Switchboard connects organizations to external chat and source-control
//! systems: it runs the authorization flows, keeps the resulting credentials
//! encrypted at rest, and turns provider events into typed envelopes for
//! in-process handlers.

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod db;
pub mod device;
pub mod error;
pub mod integration;
pub mod rate_limit;
pub mod webhook;
