//! Aggregation provider integration (Akahu)
//!
//! This module provides the client and types for talking to the Akahu open-banking API.
//! Akahu exposes the connected bank accounts and their settled and pending transactions;
//! the sync engine reads both through this client.

/// REST client for the Akahu API
mod client;
/// Type definitions for Akahu response payloads
mod types;

pub use client::AkahuClient;
pub use types::*;
