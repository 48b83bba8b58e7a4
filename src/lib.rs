//! kledger - a single-node proof-of-work ledger server
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Chain head and history, address balances, submission input checks
//! - [`work`] - Difficulty target, retargeting and the 24 hour history
//! - [`submission`] - Proof-of-work block acceptance
//!
//! ## Identity
//! - [`crypto`] - Hashing and private key to address derivation
//! - [`auth`] - Key based authentication and ownership checks
//!
//! ## Event Fanout
//! - [`events`] - Ledger events and the broadcast bus
//! - [`webhooks`] - Owner-registered outbound callbacks
//! - [`websocket`] - Real-time client sessions
//!
//! ## State Management
//! - [`persistence`] - Database layer (SQLite)
//!
//! ## Integration
//! - [`node`] - Wiring and background tasks
//! - [`api`] - HTTP endpoints
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod submission;
pub mod work;

// ============================================================================
// Identity
// ============================================================================
pub mod auth;
pub mod crypto;

// ============================================================================
// Event Fanout
// ============================================================================
pub mod events;
pub mod webhooks;
pub mod websocket;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
