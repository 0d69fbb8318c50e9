//! rollcalld — flash-challenge attendance verification service.
//!
//! Wires the decision components from `rollcall-core` to a SQLite-backed
//! subject roster, identity-index persistence, and the attendance ledger, and
//! exposes the verification pipeline callers drive per attempt.

pub mod config;
pub mod pipeline;
pub mod store;
