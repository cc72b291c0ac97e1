//! Deterministic, pure logic shared by the claim engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod filter;
pub mod invariants;
pub mod notification;
pub mod offer_id;
pub mod otp;
pub mod queue;
pub mod transitions;
pub mod types;
