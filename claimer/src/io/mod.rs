//! I/O collaborators for the claim engine.

pub mod atomic;
pub mod config;
pub mod driver;
pub mod history;
pub mod ledger;
pub mod notify;
pub mod otp;
pub mod process;
pub mod prompt;
pub mod screenshots;
