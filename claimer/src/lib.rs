//! Free-offer claim orchestration engine.
//!
//! Signs in to a storefront through a [`io::driver::PageDriver`], walks the
//! current free offers, claims the ones not yet owned, remembers every outcome
//! in a per-provider ledger, and notifies a human when something was claimed
//! or failed. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (status transitions, offer ids,
//!   filtering, the claim queue, TOTP). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (ledger files, config, driver
//!   seam, prompts, notifications, process execution).
//!
//! Engine modules ([`session`], [`catalog`], [`claim`], [`run`]) coordinate
//! core logic with I/O; [`status`] and [`migrate`] back the maintenance CLI.

pub mod catalog;
pub mod claim;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod migrate;
pub mod run;
pub mod session;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
