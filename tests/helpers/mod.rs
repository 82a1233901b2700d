//! Shared test helpers for E2E tests.
//!
//! Note: We use `helpers/mod.rs` instead of `helpers.rs` + `helpers/` because
//! Cargo auto-discovers top-level `.rs` files in `tests/` as integration tests.

pub mod fake_controller;
