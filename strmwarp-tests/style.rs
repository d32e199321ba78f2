//! Style Enforcement Tests
//!
//! These tests enforce critical patterns that cannot be easily caught by
//! clippy alone.
//!
//! # Test Organization
//!
//! - `production_code` - Prevents `#[allow(dead_code)]`, `unwrap()` and
//!   `expect()` outside test code
//!
//! These tests scan the workspace and will fail if violations are found.

#[path = "style/production_code.rs"]
mod production_code;
