#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Starter Shared Types and Utilities
//!
//! Plan and feature vocabulary shared by the billing crate and whatever
//! web layer sits on top of it.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
