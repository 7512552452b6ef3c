//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by report and search queries.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `bookstand::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BookReadRow, RecentBook, TagCount, TagHit, YearSummary};
