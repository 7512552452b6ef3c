//! Personal book-collection service: CRUD over books, reading history,
//! tags and cover images, plus reading-progress estimation with projected
//! finish dates.

pub mod config;
pub mod db;
pub mod estimator;
pub mod isbn;
pub mod model;
pub mod server;
