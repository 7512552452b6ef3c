//! View models returned by report and search queries.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::Book;

/// Row of the "recently touched" report. `last_update` is whatever timestamp
/// the most recent touch carried (a date or a full datetime).
#[derive(Debug, Clone, Serialize)]
pub struct RecentBook {
    pub book_id: i64,
    pub last_update: Option<String>,
    pub title: String,
}

/// Pages and book counts aggregated per calendar year.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct YearSummary {
    pub year: i32,
    pub pages: i64,
    pub books: i64,
}

/// A book joined with one of its read dates, as returned by search and the
/// books-read report.
#[derive(Debug, Clone, Serialize)]
pub struct BookReadRow {
    #[serde(flatten)]
    pub book: Book,
    pub read_date: Option<NaiveDate>,
}

/// Tag usage count.
#[derive(Debug, Clone, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

/// One tag-search hit: which book carries which label.
#[derive(Debug, Clone, Serialize)]
pub struct TagHit {
    pub book_id: i64,
    pub tag_id: i64,
    pub tag: String,
}
