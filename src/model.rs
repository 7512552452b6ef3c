use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A book in the collection, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub copyright_date: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub publisher: Option<String>,
    pub cover_type: Option<String>,
    pub pages: Option<i64>,
    pub category: Option<String>,
    pub note: Option<String>,
    pub recycled: bool,
    pub location: Option<String>,
    pub last_update: Option<NaiveDateTime>,
}

/// Payload for inserting one book record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub copyright_date: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub isbn13: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub cover_type: Option<String>,
    #[serde(default)]
    pub pages: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub recycled: bool,
    #[serde(default)]
    pub location: Option<String>,
}

/// Partial update for a book record. Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub copyright_date: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub isbn13: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub cover_type: Option<String>,
    #[serde(default)]
    pub pages: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub recycled: Option<bool>,
    #[serde(default)]
    pub location: Option<String>,
}

impl BookUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.copyright_date.is_none()
            && self.isbn.is_none()
            && self.isbn13.is_none()
            && self.publisher.is_none()
            && self.cover_type.is_none()
            && self.pages.is_none()
            && self.category.is_none()
            && self.note.is_none()
            && self.recycled.is_none()
            && self.location.is_none()
    }
}

/// One completed read of a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadEntry {
    pub book_id: i64,
    pub read_date: NaiveDate,
    #[serde(default)]
    pub read_note: Option<String>,
}

/// Image metadata attached to a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub book_id: i64,
    pub name: String,
    pub url: String,
    pub kind: String,
}

/// One tracked attempt to read a book from a start date to an estimated
/// finish. `projected_finish` is `None` until enough observations exist to
/// fit a trend with positive slope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingSession {
    pub id: i64,
    pub book_id: i64,
    pub start_date: NaiveDate,
    pub total_pages: i64,
    pub estimated_at: Option<NaiveDateTime>,
    pub projected_finish: Option<NaiveDate>,
}

/// A single dated sample of cumulative pages read within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub session_id: i64,
    pub date: NaiveDate,
    pub page: i64,
}

/// One point of a progress series: `index` is the 1-based rank of the
/// observation among the session's observations ordered by date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub page: i64,
    pub index: i64,
}
