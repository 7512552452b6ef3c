use super::model::{BookReadRow, RecentBook, TagCount, TagHit, YearSummary};
use crate::model::{Book, BookUpdate, ImageRecord, NewBook, Observation, ReadEntry, ReadingSession};
use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability; cascade deletes need foreign keys on.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

//
// Books
//

const BOOK_COLUMNS: &str = "id, title, author, copyright_date, isbn, isbn13, publisher, \
                            cover_type, pages, category, note, recycled, location, last_update";

fn book_from_row(row: &SqliteRow) -> Book {
    Book {
        id: row.get("id"),
        title: row.get("title"),
        author: row.get("author"),
        copyright_date: row.get("copyright_date"),
        isbn: row.get("isbn"),
        isbn13: row.get("isbn13"),
        publisher: row.get("publisher"),
        cover_type: row.get("cover_type"),
        pages: row.get("pages"),
        category: row.get("category"),
        note: row.get("note"),
        recycled: row.get("recycled"),
        location: row.get("location"),
        last_update: row.try_get::<NaiveDateTime, _>("last_update").ok(),
    }
}

/// A bare 4-digit year is accepted and pinned to January 1 of that year.
fn normalize_copyright(date: &str) -> String {
    let trimmed = date.trim();
    if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("{trimmed}-01-01")
    } else {
        trimmed.to_string()
    }
}

#[instrument(skip_all)]
pub async fn insert_book(pool: &Pool, book: &NewBook) -> Result<i64> {
    let copyright = book.copyright_date.as_deref().map(normalize_copyright);
    let rec = sqlx::query(
        "INSERT INTO books (title, author, copyright_date, isbn, isbn13, publisher, cover_type, \
                            pages, category, note, recycled, location) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&book.title)
    .bind(&book.author)
    .bind(copyright)
    .bind(&book.isbn)
    .bind(&book.isbn13)
    .bind(&book.publisher)
    .bind(&book.cover_type)
    .bind(book.pages)
    .bind(&book.category)
    .bind(&book.note)
    .bind(book.recycled)
    .bind(&book.location)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_book(pool: &Pool, book_id: i64) -> Result<Option<Book>> {
    let row = sqlx::query(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?"))
        .bind(book_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(book_from_row))
}

pub async fn book_exists(pool: &Pool, book_id: i64) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM books WHERE id = ?")
        .bind(book_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Apply a partial update; returns the number of affected rows (0 when the
/// book id does not exist).
#[instrument(skip_all)]
pub async fn update_book(pool: &Pool, book_id: i64, update: &BookUpdate) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE books SET last_update = CURRENT_TIMESTAMP");
    if let Some(v) = &update.title {
        qb.push(", title = ").push_bind(v);
    }
    if let Some(v) = &update.author {
        qb.push(", author = ").push_bind(v);
    }
    if let Some(v) = &update.copyright_date {
        qb.push(", copyright_date = ").push_bind(normalize_copyright(v));
    }
    if let Some(v) = &update.isbn {
        qb.push(", isbn = ").push_bind(v);
    }
    if let Some(v) = &update.isbn13 {
        qb.push(", isbn13 = ").push_bind(v);
    }
    if let Some(v) = &update.publisher {
        qb.push(", publisher = ").push_bind(v);
    }
    if let Some(v) = &update.cover_type {
        qb.push(", cover_type = ").push_bind(v);
    }
    if let Some(v) = update.pages {
        qb.push(", pages = ").push_bind(v);
    }
    if let Some(v) = &update.category {
        qb.push(", category = ").push_bind(v);
    }
    if let Some(v) = &update.note {
        qb.push(", note = ").push_bind(v);
    }
    if let Some(v) = update.recycled {
        qb.push(", recycled = ").push_bind(v);
    }
    if let Some(v) = &update.location {
        qb.push(", location = ").push_bind(v);
    }
    qb.push(" WHERE id = ").push_bind(book_id);
    let res = qb.build().execute(pool).await?;
    Ok(res.rows_affected())
}

pub async fn distinct_locations(pool: &Pool) -> Result<Vec<String>> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT location FROM books WHERE location IS NOT NULL ORDER BY location ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Most recently touched books: any write to a book, its reads, tags, images
/// or reading sessions counts as a touch.
pub async fn recently_touched(pool: &Pool, limit: i64) -> Result<Vec<RecentBook>> {
    let rows = sqlx::query(
        "SELECT abc.book_id, MAX(abc.last_update) AS last_update, b.title \
         FROM ( \
             SELECT id AS book_id, last_update FROM books \
             UNION SELECT book_id, last_update FROM book_reads \
             UNION SELECT book_id, last_update FROM book_tags \
             UNION SELECT book_id, last_update FROM images \
             UNION SELECT s.book_id, d.obs_date AS last_update \
                 FROM reading_sessions s JOIN daily_observations d ON d.session_id = s.id \
             UNION SELECT book_id, estimated_at AS last_update \
                 FROM reading_sessions WHERE estimated_at IS NOT NULL \
         ) abc \
         JOIN books b ON b.id = abc.book_id \
         GROUP BY abc.book_id, b.title \
         ORDER BY last_update DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let recent = rows
        .into_iter()
        .map(|row| {
            let title: String = row.get("title");
            let title = if title.chars().count() > 43 {
                let short: String = title.chars().take(40).collect();
                format!("{short}...")
            } else {
                title
            };
            RecentBook {
                book_id: row.get("book_id"),
                last_update: row.try_get("last_update").ok(),
                title,
            }
        })
        .collect();
    Ok(recent)
}

/// Search criteria for the book collection. Text fields match with LIKE;
/// `id` matches exactly; `tag` resolves labels first and filters by book id.
#[derive(Debug, Clone, Default)]
pub struct BookSearch {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub note: Option<String>,
    pub isbn: Option<String>,
    pub read_date: Option<String>,
    pub tag: Option<String>,
}

pub async fn search_books(pool: &Pool, search: &BookSearch) -> Result<Vec<BookReadRow>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT b.id, b.title, b.author, b.copyright_date, b.isbn, b.isbn13, b.publisher, \
                b.cover_type, b.pages, b.category, b.note, b.recycled, b.location, b.last_update, \
                r.read_date \
         FROM books b LEFT JOIN book_reads r ON b.id = r.book_id WHERE 1 = 1",
    );

    if let Some(id) = search.id {
        qb.push(" AND b.id = ").push_bind(id);
    }
    let like_columns = [
        ("b.title", &search.title),
        ("b.author", &search.author),
        ("b.publisher", &search.publisher),
        ("b.category", &search.category),
        ("b.location", &search.location),
        ("b.note", &search.note),
        ("r.read_date", &search.read_date),
    ];
    for (column, value) in like_columns {
        if let Some(v) = value {
            qb.push(format!(" AND {column} LIKE "))
                .push_bind(format!("%{v}%"));
        }
    }
    if let Some(isbn) = &search.isbn {
        qb.push(" AND (b.isbn LIKE ").push_bind(format!("%{isbn}%"));
        qb.push(" OR b.isbn13 LIKE ").push_bind(format!("%{isbn}%"));
        qb.push(")");
    }
    if let Some(tag) = &search.tag {
        let hits = search_tags(pool, tag).await?;
        if hits.is_empty() {
            // No matching tags: force an empty result rather than ignoring
            // the criterion.
            qb.push(" AND b.id IN (0)");
        } else {
            qb.push(" AND b.id IN (");
            let mut sep = qb.separated(", ");
            for hit in &hits {
                sep.push_bind(hit.book_id);
            }
            qb.push(")");
        }
    }
    qb.push(" ORDER BY b.author, b.title ASC");

    let rows = qb.build().fetch_all(pool).await?;
    let results = rows
        .iter()
        .map(|row| BookReadRow {
            book: book_from_row(row),
            read_date: row.try_get::<NaiveDate, _>("read_date").ok(),
        })
        .collect();
    Ok(results)
}

//
// Read history
//

#[instrument(skip_all)]
pub async fn insert_read(pool: &Pool, entry: &ReadEntry) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO book_reads (book_id, read_date, read_note) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(entry.book_id)
    .bind(entry.read_date)
    .bind(&entry.read_note)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn update_read_note(
    pool: &Pool,
    book_id: i64,
    read_date: NaiveDate,
    note: &str,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE book_reads SET read_note = ?, last_update = CURRENT_TIMESTAMP \
         WHERE book_id = ? AND read_date = ?",
    )
    .bind(note)
    .bind(book_id)
    .bind(read_date)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn reads_for_book(pool: &Pool, book_id: i64) -> Result<Vec<ReadEntry>> {
    let rows = sqlx::query(
        "SELECT book_id, read_date, read_note FROM book_reads \
         WHERE book_id = ? ORDER BY read_date ASC",
    )
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    let reads = rows
        .into_iter()
        .map(|row| ReadEntry {
            book_id: row.get("book_id"),
            read_date: row.get("read_date"),
            read_note: row.get("read_note"),
        })
        .collect();
    Ok(reads)
}

//
// Tags
//

#[instrument(skip_all)]
pub async fn add_tag_to_book(pool: &Pool, book_id: i64, tag: &str) -> Result<i64> {
    let tag = tag.to_lowercase().trim().to_string();
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT OR IGNORE INTO tag_labels (label) VALUES (?)")
        .bind(&tag)
        .execute(&mut *tx)
        .await?;
    let tag_id: i64 = sqlx::query_scalar("SELECT id FROM tag_labels WHERE label = ?")
        .bind(&tag)
        .fetch_one(&mut *tx)
        .await?;
    sqlx::query("INSERT OR IGNORE INTO book_tags (book_id, tag_id) VALUES (?, ?)")
        .bind(book_id)
        .bind(tag_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(tag_id)
}

pub async fn tags_for_book(pool: &Pool, book_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT l.label FROM tag_labels l JOIN book_tags t ON l.id = t.tag_id \
         WHERE t.book_id = ? ORDER BY l.label ASC",
    )
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn tag_counts(pool: &Pool, prefix: Option<&str>) -> Result<Vec<TagCount>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT l.label AS tag, COUNT(t.tag_id) AS count \
         FROM tag_labels l JOIN book_tags t ON l.id = t.tag_id",
    );
    if let Some(prefix) = prefix {
        qb.push(" WHERE l.label LIKE ").push_bind(format!("{prefix}%"));
    }
    qb.push(" GROUP BY l.label ORDER BY count DESC, tag ASC");
    let rows = qb.build().fetch_all(pool).await?;
    let counts = rows
        .into_iter()
        .map(|row| TagCount {
            tag: row.get("tag"),
            count: row.get("count"),
        })
        .collect();
    Ok(counts)
}

pub async fn search_tags(pool: &Pool, fragment: &str) -> Result<Vec<TagHit>> {
    let fragment = fragment.to_lowercase().trim().to_string();
    let rows = sqlx::query(
        "SELECT t.book_id, l.id AS tag_id, l.label AS tag \
         FROM book_tags t JOIN tag_labels l ON t.tag_id = l.id \
         WHERE l.label LIKE ? ORDER BY l.label ASC",
    )
    .bind(format!("%{fragment}%"))
    .fetch_all(pool)
    .await?;
    let hits = rows
        .into_iter()
        .map(|row| TagHit {
            book_id: row.get("book_id"),
            tag_id: row.get("tag_id"),
            tag: row.get("tag"),
        })
        .collect();
    Ok(hits)
}

#[instrument(skip_all)]
pub async fn rename_tag(pool: &Pool, current: &str, updated: &str) -> Result<u64> {
    let updated = updated.to_lowercase().trim().to_string();
    let res = sqlx::query("UPDATE tag_labels SET label = ? WHERE label = ?")
        .bind(updated)
        .bind(current)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Normalize every label to trimmed lowercase.
#[instrument(skip_all)]
pub async fn tag_maintenance(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE tag_labels SET label = TRIM(LOWER(label))")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

//
// Images
//

#[instrument(skip_all)]
pub async fn insert_image(
    pool: &Pool,
    book_id: i64,
    name: &str,
    url: &str,
    kind: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO images (book_id, name, url, kind) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(book_id)
    .bind(name)
    .bind(url)
    .bind(kind)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn images_for_book(pool: &Pool, book_id: i64) -> Result<Vec<ImageRecord>> {
    let rows = sqlx::query(
        "SELECT id, book_id, name, url, kind FROM images WHERE book_id = ? ORDER BY id ASC",
    )
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    let images = rows
        .into_iter()
        .map(|row| ImageRecord {
            id: row.get("id"),
            book_id: row.get("book_id"),
            name: row.get("name"),
            url: row.get("url"),
            kind: row.get("kind"),
        })
        .collect();
    Ok(images)
}

pub async fn cover_urls(pool: &Pool, book_id: i64) -> Result<Vec<String>> {
    let urls = sqlx::query_scalar::<_, String>(
        "SELECT url FROM images WHERE book_id = ? AND kind = 'cover-face' ORDER BY id ASC",
    )
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    Ok(urls)
}

//
// Reports
//

pub async fn year_summaries(pool: &Pool, year: Option<i32>) -> Result<Vec<YearSummary>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT CAST(strftime('%Y', r.read_date) AS INTEGER) AS year, \
                COALESCE(SUM(b.pages), 0) AS pages, COUNT(*) AS books \
         FROM books b JOIN book_reads r ON b.id = r.book_id \
         WHERE r.read_date IS NOT NULL",
    );
    if let Some(year) = year {
        qb.push(" AND CAST(strftime('%Y', r.read_date) AS INTEGER) = ")
            .push_bind(year);
    }
    qb.push(" GROUP BY year ORDER BY year ASC");
    let rows = qb.build().fetch_all(pool).await?;
    let summaries = rows
        .into_iter()
        .map(|row| YearSummary {
            year: row.get("year"),
            pages: row.get("pages"),
            books: row.get("books"),
        })
        .collect();
    Ok(summaries)
}

pub async fn books_read(pool: &Pool, year: Option<i32>) -> Result<Vec<BookReadRow>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT b.id, b.title, b.author, b.copyright_date, b.isbn, b.isbn13, b.publisher, \
                b.cover_type, b.pages, b.category, b.note, b.recycled, b.location, b.last_update, \
                r.read_date \
         FROM books b JOIN book_reads r ON b.id = r.book_id \
         WHERE r.read_date IS NOT NULL",
    );
    if let Some(year) = year {
        qb.push(" AND CAST(strftime('%Y', r.read_date) AS INTEGER) = ")
            .push_bind(year);
    }
    qb.push(" ORDER BY r.read_date, b.id ASC");
    let rows = qb.build().fetch_all(pool).await?;
    let results = rows
        .iter()
        .map(|row| BookReadRow {
            book: book_from_row(row),
            read_date: row.try_get::<NaiveDate, _>("read_date").ok(),
        })
        .collect();
    Ok(results)
}

//
// Reading sessions and observations
//

fn session_from_row(row: &SqliteRow) -> ReadingSession {
    ReadingSession {
        id: row.get("id"),
        book_id: row.get("book_id"),
        start_date: row.get("start_date"),
        total_pages: row.get("total_pages"),
        estimated_at: row.try_get("estimated_at").ok(),
        projected_finish: row.try_get("projected_finish").ok(),
    }
}

const SESSION_COLUMNS: &str =
    "id, book_id, start_date, total_pages, estimated_at, projected_finish";

#[instrument(skip_all)]
pub async fn insert_session(
    pool: &Pool,
    book_id: i64,
    start_date: NaiveDate,
    total_pages: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO reading_sessions (book_id, start_date, total_pages) \
         VALUES (?, ?, ?) RETURNING id",
    )
    .bind(book_id)
    .bind(start_date)
    .bind(total_pages)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_session(pool: &Pool, session_id: i64) -> Result<Option<ReadingSession>> {
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM reading_sessions WHERE id = ?"
    ))
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(session_from_row))
}

pub async fn sessions_for_book(pool: &Pool, book_id: i64) -> Result<Vec<ReadingSession>> {
    let rows = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM reading_sessions \
         WHERE book_id = ? ORDER BY start_date ASC, id ASC"
    ))
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(session_from_row).collect())
}

pub async fn get_session_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: i64,
) -> Result<Option<ReadingSession>> {
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM reading_sessions WHERE id = ?"
    ))
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.as_ref().map(session_from_row))
}

/// Insert one observation. The (session_id, obs_date) primary key turns a
/// duplicate date into a database error the caller maps to a conflict.
pub async fn insert_observation_tx(
    tx: &mut Transaction<'_, Sqlite>,
    obs: &Observation,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO daily_observations (session_id, obs_date, page) VALUES (?, ?, ?)")
        .bind(obs.session_id)
        .bind(obs.date)
        .bind(obs.page)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn observations_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: i64,
) -> Result<Vec<Observation>> {
    let rows = sqlx::query(
        "SELECT session_id, obs_date, page FROM daily_observations \
         WHERE session_id = ? ORDER BY obs_date ASC",
    )
    .bind(session_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(observation_from_row).collect())
}

pub async fn observations_for_session(pool: &Pool, session_id: i64) -> Result<Vec<Observation>> {
    let rows = sqlx::query(
        "SELECT session_id, obs_date, page FROM daily_observations \
         WHERE session_id = ? ORDER BY obs_date ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(observation_from_row).collect())
}

fn observation_from_row(row: SqliteRow) -> Observation {
    Observation {
        session_id: row.get("session_id"),
        date: row.get("obs_date"),
        page: row.get("page"),
    }
}

pub async fn update_projection_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: i64,
    estimated_at: NaiveDateTime,
    projected_finish: Option<NaiveDate>,
) -> Result<()> {
    sqlx::query(
        "UPDATE reading_sessions SET estimated_at = ?, projected_finish = ? WHERE id = ?",
    )
    .bind(estimated_at)
    .bind(projected_finish)
    .bind(session_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
