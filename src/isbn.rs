use crate::model::NewBook;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Metadata lookup keyed by ISBN. Behind a trait so tests can substitute a
/// canned responder for the external service.
#[async_trait]
pub trait IsbnLookup: Send + Sync {
    /// Fetch metadata for one ISBN. `Ok(None)` means the service has no
    /// record for it, which callers report rather than treat as failure.
    async fn lookup(&self, isbn: &str) -> Result<Option<BookMetadata>>;
}

/// The subset of the metadata service's book payload we consume.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub date_published: Option<String>,
    #[serde(default)]
    pub pages: Option<i64>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub isbn13: Option<String>,
}

impl BookMetadata {
    /// Prefill a collection record from looked-up metadata. Missing titles
    /// become "Unknown Title" so the record is still insertable and editable.
    pub fn into_new_book(self) -> NewBook {
        NewBook {
            title: self.title.unwrap_or_else(|| "Unknown Title".to_string()),
            author: self.authors.join("; "),
            copyright_date: self.date_published,
            isbn: self.isbn,
            isbn13: self.isbn13,
            publisher: self.publisher,
            cover_type: None,
            pages: self.pages,
            category: None,
            note: None,
            recycled: false,
            location: None,
        }
    }
}

#[derive(Deserialize)]
struct LookupResponse {
    book: BookMetadata,
}

#[derive(Clone)]
pub struct IsbnClient {
    http: Client,
    base_url: Url,
    key: String,
}

impl fmt::Debug for IsbnClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsbnClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl IsbnClient {
    pub fn new(base_url: &str, key: String) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid ISBN service base URL")?;
        let http = Client::builder()
            .user_agent("bookstand/0.1")
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            base_url,
            key,
        })
    }
}

#[async_trait]
impl IsbnLookup for IsbnClient {
    async fn lookup(&self, isbn: &str) -> Result<Option<BookMetadata>> {
        let endpoint = self
            .base_url
            .join(&format!("book/{isbn}"))
            .context("invalid ISBN lookup URL")?;
        debug!(url = %endpoint, "looking up isbn");
        let res = self
            .http
            .get(endpoint)
            .header("Authorization", &self.key)
            .send()
            .await
            .context("failed to reach ISBN service")?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("isbn service error {}: {}", status, body));
        }

        let payload: LookupResponse = res.json().await.context("invalid ISBN response")?;
        Ok(Some(payload.book))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_maps_to_new_book() {
        let meta = BookMetadata {
            title: Some("The Moon Is a Harsh Mistress".into()),
            authors: vec!["Heinlein, Robert A.".into()],
            publisher: Some("Orb".into()),
            date_published: Some("1997".into()),
            pages: Some(384),
            isbn: Some("0312863551".into()),
            isbn13: Some("9780312863555".into()),
        };
        let book = meta.into_new_book();
        assert_eq!(book.title, "The Moon Is a Harsh Mistress");
        assert_eq!(book.author, "Heinlein, Robert A.");
        assert_eq!(book.pages, Some(384));
    }

    #[test]
    fn missing_title_gets_placeholder() {
        let book = BookMetadata::default().into_new_book();
        assert_eq!(book.title, "Unknown Title");
        assert_eq!(book.author, "");
    }

    #[test]
    fn lookup_response_parses() {
        let raw = r#"{"book":{"title":"Dune","authors":["Herbert, Frank"],"pages":412,
                      "publisher":"Ace","date_published":"1990-09-01",
                      "isbn":"0441172717","isbn13":"9780441172719"}}"#;
        let parsed: LookupResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.book.title.as_deref(), Some("Dune"));
        assert_eq!(parsed.book.pages, Some(412));
    }
}
