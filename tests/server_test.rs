use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bookstand::isbn::{BookMetadata, IsbnLookup};
use bookstand::server::{router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const TEST_KEY: &str = "test-key";

struct FakeIsbn;

#[async_trait::async_trait]
impl IsbnLookup for FakeIsbn {
    async fn lookup(&self, isbn: &str) -> anyhow::Result<Option<BookMetadata>> {
        if isbn == "0441172717" {
            Ok(Some(BookMetadata {
                title: Some("Dune".into()),
                authors: vec!["Herbert, Frank".into()],
                pages: Some(412),
                ..Default::default()
            }))
        } else {
            Ok(None)
        }
    }
}

async fn setup_app() -> (Router, tempfile::TempDir) {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let uploads = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState::new(
        pool,
        Arc::new(FakeIsbn),
        TEST_KEY.to_string(),
        uploads.path().to_string_lossy().to_string(),
        uploads.path().to_string_lossy().to_string(),
        "https://isbn.invalid/".to_string(),
    ));
    (router(state), uploads)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", TEST_KEY)
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_book(app: &Router, title: &str) -> i64 {
    let payload = json!([{
        "title": title,
        "author": "Tester, N A",
        "pages": 300,
        "location": "Main Collection"
    }]);
    let response = app
        .clone()
        .oneshot(request("POST", "/books", Some(payload)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    body["added"][0]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let (app, _dir) = setup_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/recent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn favicon_needs_no_key() {
    let (app, _dir) = setup_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/favicon.ico")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn configuration_redacts_secrets() {
    let (app, _dir) = setup_app().await;
    let response = app
        .oneshot(request("GET", "/configuration", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["api_key"], "******");
    assert_eq!(body["isbn_key"], "******");
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn book_crud_roundtrip() {
    let (app, _dir) = setup_app().await;
    let id = create_book(&app, "Delete Me Now").await;

    let response = app
        .clone()
        .oneshot(request(
            "PUT",
            &format!("/books/{id}"),
            Some(json!({"note": "on loan", "recycled": true})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/books/{id}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["book"]["title"], "Delete Me Now");
    assert_eq!(body["book"]["note"], "on loan");
    assert_eq!(body["book"]["recycled"], true);

    // Unknown id and empty update both fail cleanly.
    let response = app
        .clone()
        .oneshot(request("GET", "/books/9999", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app
        .oneshot(request("PUT", &format!("/books/{id}"), Some(json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tags_and_search_flow() {
    let (app, _dir) = setup_app().await;
    let id = create_book(&app, "Tagged Book").await;
    let _other = create_book(&app, "Other Book").await;

    let response = app
        .clone()
        .oneshot(request("PUT", &format!("/books/{id}/tags/SciFi"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["tag"], "scifi");

    let response = app
        .clone()
        .oneshot(request("GET", "/books/search?tag=scifi", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["title"], "Tagged Book");

    let response = app
        .clone()
        .oneshot(request("GET", "/tags/counts", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body[0]["tag"], "scifi");
    assert_eq!(body[0]["count"], 1);
}

#[tokio::test]
async fn reads_and_reports_flow() {
    let (app, _dir) = setup_app().await;
    let id = create_book(&app, "Read One").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/reads",
            Some(json!([{"book_id": id, "read_date": "2024-02-10"}])),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("GET", "/reports/summary?year=2024", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body[0]["year"], 2024);
    assert_eq!(body[0]["books"], 1);
    assert_eq!(body[0]["pages"], 300);

    let response = app
        .clone()
        .oneshot(request(
            "PUT",
            "/reads/note",
            Some(json!({"book_id": id, "read_date": "2024-02-10", "read_note": "great"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request("GET", &format!("/reads/{id}"), None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body[0]["read_note"], "great");
}

#[tokio::test]
async fn session_flow_with_projection() {
    let (app, _dir) = setup_app().await;
    let id = create_book(&app, "Tracked Book").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/books/{id}/sessions"),
            Some(json!({"total_pages": 300, "start_date": "2024-01-15"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let session = json_body(response).await;
    let sid = session["id"].as_i64().unwrap();
    assert_eq!(session["projected_finish"]["status"], "no_estimate");

    for (day, page) in [("2024-01-15", 50), ("2024-01-16", 95), ("2024-01-17", 140)] {
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/sessions/{sid}/observations"),
                Some(json!({"date": day, "page": page})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/sessions/{sid}"), None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["projected_finish"]["status"], "available");
    assert_eq!(body["projected_finish"]["date"], "2024-01-21");

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/sessions/{sid}/series"), None))
        .await
        .unwrap();
    let body = json_body(response).await;
    let series = body["series"].as_array().unwrap();
    assert_eq!(series.len(), 3);
    assert_eq!(series[0]["index"], 1);
    assert_eq!(series[2]["page"], 140);

    // Duplicate date is a conflict.
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/sessions/{sid}/observations"),
            Some(json!({"date": "2024-01-15", "page": 60})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Non-positive page count is invalid.
    let response = app
        .oneshot(request(
            "POST",
            &format!("/books/{id}/sessions"),
            Some(json!({"total_pages": 0})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (app, _dir) = setup_app().await;
    let response = app
        .clone()
        .oneshot(request("GET", "/sessions/31337", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app
        .oneshot(request("GET", "/sessions/31337/series", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn isbn_import_reports_misses() {
    let (app, _dir) = setup_app().await;
    let response = app
        .oneshot(request(
            "POST",
            "/books/isbn",
            Some(json!({"isbn_list": ["0441172717", "0000000000"]})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["records"][0]["title"], "Dune");
    assert_eq!(body["missing"][0], "0000000000");
}

#[tokio::test]
async fn image_metadata_for_local_url() {
    let (app, _dir) = setup_app().await;
    let id = create_book(&app, "Pictured").await;

    // Non-http URLs skip remote verification.
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/images",
            Some(json!({
                "book_id": id,
                "name": "cover.jpg",
                "url": "/resources/books/cover.jpg"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "cover-face");

    let response = app
        .oneshot(request("GET", &format!("/books/{id}/images"), None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["images"][0]["url"], "/resources/books/cover.jpg");
}
