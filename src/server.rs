//! HTTP surface: routing, API-key check, and typed request/response shapes.
//!
//! Handlers stay thin: parse, call a repository or the estimator, map the
//! result. Error-kind to status-code mapping lives in [`ApiError`].

use crate::db::{self, BookSearch, Pool};
use crate::estimator::{Estimator, EstimatorError};
use crate::isbn::IsbnLookup;
use crate::model::{
    Book, BookUpdate, ImageRecord, NewBook, Observation, ReadEntry, ReadingSession, SeriesPoint,
};
use anyhow::Result;
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const API_KEY_HEADER: &str = "x-api-key";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared handler state. The pool is the storage handle; the estimator is
/// constructed over a clone of it.
pub struct AppState {
    pub pool: Pool,
    pub estimator: Estimator,
    pub isbn: Arc<dyn IsbnLookup>,
    pub http: reqwest::Client,
    pub api_key: String,
    pub data_dir: String,
    pub upload_dir: String,
    pub isbn_base_url: String,
}

impl AppState {
    pub fn new(
        pool: Pool,
        isbn: Arc<dyn IsbnLookup>,
        api_key: String,
        data_dir: String,
        upload_dir: String,
        isbn_base_url: String,
    ) -> Self {
        let estimator = Estimator::new(pool.clone());
        let http = reqwest::Client::builder()
            .user_agent(concat!("bookstand/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self {
            pool,
            estimator,
            isbn,
            http,
            api_key,
            data_dir,
            upload_dir,
            isbn_base_url,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Conflict(String),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(err) => {
                error!(?err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<EstimatorError> for ApiError {
    fn from(err: EstimatorError) -> Self {
        match err {
            EstimatorError::InvalidArgument(msg) => ApiError::BadRequest(msg.to_string()),
            EstimatorError::NotFound(what) => ApiError::NotFound(what),
            EstimatorError::Conflict(_) => ApiError::Conflict(err.to_string()),
            EstimatorError::Unavailable(e) => ApiError::Internal(e.into()),
        }
    }
}

/// Build the full router. Everything except the favicon no-op sits behind
/// the API-key check.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/configuration", get(configuration))
        .route("/locations", get(locations))
        .route("/recent", get(recent))
        .route("/books", post(add_books))
        .route("/books/search", get(search))
        .route("/books/isbn", post(books_by_isbn))
        .route("/books/{id}", get(complete_record).put(update_book))
        .route("/books/{id}/tags", get(book_tags))
        .route("/books/{id}/tags/{tag}", put(add_tag))
        .route("/books/{id}/images", get(book_images))
        .route("/books/{id}/sessions", get(list_sessions).post(start_session))
        .route("/reads", post(add_reads))
        .route("/reads/note", put(update_read_note))
        .route("/reads/{book_id}", get(read_status))
        .route("/tags/counts", get(tag_counts))
        .route("/tags/search/{fragment}", get(tags_search))
        .route("/tags/rename/{current}/{updated}", put(rename_tag))
        .route("/tags/maintenance", post(tag_maintenance))
        .route("/images", post(add_image))
        .route("/images/upload", post(upload_image))
        .route("/reports/summary", get(summary))
        .route("/reports/books_read", get(books_read))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/observations", post(record_observation))
        .route("/sessions/{id}/series", get(progress_series))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(protected)
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind_addr: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("listening on http://{bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented == Some(state.api_key.as_str()) {
        next.run(req).await
    } else {
        warn!("x-api-key missing or incorrect");
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "x-api-key missing or incorrect".to_string(),
            }),
        )
            .into_response()
    }
}

//
// Service metadata
//

#[derive(Serialize)]
struct ConfigurationResponse {
    version: &'static str,
    data_dir: String,
    upload_dir: String,
    isbn_base_url: String,
    api_key: &'static str,
    isbn_key: &'static str,
    date: String,
}

async fn configuration(State(state): State<Arc<AppState>>) -> Json<ConfigurationResponse> {
    Json(ConfigurationResponse {
        version: VERSION,
        data_dir: state.data_dir.clone(),
        upload_dir: state.upload_dir.clone(),
        isbn_base_url: state.isbn_base_url.clone(),
        api_key: "******",
        isbn_key: "******",
        date: Local::now().format("%Y-%m-%dT%H:%M").to_string(),
    })
}

#[derive(Serialize)]
struct LocationsResponse {
    locations: Vec<String>,
}

async fn locations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LocationsResponse>, ApiError> {
    let locations = db::distinct_locations(&state.pool).await?;
    Ok(Json(LocationsResponse { locations }))
}

#[derive(Deserialize)]
struct RecentParams {
    limit: Option<i64>,
}

async fn recent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Vec<db::RecentBook>>, ApiError> {
    let limit = params.limit.unwrap_or(10).max(1);
    Ok(Json(db::recently_touched(&state.pool, limit).await?))
}

//
// Books
//

#[derive(Serialize)]
struct CreatedBook {
    id: i64,
    title: String,
}

#[derive(Serialize)]
struct AddBooksResponse {
    added: Vec<CreatedBook>,
}

async fn add_books(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<NewBook>>,
) -> Result<Json<AddBooksResponse>, ApiError> {
    if records.is_empty() {
        return Err(ApiError::BadRequest("no book records supplied".into()));
    }
    let mut added = Vec::with_capacity(records.len());
    for record in &records {
        let id = db::insert_book(&state.pool, record).await?;
        added.push(CreatedBook {
            id,
            title: record.title.clone(),
        });
    }
    Ok(Json(AddBooksResponse { added }))
}

#[derive(Serialize)]
struct CompleteRecord {
    book: Book,
    reads: Vec<ReadEntry>,
    tags: Vec<String>,
    cover_urls: Vec<String>,
}

async fn complete_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CompleteRecord>, ApiError> {
    let book = db::get_book(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("book"))?;
    let reads = db::reads_for_book(&state.pool, id).await?;
    let tags = db::tags_for_book(&state.pool, id).await?;
    let cover_urls = db::cover_urls(&state.pool, id).await?;
    Ok(Json(CompleteRecord {
        book,
        reads,
        tags,
        cover_urls,
    }))
}

async fn update_book(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(update): Json<BookUpdate>,
) -> Result<Json<Book>, ApiError> {
    if update.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one updatable field is required".into(),
        ));
    }
    let affected = db::update_book(&state.pool, id, &update).await?;
    if affected == 0 {
        return Err(ApiError::NotFound("book"));
    }
    let book = db::get_book(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("book"))?;
    Ok(Json(book))
}

#[derive(Deserialize)]
struct SearchParams {
    id: Option<i64>,
    title: Option<String>,
    author: Option<String>,
    publisher: Option<String>,
    category: Option<String>,
    location: Option<String>,
    note: Option<String>,
    isbn: Option<String>,
    read_date: Option<String>,
    tag: Option<String>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<db::BookReadRow>>, ApiError> {
    let search = BookSearch {
        id: params.id,
        title: params.title,
        author: params.author,
        publisher: params.publisher,
        category: params.category,
        location: params.location,
        note: params.note,
        isbn: params.isbn,
        read_date: params.read_date,
        tag: params.tag,
    };
    Ok(Json(db::search_books(&state.pool, &search).await?))
}

#[derive(Deserialize)]
struct IsbnImportRequest {
    isbn_list: Vec<String>,
}

#[derive(Serialize)]
struct IsbnImportResponse {
    records: Vec<NewBook>,
    missing: Vec<String>,
}

/// Look up a list of ISBNs and return prefilled book records. Lookups that
/// find nothing are reported in `missing` rather than failing the batch.
async fn books_by_isbn(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IsbnImportRequest>,
) -> Result<Json<IsbnImportResponse>, ApiError> {
    if req.isbn_list.is_empty() {
        return Err(ApiError::BadRequest("isbn_list must be non-empty".into()));
    }
    let mut records = Vec::new();
    let mut missing = Vec::new();
    for isbn in &req.isbn_list {
        match state.isbn.lookup(isbn).await? {
            Some(meta) => records.push(meta.into_new_book()),
            None => {
                warn!(isbn, "no metadata record found");
                missing.push(isbn.clone());
            }
        }
    }
    Ok(Json(IsbnImportResponse { records, missing }))
}

//
// Read history
//

#[derive(Serialize)]
struct AddReadsResponse {
    added: Vec<ReadEntry>,
}

async fn add_reads(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<ReadEntry>>,
) -> Result<Json<AddReadsResponse>, ApiError> {
    if records.is_empty() {
        return Err(ApiError::BadRequest("no read records supplied".into()));
    }
    for record in &records {
        if !db::book_exists(&state.pool, record.book_id).await? {
            return Err(ApiError::NotFound("book"));
        }
        db::insert_read(&state.pool, record).await?;
    }
    Ok(Json(AddReadsResponse { added: records }))
}

#[derive(Deserialize)]
struct UpdateReadNoteRequest {
    book_id: i64,
    read_date: NaiveDate,
    read_note: String,
}

async fn update_read_note(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateReadNoteRequest>,
) -> Result<StatusCode, ApiError> {
    let affected =
        db::update_read_note(&state.pool, req.book_id, req.read_date, &req.read_note).await?;
    if affected == 0 {
        return Err(ApiError::NotFound("read record"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn read_status(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<i64>,
) -> Result<Json<Vec<ReadEntry>>, ApiError> {
    Ok(Json(db::reads_for_book(&state.pool, book_id).await?))
}

//
// Tags
//

#[derive(Serialize)]
struct TagAttached {
    book_id: i64,
    tag: String,
    tag_id: i64,
}

async fn add_tag(
    State(state): State<Arc<AppState>>,
    Path((id, tag)): Path<(i64, String)>,
) -> Result<Json<TagAttached>, ApiError> {
    if !db::book_exists(&state.pool, id).await? {
        return Err(ApiError::NotFound("book"));
    }
    let tag_id = db::add_tag_to_book(&state.pool, id, &tag).await?;
    Ok(Json(TagAttached {
        book_id: id,
        tag: tag.to_lowercase().trim().to_string(),
        tag_id,
    }))
}

#[derive(Serialize)]
struct BookTagsResponse {
    book_id: i64,
    tags: Vec<String>,
}

async fn book_tags(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BookTagsResponse>, ApiError> {
    let tags = db::tags_for_book(&state.pool, id).await?;
    Ok(Json(BookTagsResponse { book_id: id, tags }))
}

#[derive(Deserialize)]
struct TagCountParams {
    prefix: Option<String>,
}

async fn tag_counts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TagCountParams>,
) -> Result<Json<Vec<db::TagCount>>, ApiError> {
    Ok(Json(
        db::tag_counts(&state.pool, params.prefix.as_deref()).await?,
    ))
}

async fn tags_search(
    State(state): State<Arc<AppState>>,
    Path(fragment): Path<String>,
) -> Result<Json<Vec<db::TagHit>>, ApiError> {
    Ok(Json(db::search_tags(&state.pool, &fragment).await?))
}

#[derive(Serialize)]
struct TagRenamed {
    renamed: String,
    updated_tags: u64,
}

async fn rename_tag(
    State(state): State<Arc<AppState>>,
    Path((current, updated)): Path<(String, String)>,
) -> Result<Json<TagRenamed>, ApiError> {
    let affected = db::rename_tag(&state.pool, &current, &updated).await?;
    Ok(Json(TagRenamed {
        renamed: format!("{current} >> {updated}"),
        updated_tags: affected,
    }))
}

#[derive(Serialize)]
struct TagMaintenanceResponse {
    normalized: u64,
}

async fn tag_maintenance(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TagMaintenanceResponse>, ApiError> {
    let normalized = db::tag_maintenance(&state.pool).await?;
    Ok(Json(TagMaintenanceResponse { normalized }))
}

//
// Images
//

#[derive(Serialize)]
struct BookImagesResponse {
    book_id: i64,
    images: Vec<ImageRecord>,
    count: usize,
}

async fn book_images(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BookImagesResponse>, ApiError> {
    let images = db::images_for_book(&state.pool, id).await?;
    Ok(Json(BookImagesResponse {
        book_id: id,
        count: images.len(),
        images,
    }))
}

#[derive(Deserialize)]
struct NewImageRequest {
    book_id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default = "default_image_kind")]
    kind: String,
}

fn default_image_kind() -> String {
    "cover-face".to_string()
}

async fn add_image(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewImageRequest>,
) -> Result<Json<ImageRecord>, ApiError> {
    if !db::book_exists(&state.pool, req.book_id).await? {
        return Err(ApiError::NotFound("book"));
    }
    if req.url.starts_with("http://") || req.url.starts_with("https://") {
        verify_remote_image(&state.http, &req.url).await?;
    }
    let id = db::insert_image(&state.pool, req.book_id, &req.name, &req.url, &req.kind).await?;
    Ok(Json(ImageRecord {
        id,
        book_id: req.book_id,
        name: req.name,
        url: req.url,
        kind: req.kind,
    }))
}

/// Check a remote URL is reachable and serves an image before persisting it.
async fn verify_remote_image(http: &reqwest::Client, url: &str) -> Result<(), ApiError> {
    let res = http.head(url).send().await;
    let res = match res {
        // Some hosts reject HEAD; retry with a one-byte ranged GET.
        Ok(r) if r.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => http
            .get(url)
            .header("Range", "bytes=0-0")
            .send()
            .await
            .map_err(|e| ApiError::BadRequest(format!("error verifying image URL: {e}")))?,
        Ok(r) => r,
        Err(e) => {
            return Err(ApiError::BadRequest(format!(
                "error verifying image URL: {e}"
            )))
        }
    };

    if !res.status().is_success() {
        return Err(ApiError::BadRequest(format!(
            "image URL not accessible (status {}): {url}",
            res.status()
        )));
    }
    let content_type = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("image/") {
        return Err(ApiError::BadRequest(format!(
            "URL does not appear to be an image (content-type: {content_type})"
        )));
    }
    Ok(())
}

#[derive(Serialize)]
struct UploadResponse {
    filename: String,
    path: String,
}

/// Multipart upload: a `file` part, plus an optional `filename` part that
/// overrides the client-supplied name. Names are sanitized before hitting
/// the filesystem.
async fn upload_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name = String::new();
    let mut override_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                original_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read file part: {e}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("filename") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read filename: {e}")))?;
                override_name = Some(text);
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| ApiError::BadRequest("no file part in request".into()))?;
    let filename = sanitize_filename(override_name.as_deref().unwrap_or(&original_name));
    if filename.is_empty() {
        return Err(ApiError::BadRequest("no filename supplied".into()));
    }

    let path = std::path::Path::new(&state.upload_dir).join(&filename);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to save file: {e}")))?;
    info!(path = %path.display(), "file uploaded");
    Ok(Json(UploadResponse {
        filename,
        path: path.to_string_lossy().to_string(),
    }))
}

/// Strip path components and reduce the name to a conservative character set.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

//
// Reports
//

#[derive(Deserialize)]
struct YearParams {
    year: Option<i32>,
}

async fn summary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearParams>,
) -> Result<Json<Vec<db::YearSummary>>, ApiError> {
    Ok(Json(db::year_summaries(&state.pool, params.year).await?))
}

async fn books_read(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearParams>,
) -> Result<Json<Vec<db::BookReadRow>>, ApiError> {
    Ok(Json(db::books_read(&state.pool, params.year).await?))
}

//
// Reading sessions
//

/// Projection field of session responses: either a concrete date or an
/// explicit no-estimate marker, never a bare null.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "status", content = "date", rename_all = "snake_case")]
enum Projection {
    Available(NaiveDate),
    NoEstimate,
}

impl From<Option<NaiveDate>> for Projection {
    fn from(value: Option<NaiveDate>) -> Self {
        match value {
            Some(date) => Projection::Available(date),
            None => Projection::NoEstimate,
        }
    }
}

#[derive(Serialize)]
struct SessionResponse {
    id: i64,
    book_id: i64,
    start_date: NaiveDate,
    total_pages: i64,
    estimated_at: Option<chrono::NaiveDateTime>,
    projected_finish: Projection,
}

impl From<ReadingSession> for SessionResponse {
    fn from(s: ReadingSession) -> Self {
        Self {
            id: s.id,
            book_id: s.book_id,
            start_date: s.start_date,
            total_pages: s.total_pages,
            estimated_at: s.estimated_at,
            projected_finish: s.projected_finish.into(),
        }
    }
}

#[derive(Deserialize)]
struct StartSessionRequest {
    total_pages: i64,
    #[serde(default)]
    start_date: Option<NaiveDate>,
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<i64>,
    Json(req): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session = state
        .estimator
        .start_session(book_id, req.total_pages, req.start_date)
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.estimator.session(id).await?;
    Ok(Json(session.into()))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<i64>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    if !db::book_exists(&state.pool, book_id).await? {
        return Err(ApiError::NotFound("book"));
    }
    let sessions = state.estimator.sessions_for_book(book_id).await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

#[derive(Deserialize)]
struct RecordObservationRequest {
    date: NaiveDate,
    page: i64,
}

#[derive(Serialize)]
struct ObservationResponse {
    observation: Observation,
    projected_finish: Projection,
}

async fn record_observation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<RecordObservationRequest>,
) -> Result<(StatusCode, Json<ObservationResponse>), ApiError> {
    let recorded = state
        .estimator
        .record_observation(id, req.date, req.page)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ObservationResponse {
            observation: recorded.observation,
            projected_finish: recorded.projected_finish.into(),
        }),
    ))
}

#[derive(Serialize)]
struct SeriesResponse {
    session_id: i64,
    series: Vec<SeriesPoint>,
}

async fn progress_series(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SeriesResponse>, ApiError> {
    // Surface a 404 for unknown sessions instead of an empty series.
    state.estimator.session(id).await?;
    let series = state.estimator.progress_series(id).await?;
    Ok(Json(SeriesResponse {
        session_id: id,
        series,
    }))
}
