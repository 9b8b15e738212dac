use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::cors::cors;
use crate::error::{PoolError, RepoError, ValidationError};
use crate::models::{BookId, BookInput, KeyMode};
use crate::repo::BookRepo;

#[derive(Clone)]
struct AppState<R> {
    repo: R,
}

pub fn build_app<R: BookRepo>(repo: R) -> Router {
    Router::new()
        .route("/api/books", get(list_books::<R>).post(insert_book::<R>))
        .route(
            "/api/books/{id}",
            put(update_book::<R>).delete(delete_book::<R>),
        )
        .fallback(route_not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn(cors))
        .with_state(AppState { repo })
}

async fn list_books<R: BookRepo>(State(state): State<AppState<R>>) -> Result<Json<Value>, ApiError> {
    let repo = state.repo;
    let books = run_blocking(move || repo.list_books()).await?;

    info!("Retrieved {} books from the DB", books.len());

    Ok(Json(json!({ "data": books })))
}

async fn insert_book<R: BookRepo>(
    State(state): State<AppState<R>>,
    body: Result<Json<BookInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(input) = body.map_err(invalid_body)?;

    let repo = state.repo;
    let book = run_blocking(move || repo.insert_book(input)).await?;

    info!("Inserted book into the DB: {:?}", book);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Book added successfully",
            "id": book.id,
            "data": book,
        })),
    ))
}

async fn update_book<R: BookRepo>(
    State(state): State<AppState<R>>,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<BookInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_book_id(path, state.repo.key_mode())?;
    let Json(input) = body.map_err(invalid_body)?;

    let repo = state.repo;
    let target = id.clone();
    let updated_book = run_blocking(move || repo.update_book(&target, input)).await?;

    match updated_book {
        Some(book) => {
            info!("Updated book in DB: {:?}", book);
            Ok(Json(json!({
                "message": "Book updated successfully",
                "data": book,
            })))
        }
        None => {
            info!("Tried to update non-existent book with ID: {}", id);
            Err(ApiError::NotFound(format!("No book found with ID: {}", id)))
        }
    }
}

async fn delete_book<R: BookRepo>(
    State(state): State<AppState<R>>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_book_id(path, state.repo.key_mode())?;

    let repo = state.repo;
    let target = id.clone();
    let deleted = run_blocking(move || repo.delete_book(&target)).await?;

    if deleted {
        info!("Deleted book from DB with ID: {}", id);
        Ok(Json(json!({ "message": "Book deleted successfully" })))
    } else {
        info!("Tried to delete non-existent book with ID: {}", id);
        Err(ApiError::NotFound(format!("No book found with ID: {}", id)))
    }
}

async fn route_not_found() -> ApiError {
    ApiError::NotFound("No such route".to_string())
}

async fn method_not_allowed(method: Method) -> ApiError {
    ApiError::MethodNotAllowed(format!("Method {} is not allowed on this route", method))
}

/// Runs a repository call on the blocking thread pool.
async fn run_blocking<T, F>(operation: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, RepoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| ApiError::Internal(format!("worker thread failed: {e}")))?
        .map_err(ApiError::from)
}

fn parse_book_id(
    path: Result<Path<String>, PathRejection>,
    mode: KeyMode,
) -> Result<BookId, ApiError> {
    let Path(id) = path.map_err(invalid_path)?;
    BookId::parse(&id, mode).map_err(ApiError::from)
}

fn invalid_path(rejection: PathRejection) -> ApiError {
    ApiError::BadRequest(format!("Invalid book ID: {}", rejection.body_text()))
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    ApiError::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    MethodNotAllowed(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<RepoError> for ApiError {
    fn from(error: RepoError) -> Self {
        match &error {
            RepoError::Validation(_) => ApiError::BadRequest(error.to_string()),
            RepoError::Conflict(_) => ApiError::Conflict(error.to_string()),
            RepoError::Pool(PoolError::Exhausted { .. } | PoolError::Closed) => {
                ApiError::Unavailable(error.to_string())
            }
            RepoError::Pool(_) | RepoError::Store(_) | RepoError::Integrity(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "validation_error", message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::MethodNotAllowed(message) => {
                (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", message)
            }
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            ApiError::Unavailable(message) => {
                error!("Rejecting request, database unavailable: {}", message);
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
            }
            ApiError::Internal(message) => {
                error!("Request failed: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };

        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, HeaderMap, Request};
    use tower::ServiceExt;

    use crate::models::Book;

    /// In-memory stand-in for the SQLite repository.
    #[derive(Clone, Default)]
    struct FakeRepo {
        books: Arc<Mutex<Vec<Book>>>,
        failure: Option<fn() -> RepoError>,
    }

    impl FakeRepo {
        fn failing(failure: fn() -> RepoError) -> Self {
            FakeRepo {
                failure: Some(failure),
                ..Default::default()
            }
        }

        fn check(&self) -> Result<(), RepoError> {
            match self.failure {
                Some(make_error) => Err(make_error()),
                None => Ok(()),
            }
        }

        fn count(&self) -> usize {
            self.books.lock().unwrap().len()
        }
    }

    impl BookRepo for FakeRepo {
        fn key_mode(&self) -> KeyMode {
            KeyMode::Surrogate
        }

        fn list_books(&self) -> Result<Vec<Book>, RepoError> {
            self.check()?;
            Ok(self.books.lock().unwrap().clone())
        }

        fn insert_book(&self, input: BookInput) -> Result<Book, RepoError> {
            let (_, new_book) = input.validate_for_create(KeyMode::Surrogate)?;
            self.check()?;
            let mut books = self.books.lock().unwrap();
            let book = Book::from_new(BookId::Assigned(books.len() as i64 + 1), new_book);
            books.push(book.clone());
            Ok(book)
        }

        fn update_book(&self, id: &BookId, input: BookInput) -> Result<Option<Book>, RepoError> {
            let new_book = input.validate_for_update(KeyMode::Surrogate)?;
            self.check()?;
            let mut books = self.books.lock().unwrap();
            Ok(books.iter_mut().find(|book| &book.id == id).map(|book| {
                *book = Book::from_new(id.clone(), new_book);
                book.clone()
            }))
        }

        fn delete_book(&self, id: &BookId) -> Result<bool, RepoError> {
            self.check()?;
            let mut books = self.books.lock().unwrap();
            let before = books.len();
            books.retain(|book| &book.id != id);
            Ok(books.len() < before)
        }
    }

    const DUNE: &str = r#"{"title":"Dune","author":"Herbert","isbn":"0441013597","category":"SciFi"}"#;

    async fn send(
        repo: &FakeRepo,
        method: Method,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, HeaderMap, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = build_app(repo.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, headers, json)
    }

    #[tokio::test]
    async fn lists_books_in_a_data_envelope() {
        let repo = FakeRepo::default();

        let (status, _, body) = send(&repo, Method::GET, "/api/books", None).await;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!({ "data": [] }), body);
    }

    #[tokio::test]
    async fn creates_a_book() {
        let repo = FakeRepo::default();

        let (status, _, body) = send(&repo, Method::POST, "/api/books", Some(DUNE)).await;

        assert_eq!(StatusCode::CREATED, status);
        assert_eq!("Book added successfully", body["message"]);
        assert_eq!(1, body["id"]);
        assert_eq!("available", body["data"]["status"]);
        assert_eq!(1, repo.count());
    }

    #[tokio::test]
    async fn rejects_a_missing_field_without_inserting() {
        let repo = FakeRepo::default();
        let body = r#"{"title":"Dune","author":"Herbert"}"#;

        let (status, _, body) = send(&repo, Method::POST, "/api/books", Some(body)).await;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!("validation_error", body["error"]);
        assert_eq!("Missing required field: isbn", body["message"]);
        assert_eq!(0, repo.count());
    }

    #[tokio::test]
    async fn rejects_malformed_and_absent_bodies() {
        // The failure must come from body parsing, not from the store
        let repo = FakeRepo::failing(|| RepoError::Integrity("store touched".to_string()));

        let (status, _, body) = send(&repo, Method::POST, "/api/books", Some("{not json")).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!("validation_error", body["error"]);

        let (status, _, _) = send(&repo, Method::POST, "/api/books", None).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);

        let (status, _, _) = send(&repo, Method::PUT, "/api/books/1", Some("[]")).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_books() {
        let repo = FakeRepo::default();

        let (status, _, body) = send(&repo, Method::PUT, "/api/books/99", Some(DUNE)).await;
        assert_eq!(StatusCode::NOT_FOUND, status);
        assert_eq!("No book found with ID: 99", body["message"]);

        let (status, _, _) = send(&repo, Method::DELETE, "/api/books/99", None).await;
        assert_eq!(StatusCode::NOT_FOUND, status);
    }

    #[tokio::test]
    async fn rejects_non_numeric_ids_for_surrogate_keys() {
        let repo = FakeRepo::default();

        let (status, _, body) = send(&repo, Method::DELETE, "/api/books/abc", None).await;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!("Invalid book ID: abc", body["message"]);
    }

    #[tokio::test]
    async fn unsupported_methods_get_a_json_error() {
        let repo = FakeRepo::default();

        let (status, headers, body) = send(&repo, Method::GET, "/api/books/1", None).await;
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, status);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!("method_not_allowed", body["error"]);
        assert_eq!("Method GET is not allowed on this route", body["message"]);

        let (status, headers, body) = send(&repo, Method::PATCH, "/api/books", None).await;
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, status);
        assert_eq!("method_not_allowed", body["error"]);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn undecodable_path_ids_get_a_json_error() {
        let repo = FakeRepo::default();

        let (status, headers, body) = send(&repo, Method::DELETE, "/api/books/%FF", None).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!("validation_error", body["error"]);
        assert!(body["message"].as_str().unwrap().starts_with("Invalid book ID"));

        let (status, _, body) = send(&repo, Method::PUT, "/api/books/%FF", Some(DUNE)).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!("validation_error", body["error"]);
    }

    #[tokio::test]
    async fn updates_then_deletes() {
        let repo = FakeRepo::default();
        send(&repo, Method::POST, "/api/books", Some(DUNE)).await;

        let borrowed = DUNE.replace("\"category\"", "\"status\":\"borrowed\",\"category\"");
        let (status, _, body) = send(&repo, Method::PUT, "/api/books/1", Some(&borrowed)).await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!("Book updated successfully", body["message"]);
        assert_eq!("borrowed", body["data"]["status"]);

        let (status, _, body) = send(&repo, Method::DELETE, "/api/books/1", None).await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!("Book deleted successfully", body["message"]);

        let (status, _, _) = send(&repo, Method::DELETE, "/api/books/1", None).await;
        assert_eq!(StatusCode::NOT_FOUND, status);
    }

    #[tokio::test]
    async fn pool_exhaustion_is_service_unavailable() {
        let repo = FakeRepo::failing(|| {
            RepoError::Pool(PoolError::Exhausted {
                timeout: Duration::from_millis(10),
            })
        });

        let (status, _, body) = send(&repo, Method::GET, "/api/books", None).await;

        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, status);
        assert_eq!("service_unavailable", body["error"]);
    }

    #[tokio::test]
    async fn store_errors_include_the_store_message() {
        let repo = FakeRepo::failing(|| {
            RepoError::Store(diesel::result::Error::QueryBuilderError("disk I/O error".into()))
        });

        let (status, _, body) = send(&repo, Method::GET, "/api/books", None).await;

        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, status);
        assert!(body["message"].as_str().unwrap().contains("disk I/O error"));
    }

    #[tokio::test]
    async fn duplicate_keys_are_conflicts() {
        let repo =
            FakeRepo::failing(|| RepoError::Conflict(BookId::External("B-1".to_string())));

        let (status, _, body) = send(&repo, Method::POST, "/api/books", Some(DUNE)).await;

        assert_eq!(StatusCode::CONFLICT, status);
        assert_eq!("a book with ID B-1 already exists", body["message"]);
    }

    #[tokio::test]
    async fn every_response_carries_cors_headers() {
        let repo = FakeRepo::default();

        let (status, headers, body) = send(&repo, Method::GET, "/nowhere", None).await;
        assert_eq!(StatusCode::NOT_FOUND, status);
        assert_eq!("not_found", body["error"]);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let (status, headers, body) = send(&repo, Method::OPTIONS, "/api/books/7", None).await;
        assert_eq!(StatusCode::NO_CONTENT, status);
        assert_eq!(Value::Null, body);
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, PUT, DELETE, OPTIONS"
        );
    }
}
