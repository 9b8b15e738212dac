use crate::error::RepoError;
use crate::models::{Book, BookId, BookInput, KeyMode};

/// Book storage. Operations block the calling thread; the HTTP layer runs
/// them on the blocking thread pool.
///
/// Create and update validate their input before any store access.
pub trait BookRepo: Clone + Send + Sync + 'static {
    fn key_mode(&self) -> KeyMode;

    fn list_books(&self) -> Result<Vec<Book>, RepoError>;

    fn insert_book(&self, input: BookInput) -> Result<Book, RepoError>;

    /// Returns None if there is no book with the given ID
    fn update_book(&self, id: &BookId, input: BookInput) -> Result<Option<Book>, RepoError>;

    /// Returns true if the book existed and was deleted, false otherwise
    fn delete_book(&self, id: &BookId) -> Result<bool, RepoError>;
}
