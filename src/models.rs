use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const DEFAULT_STATUS: &str = "available";

/// How book identifiers are assigned. Fixed for the lifetime of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyMode {
    /// The store assigns an auto-incrementing integer
    Surrogate,
    /// The caller supplies a string key on create
    External,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMode::Surrogate => write!(f, "surrogate"),
            KeyMode::External => write!(f, "external"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BookId {
    Assigned(i64),
    External(String),
}

impl BookId {
    pub fn parse(raw: &str, mode: KeyMode) -> Result<BookId, ValidationError> {
        match mode {
            KeyMode::Surrogate => raw
                .parse::<i64>()
                .map(BookId::Assigned)
                .map_err(|_| ValidationError::InvalidId(raw.to_string())),
            KeyMode::External if raw.trim().is_empty() => {
                Err(ValidationError::InvalidId(raw.to_string()))
            }
            KeyMode::External => Ok(BookId::External(raw.to_string())),
        }
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookId::Assigned(id) => write!(f, "{id}"),
            BookId::External(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub category: String,
    pub status: String,
    pub publish_date: String,
    pub description: String,
    pub interview_times: i32,
    pub price: f64,
}

impl Book {
    pub fn from_new(id: BookId, new_book: NewBook) -> Book {
        Book {
            id,
            title: new_book.title,
            author: new_book.author,
            isbn: new_book.isbn,
            category: new_book.category,
            status: new_book.status,
            publish_date: new_book.publish_date,
            description: new_book.description,
            interview_times: new_book.interview_times,
            price: new_book.price,
        }
    }
}

/// A request body for create or update, before validation.
///
/// Every field is optional here so that a missing field can be reported by
/// name instead of surfacing as a generic deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookInput {
    #[serde(alias = "book_id")]
    pub id: Option<BookId>,
    #[serde(alias = "name", alias = "book_name")]
    pub title: Option<String>,
    #[serde(alias = "book_author")]
    pub author: Option<String>,
    #[serde(alias = "book_isbn")]
    pub isbn: Option<String>,
    #[serde(alias = "publisher", alias = "book_publisher")]
    pub category: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "publish_date")]
    pub publish_date: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "interview_times")]
    pub interview_times: Option<i32>,
    #[serde(alias = "book_price")]
    pub price: Option<f64>,
}

/// A validated set of book fields, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub category: String,
    pub status: String,
    pub publish_date: String,
    pub description: String,
    pub interview_times: i32,
    pub price: f64,
}

impl BookInput {
    /// Validates a create request. In external-key mode the caller's id is
    /// returned alongside the fields; in surrogate mode any supplied id is
    /// ignored.
    pub fn validate_for_create(
        self,
        mode: KeyMode,
    ) -> Result<(Option<BookId>, NewBook), ValidationError> {
        let id = match mode {
            KeyMode::External => Some(external_id(self.id.clone())?),
            KeyMode::Surrogate => None,
        };
        let new_book = self.validate_fields(mode)?;
        Ok((id, new_book))
    }

    pub fn validate_for_update(self, mode: KeyMode) -> Result<NewBook, ValidationError> {
        self.validate_fields(mode)
    }

    fn validate_fields(self, mode: KeyMode) -> Result<NewBook, ValidationError> {
        let title = required(self.title, "title")?;
        let isbn = required(self.isbn, "isbn")?;
        let author = required(self.author, "author")?;
        let category = match mode {
            KeyMode::External => required(self.category, "category")?,
            KeyMode::Surrogate => self.category.unwrap_or_default(),
        };

        let status = self
            .status
            .filter(|status| !status.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string());

        Ok(NewBook {
            title,
            author,
            isbn,
            category,
            status,
            publish_date: self.publish_date.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            interview_times: self.interview_times.unwrap_or(0),
            price: self.price.unwrap_or(0.0),
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ValidationError::MissingField(field)),
    }
}

fn external_id(id: Option<BookId>) -> Result<BookId, ValidationError> {
    match id {
        Some(BookId::External(id)) if !id.trim().is_empty() => Ok(BookId::External(id)),
        // A numeric key in JSON is still a caller-supplied key
        Some(BookId::Assigned(id)) => Ok(BookId::External(id.to_string())),
        _ => Err(ValidationError::MissingField("id")),
    }
}
