use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use diesel::connection::{AnsiTransactionManager, SimpleConnection, TransactionManager};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use diesel::{
    sql_query, Connection, ConnectionError, QueryableByName, RunQueryDsl, SelectableHelper,
};
use tracing::info;

use crate::config::Config;
use crate::error::{RepoError, SqlitePoolError, StartupError};
use crate::models::{Book, BookId, BookInput, KeyMode, NewBook};
use crate::pool::{ConnectionManager, ConnectionPool, PoolConfig};
use crate::repo::BookRepo;

pub type SqlitePool = ConnectionPool<SqliteConnectionManager>;

/// Opens SQLite connections with a busy timeout, which bounds how long a
/// statement waits on a lock held by another connection or process.
pub struct SqliteConnectionManager {
    database_url: String,
    busy_timeout: Duration,
}

impl SqliteConnectionManager {
    pub fn new(database_url: impl Into<String>, busy_timeout: Duration) -> Self {
        SqliteConnectionManager {
            database_url: database_url.into(),
            busy_timeout,
        }
    }
}

impl ConnectionManager for SqliteConnectionManager {
    type Connection = SqliteConnection;
    type Error = ConnectionError;

    fn connect(&self) -> Result<SqliteConnection, ConnectionError> {
        let mut conn = SqliteConnection::establish(&self.database_url)?;
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(ConnectionError::CouldntSetupConfiguration)?;
        Ok(conn)
    }

    /// A connection returned mid-transaction, with its transaction manager
    /// in an error state, or during a panic is not handed out again.
    fn has_broken(&self, conn: &mut SqliteConnection) -> bool {
        std::thread::panicking() || AnsiTransactionManager::is_broken_transaction_manager(conn)
    }
}

pub fn create_db_pool(config: &Config) -> Result<SqlitePool, SqlitePoolError> {
    let manager = SqliteConnectionManager::new(
        config.database_url.clone(),
        Duration::from_millis(config.busy_timeout_ms),
    );
    ConnectionPool::new(
        manager,
        PoolConfig {
            max_size: config.pool_size,
            acquire_timeout: Duration::from_millis(config.pool_timeout_ms),
        },
    )
}

const SURROGATE_ID_COLUMN: &str = "id INTEGER PRIMARY KEY AUTOINCREMENT";
const EXTERNAL_ID_COLUMN: &str = "id TEXT PRIMARY KEY NOT NULL";

const ID_COLUMN_TYPE: &str =
    "SELECT type AS column_type FROM pragma_table_info('books') WHERE name = 'id'";

#[derive(QueryableByName)]
struct ColumnType {
    #[diesel(sql_type = Text)]
    column_type: String,
}

/// Row types and statements for one key mode's `books` table.
macro_rules! book_statements {
    ($mode:ident, id: $id:ty, key: $key:ty, wrap: $wrap:path) => {
        mod $mode {
            use diesel::prelude::*;
            use diesel::sqlite::SqliteConnection;

            use crate::models::{Book, BookId, NewBook};
            use crate::schema::$mode::books;

            #[derive(diesel::Queryable, diesel::Selectable)]
            #[diesel(table_name = books)]
            #[diesel(check_for_backend(diesel::sqlite::Sqlite))]
            pub(super) struct BookRow {
                id: $id,
                title: String,
                author: String,
                isbn: String,
                category: String,
                status: String,
                publish_date: String,
                description: String,
                interview_times: i32,
                price: f64,
            }

            impl From<BookRow> for Book {
                fn from(row: BookRow) -> Book {
                    Book {
                        id: $wrap(row.id),
                        title: row.title,
                        author: row.author,
                        isbn: row.isbn,
                        category: row.category,
                        status: row.status,
                        publish_date: row.publish_date,
                        description: row.description,
                        interview_times: row.interview_times,
                        price: row.price,
                    }
                }
            }

            #[derive(diesel::Insertable, diesel::AsChangeset)]
            #[diesel(table_name = books)]
            pub(super) struct BookFields<'a> {
                title: &'a str,
                author: &'a str,
                isbn: &'a str,
                category: &'a str,
                status: &'a str,
                publish_date: &'a str,
                description: &'a str,
                interview_times: i32,
                price: f64,
            }

            impl<'a> From<&'a NewBook> for BookFields<'a> {
                fn from(book: &'a NewBook) -> Self {
                    BookFields {
                        title: &book.title,
                        author: &book.author,
                        isbn: &book.isbn,
                        category: &book.category,
                        status: &book.status,
                        publish_date: &book.publish_date,
                        description: &book.description,
                        interview_times: book.interview_times,
                        price: book.price,
                    }
                }
            }

            pub(super) fn list(conn: &mut SqliteConnection) -> QueryResult<Vec<Book>> {
                let rows = books::table
                    .select(BookRow::as_select())
                    .load::<BookRow>(conn)?;
                Ok(rows.into_iter().map(Book::from).collect())
            }

            pub(super) fn update(
                conn: &mut SqliteConnection,
                key: $key,
                book: &NewBook,
            ) -> QueryResult<Option<Book>> {
                let updated_row = diesel::update(books::table.find(key))
                    .set(BookFields::from(book))
                    .returning(BookRow::as_returning())
                    .get_result::<BookRow>(conn)
                    .optional()?;

                Ok(updated_row.map(Book::from))
            }

            pub(super) fn delete(conn: &mut SqliteConnection, key: $key) -> QueryResult<bool> {
                diesel::delete(books::table.find(key))
                    .execute(conn)
                    .map(|affected_rows| affected_rows == 1)
            }
        }
    };
}

book_statements!(surrogate, id: i64, key: i64, wrap: BookId::Assigned);
book_statements!(external, id: String, key: &str, wrap: BookId::External);

#[derive(diesel::Insertable)]
#[diesel(table_name = crate::schema::external::books)]
struct KeyedBookFields<'a> {
    id: &'a str,
    #[diesel(embed)]
    fields: external::BookFields<'a>,
}

/// SQLite-backed [`BookRepo`].
///
/// SQLite allows one writer per database file, so statements from all pooled
/// connections are serialized through a single lock owned by the repository.
/// The lock is only taken after a connection has been acquired and each
/// operation holds one connection, so a thread holding the lock never waits
/// on the pool.
#[derive(Clone)]
pub struct DatabaseBookRepo {
    pool: Arc<SqlitePool>,
    key_mode: KeyMode,
    statement_lock: Arc<Mutex<()>>,
}

impl DatabaseBookRepo {
    /// Creates the books table if it does not exist yet and checks that an
    /// existing one was created for the same key mode.
    pub fn new(pool: Arc<SqlitePool>, key_mode: KeyMode) -> Result<Self, StartupError> {
        let repo = DatabaseBookRepo {
            pool,
            key_mode,
            statement_lock: Arc::new(Mutex::new(())),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    pub fn pool(&self) -> &Arc<SqlitePool> {
        &self.pool
    }

    fn ensure_schema(&self) -> Result<(), StartupError> {
        let id_column = match self.key_mode {
            KeyMode::Surrogate => SURROGATE_ID_COLUMN,
            KeyMode::External => EXTERNAL_ID_COLUMN,
        };
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS books (
                {id_column},
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                isbn TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'available',
                publish_date TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                interview_times INTEGER NOT NULL DEFAULT 0,
                price REAL NOT NULL DEFAULT 0.0
            );"
        );

        let column_types = self
            .with_connection(|conn| {
                conn.batch_execute(&create_table)?;
                Ok(sql_query(ID_COLUMN_TYPE).load::<ColumnType>(conn)?)
            })
            .map_err(StartupError::Schema)?;

        let found = match column_types.first() {
            Some(column) if column.column_type.eq_ignore_ascii_case("INTEGER") => {
                KeyMode::Surrogate
            }
            Some(_) => KeyMode::External,
            None => {
                return Err(StartupError::Schema(RepoError::Integrity(
                    "books table has no id column".to_string(),
                )))
            }
        };

        if found != self.key_mode {
            return Err(StartupError::KeyModeMismatch {
                configured: self.key_mode,
                found,
            });
        }

        info!("Books table ready ({} keys)", self.key_mode);
        Ok(())
    }

    /// Runs one operation on one pooled connection. The connection goes back
    /// to the pool when this returns, on success and error alike.
    fn with_connection<T>(
        &self,
        operation: impl FnOnce(&mut SqliteConnection) -> Result<T, RepoError>,
    ) -> Result<T, RepoError> {
        let mut conn = self.pool.acquire()?;
        let _exclusive = self
            .statement_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        operation(&mut *conn)
    }
}

impl BookRepo for DatabaseBookRepo {
    fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    fn list_books(&self) -> Result<Vec<Book>, RepoError> {
        let key_mode = self.key_mode;
        let books = self.with_connection(|conn| {
            let books = match key_mode {
                KeyMode::Surrogate => surrogate::list(conn)?,
                KeyMode::External => external::list(conn)?,
            };
            Ok(books)
        })?;

        Ok(books)
    }

    fn insert_book(&self, input: BookInput) -> Result<Book, RepoError> {
        let (external_id, new_book) = input.validate_for_create(self.key_mode)?;

        self.with_connection(|conn| match external_id {
            Some(id) => insert_with_id(conn, id, &new_book),
            None => insert_with_surrogate(conn, &new_book),
        })
    }

    fn update_book(&self, id: &BookId, input: BookInput) -> Result<Option<Book>, RepoError> {
        let new_book = input.validate_for_update(self.key_mode)?;

        self.with_connection(|conn| {
            let updated_book = match id {
                BookId::Assigned(key) => surrogate::update(conn, *key, &new_book)?,
                BookId::External(key) => external::update(conn, key, &new_book)?,
            };
            Ok(updated_book)
        })
    }

    fn delete_book(&self, id: &BookId) -> Result<bool, RepoError> {
        self.with_connection(|conn| {
            let deleted = match id {
                BookId::Assigned(key) => surrogate::delete(conn, *key)?,
                BookId::External(key) => external::delete(conn, key)?,
            };
            Ok(deleted)
        })
    }
}

fn insert_with_surrogate(conn: &mut SqliteConnection, book: &NewBook) -> Result<Book, RepoError> {
    use crate::schema::surrogate::books;

    let inserted_row = diesel::insert_into(books::table)
        .values(surrogate::BookFields::from(book))
        .returning(surrogate::BookRow::as_returning())
        .get_result::<surrogate::BookRow>(conn)?;

    Ok(Book::from(inserted_row))
}

fn insert_with_id(
    conn: &mut SqliteConnection,
    id: BookId,
    book: &NewBook,
) -> Result<Book, RepoError> {
    use crate::schema::external::books;

    let BookId::External(key) = &id else {
        return Err(RepoError::Integrity(format!(
            "book ID {id} is not a caller-supplied key"
        )));
    };

    let inserted = diesel::insert_into(books::table)
        .values(KeyedBookFields {
            id: key,
            fields: external::BookFields::from(book),
        })
        .returning(external::BookRow::as_returning())
        .get_result::<external::BookRow>(conn);

    match inserted {
        Ok(inserted_row) => Ok(Book::from(inserted_row)),
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            Err(RepoError::Conflict(id))
        }
        Err(e) => Err(e.into()),
    }
}
