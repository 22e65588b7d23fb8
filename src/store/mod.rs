//! SQLite persistence: connection management, table layout, reads and writes.

mod connection;
mod reader;
mod schema;
mod writer;

pub use connection::{JournalMode, Store, StoreOptions, TransactionBehavior};
pub use reader::{RawRow, RecordReader};
pub use schema::{ensure_table, SqlValue, TABLE_NAME};
pub use writer::RecordWriter;

pub(crate) use schema::{insert_sql, insert_values, placeholders, read_values, select_list};
