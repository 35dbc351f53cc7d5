//! Persistence layer: libSQL-backed mailbox store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LibSqlStore, MailboxRow, NewMailbox, StoredAlert};
pub use traits::{MailboxRepository, QueueQuery};
