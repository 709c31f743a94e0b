pub mod db;
mod expiry;
pub mod models;
mod rows;
mod tables;

pub use db::{Database, DatabaseError};
pub use rows::{composite, ConditionalWrite, Row, RowKey};
pub use tables::*;
