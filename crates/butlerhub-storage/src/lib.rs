pub mod db;
pub mod error;
pub mod migrations;

pub use db::{
    butler_db_path, open_shared_for_write, shared_db_path, state_get, state_set, to_butler_error,
    ButlerDb,
};
pub use error::{Result, StorageError};
