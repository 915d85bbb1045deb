//! JSON-file persistence for the roster and the submission queue.

pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;
