pub mod db;
pub mod error;
pub mod link;
pub mod source;
pub mod sqlite;
pub mod types;

pub use error::StoreError;
pub use link::{SharedStore, StoreLink};
pub use source::{Connector, OutcomeSource};
pub use sqlite::{SqliteConnector, SqliteSource};
pub use types::{AnnotationOrigin, AnnotationRecord, GameSummary, OutcomeRecord};
