pub mod games;
pub mod health;
pub mod ingest;
pub mod polling;
pub mod stream;
