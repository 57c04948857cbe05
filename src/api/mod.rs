//! REST API over the ingestion services

pub mod handlers;
pub mod server;
pub mod types;

pub use server::{router, ApiServer};
