//! Remote service boundary and the typed client built on top of it.

mod client;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod operation;
pub mod types;

pub use client::ApiClient;
pub use error::FetchError;
pub use executor::{HttpExecutor, RequestExecutor};
pub use operation::{HttpMethod, Operation};
