//! HTTP client stack for the chat backend.
//!
//! [`Transport`] is the platform primitive (one request, no policy). [`RequestExecutor`] adds the
//! per-request timeout and status/JSON normalization, and [`RetryController`] wraps any attempt in
//! bounded exponential backoff.

mod executor;
mod retry;
mod transport;

pub use executor::{ApiResponse, RequestExecutor, RequestOptions};
pub use retry::{RetryController, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport};
