use std::future::Future;

use super::request::{Request, RequestError, Response};

/// Sends one request to the server. The queue owns retry and ordering;
/// implementations make exactly one attempt per call.
pub trait Transport {
    fn send(&self, request: &Request) -> impl Future<Output = Result<Response, RequestError>> + Send;
}
