//! Correlation ids for request logs.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub correlation_id: String,
}

/// A usable client-supplied `x-request-id`, if any.
fn supplied_request_id(headers: &HeaderMap) -> Option<HeaderValue> {
    let value = headers.get(REQUEST_ID_HEADER)?;
    let trimmed = value.to_str().ok()?.trim();
    if trimmed.is_empty() {
        return None;
    }
    HeaderValue::from_str(trimmed).ok()
}

/// Resolve the correlation id before the trace span is built.
///
/// The id is written back into the request headers, so spans and handlers
/// see the same id as the `x-request-id` response header.
pub async fn attach_request_context(mut req: Request, next: Next) -> Response {
    let header_value = supplied_request_id(req.headers()).unwrap_or_else(|| {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("-"))
    });
    let correlation_id = header_value.to_str().unwrap_or("-").to_string();

    req.headers_mut()
        .insert(REQUEST_ID_HEADER, header_value.clone());
    req.extensions_mut().insert(RequestContext { correlation_id });

    let mut response = next.run(req).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    response
}
