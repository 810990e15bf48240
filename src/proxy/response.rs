//! Responses the proxy generates itself

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Plain-text error from the proxy (502 for upstream failures).
pub fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(format!("Proxy error: {}\n", message)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

pub fn bad_gateway(message: &str) -> Response<Bytes> {
    error_response(StatusCode::BAD_GATEWAY, message)
}

/// Wrap a buffered body for hyper.
pub fn full(response: Response<Bytes>) -> Response<Full<Bytes>> {
    response.map(Full::new)
}
