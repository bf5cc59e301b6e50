use hyper::body::HttpBody;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, LOCATION};
use hyper::StatusCode;

use crate::error::{ResourceError, RouterError, RouterResult};
use crate::table::Incoming;

pub use hyper::body::Bytes;
pub use hyper::Body;

/// An HTTP request as received from the container.
pub type Request = hyper::Request<Body>;

/// An HTTP response.
///
/// Renderers build responses with a [`ResponseBuilder`]:
///
/// ```
/// # use switchyard::{Body, ResponseBuilder};
/// let response = ResponseBuilder::new()
///     .status(404)
///     .header("X-Custom-Foo", "Bar")
///     .body(Body::from("Page not found."))
///     .unwrap();
/// assert_eq!(response.status(), 404);
/// ```
pub type Response = hyper::Response<Body>;

/// A builder for constructing HTTP responses with a fluent API.
pub type ResponseBuilder = hyper::http::response::Builder;

/// Header carrying the client-facing scheme when behind a TLS terminator.
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// An empty response with the given status.
pub fn status(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// `303 See Other` pointing at `location`.
pub fn see_other(location: &str) -> RouterResult<Response> {
    redirect(StatusCode::SEE_OTHER, location)
}

/// `301 Moved Permanently` pointing at `location`.
pub fn moved_permanently(location: &str) -> RouterResult<Response> {
    redirect(StatusCode::MOVED_PERMANENTLY, location)
}

fn redirect(code: StatusCode, location: &str) -> RouterResult<Response> {
    let value = HeaderValue::from_str(location).map_err(RouterError::application)?;
    let mut response = status(code);
    response.headers_mut().insert(LOCATION, value);
    Ok(response)
}

/// Whether a trusted proxy reports the client connection as TLS.
pub fn forwarded_secure(headers: &HeaderMap) -> bool {
    headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|proto| proto.trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// Reads the whole body so the request can be handed to a worker.
///
/// # Errors
/// Fails with `413 Payload Too Large` once the declared or received body
/// exceeds `limit` bytes, and with `400 Bad Request` when the body cannot
/// be read.
pub async fn buffer(request: Request, secure: bool, limit: usize) -> RouterResult<Incoming> {
    let (head, mut body) = request.into_parts();

    let declared = head
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.map_or(false, |len| len > limit as u64) {
        return Err(ResourceError::payload_too_large(limit).into());
    }

    let mut collected = Vec::with_capacity(declared.map_or(0, |len| len as usize));
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| {
            RouterError::from(ResourceError::bad_request(format!(
                "unreadable request body: {}",
                err
            )))
        })?;
        if collected.len() + chunk.len() > limit {
            return Err(ResourceError::payload_too_large(limit).into());
        }
        collected.extend_from_slice(&chunk);
    }

    Ok(Incoming {
        head,
        body: Bytes::from(collected),
        secure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_sets_location() {
        let response = see_other("/login?uri=%2Fadmin").unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/login?uri=%2Fadmin");

        let response = moved_permanently("https://example.com/admin").unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[test]
    fn test_invalid_location_rejected() {
        let err = see_other("/bad\nheader").unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_forwarded_proto() {
        let mut headers = HeaderMap::new();
        assert!(!forwarded_secure(&headers));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("HTTPS, http"));
        assert!(forwarded_secure(&headers));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        assert!(!forwarded_secure(&headers));
    }

    #[tokio::test]
    async fn test_buffer_collects_body() {
        let request = hyper::Request::post("/users")
            .body(Body::from("name=ada"))
            .unwrap();
        let incoming = buffer(request, true, 64).await.unwrap();
        assert_eq!(&incoming.body[..], b"name=ada");
        assert!(incoming.secure);
        assert_eq!(incoming.head.uri.path(), "/users");
    }

    #[tokio::test]
    async fn test_buffer_rejects_oversized_body() {
        let declared = hyper::Request::post("/upload")
            .header(CONTENT_LENGTH, "4096")
            .body(Body::empty())
            .unwrap();
        let err = buffer(declared, false, 1024).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            for _ in 0..4 {
                if sender.send_data(Bytes::from(vec![b'x'; 512])).await.is_err() {
                    break;
                }
            }
        });
        let streamed = hyper::Request::post("/upload").body(body).unwrap();
        let err = buffer(streamed, false, 1024).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
