//! Re-issuing the original request once its host exists

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Build the redirect location from the original path and query string.
///
/// `uri` is the path as received. It is re-emitted still percent-encoded,
/// not decoded, so the `Location` header stays a valid URI reference for
/// paths holding spaces, `?` or non-ASCII text. Decoding is used only to
/// recognise `index.cfm`. A bare
/// `index.cfm` hit without a query string points back at the site root so
/// the default document resolves again on the new host.
pub fn redirect_target(uri: &str, query: Option<&str>) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{}?{}", uri, query),
        None if is_bare_index(uri) || uri.is_empty() => "/".to_string(),
        None => uri.to_string(),
    }
}

fn is_bare_index(uri: &str) -> bool {
    let decoded = urlencoding::decode(uri).map(|d| d.into_owned());
    let path = decoded.as_deref().unwrap_or(uri);
    path == "index.cfm" || path == "/index.cfm"
}

/// `302 Found` pointing at `location`
pub fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Host provisioned, redirecting"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| {
            // Only reachable when `location` is not a valid header value
            Response::builder()
                .status(StatusCode::FOUND)
                .header(hyper::header::LOCATION, "/")
                .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
                .expect("valid response with static header")
        })
}
