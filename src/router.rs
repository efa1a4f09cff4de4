//! Downstream request handling for requests the engine passes through

use crate::error::{json_error_response, GatewayErrorCode};
use crate::hostname;
use crate::registry::HostTable;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Answers requests for hosts the runtime knows about
pub struct HostRouter {
    table: Arc<HostTable>,
}

impl HostRouter {
    pub fn new(table: Arc<HostTable>) -> Self {
        Self { table }
    }

    pub fn serve<B>(&self, req: &Request<B>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let raw_host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();
        let name = hostname::normalize(&raw_host);

        let Some(host) = self.table.resolve(&name) else {
            debug!(host = %name, requested = %hostname::denormalize(&name), "No host for request");
            // Don't reveal which hosts exist
            return json_error_response(GatewayErrorCode::UnknownHost, "Unknown or unconfigured host");
        };

        let body = match host.deployed_doc_root() {
            Some(doc_root) => format!(
                "host: {}\ndoc_root: {}\npath: {}\n",
                host.name(),
                doc_root.display(),
                req.uri().path()
            ),
            None => format!("host: {}\nstatus: deploying\npath: {}\n", host.name(), req.uri().path()),
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .header("X-Served-By-Host", host.name())
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| {
                json_error_response(GatewayErrorCode::InternalError, "Failed to build response")
            })
    }
}
