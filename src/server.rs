//! The intercepting HTTP server
//!
//! Every request runs through the provisioning engine first. Redirects and
//! rejections are answered here; everything else goes on to [`HostRouter`].

use crate::engine::{Disposition, ProvisionRequest, ProvisioningEngine};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::redirect::redirect_response;
use crate::router::HostRouter;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// The intercepting HTTP server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    engine: Arc<ProvisioningEngine>,
    router: Arc<HostRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: Arc<ProvisioningEngine>,
        router: HostRouter,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            router: Arc::new(router),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            let router = Arc::clone(&self.router);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, engine, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    engine: Arc<ProvisioningEngine>,
    router: Arc<HostRouter>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let engine = Arc::clone(&engine);
        let router = Arc::clone(&router);
        async move { handle_request(req, engine, router).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    engine: Arc<ProvisioningEngine>,
    router: Arc<HostRouter>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let provision = ProvisionRequest::from_parts(req.headers(), req.uri());
    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    // The engine blocks on filesystem work, the creation lock and the
    // deployment wait, so it runs on the blocking pool
    let result = match tokio::task::spawn_blocking(move || engine.handle(&provision)).await {
        Ok(result) => result,
        Err(e) => {
            error!(request_id, error = %e, "Provisioning task failed");
            return Ok(with_request_id(
                json_error_response(GatewayErrorCode::InternalError, "Provisioning failed"),
                &request_id,
            ));
        }
    };

    debug!(request_id, outcome = ?result.outcome, "Provisioning decision");

    let response = match result.disposition {
        Disposition::Redirect(location) => redirect_response(&location),
        Disposition::Reject { code, message } => json_error_response(code, message),
        Disposition::PassThrough => router.serve(&req),
    };

    Ok(with_request_id(response, &request_id))
}

fn with_request_id(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}
