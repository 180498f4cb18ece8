//! HTTP callback server of the startup driver.
//!
//! A freshly started container signals life with `GET /started`; the
//! handler records the time elapsed since the driver's start mark. Every
//! connection is closed after one response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use rtbench_common::constants::CALLBACK_ROUTE;
use rtbench_common::error::{BenchError, Result};

use crate::startup::MeasurementState;

/// A running callback server.
#[derive(Debug)]
pub struct CallbackServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
}

impl CallbackServer {
    /// Binds `addr` and starts serving in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, state: Arc<MeasurementState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BenchError::Syscall {
                call: "bind callback server",
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BenchError::Syscall {
                call: "getsockname",
                source,
            })?;

        let (shutdown, stop) = oneshot::channel();
        let accept_loop = tokio::spawn(serve(listener, state, stop));
        tracing::info!(%local_addr, route = CALLBACK_ROUTE, "callback server listening");

        Ok(Self {
            local_addr,
            shutdown,
            accept_loop,
        })
    }

    /// Address the server is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for open ones to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop panicked.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.accept_loop
            .await
            .map_err(|e| BenchError::Syscall {
                call: "callback server",
                source: std::io::Error::other(e.to_string()),
            })
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<MeasurementState>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept callback connection");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                let _ = connections.spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    if let Err(e) = http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::warn!(%peer, error = %e, "error serving callback connection");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    tracing::debug!("callback server stopped");
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<MeasurementState>,
) -> std::result::Result<Response<Empty<Bytes>>, Infallible> {
    let status = match (req.method(), req.uri().path()) {
        (&Method::GET, CALLBACK_ROUTE) => {
            match state.record() {
                Some(elapsed) => {
                    tracing::info!(elapsed_ms = elapsed.as_millis(), "container started");
                }
                None => tracing::warn!("callback received before any container was started"),
            }
            StatusCode::OK
        }
        (method, path) => {
            tracing::info!(%method, path, "request to unknown endpoint");
            StatusCode::NOT_FOUND
        }
    };

    let mut response = Response::new(Empty::new());
    *response.status_mut() = status;
    Ok(response)
}
