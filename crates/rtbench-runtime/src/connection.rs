//! gRPC channel to the supervisor's Unix control socket.

use std::path::Path;

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use rtbench_common::error::{BenchError, Result};

/// Opens a channel over the Unix socket at `socket_path`.
///
/// The endpoint URI is a placeholder; every connection dials the socket.
///
/// # Errors
///
/// Returns [`BenchError::Transport`] if the socket cannot be reached.
pub async fn connect_unix(socket_path: &Path) -> Result<Channel> {
    let path = socket_path.to_path_buf();
    let transport_error = |message: String| BenchError::Transport {
        address: socket_path.to_path_buf(),
        message,
    };

    let channel = Endpoint::try_from("http://[::]:50051")
        .map_err(|e| transport_error(e.to_string()))?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| transport_error(format!("{e}: {}", source_chain(&e))))?;

    tracing::debug!(socket = %socket_path.display(), "connected to supervisor");
    Ok(channel)
}

/// Joins the source chain of a transport error, which hides the OS error.
fn source_chain(err: &dyn std::error::Error) -> String {
    let mut parts = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
