//! TCP front end: one task per connection, requests answered in order
//!
//! Shutdown stops accepting and stops reading new requests. A request already
//! read is still dispatched and answered before its connection closes.

use remote_analyze_storage::JobId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::protocol::{read_frame, write_frame, Request, Response};
use crate::service::AnalyzeService;

pub struct Server {
    service: Arc<AnalyzeService>,
    max_frame_bytes: usize,
}

impl Server {
    pub fn new(service: Arc<AnalyzeService>, max_frame_bytes: usize) -> Self {
        Self {
            service,
            max_frame_bytes,
        }
    }

    /// Accept connections until `shutdown` fires, then wait for every open
    /// connection to finish the request in hand
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    connections.spawn(handle_connection(
                        self.service.clone(),
                        stream,
                        peer,
                        self.max_frame_bytes,
                        shutdown.clone(),
                    ));
                }
            }

            while let Some(finished) = connections.try_join_next() {
                if let Err(e) = finished {
                    error!("Connection task panicked: {}", e);
                }
            }
        }

        info!(
            "Server shutting down, waiting for {} open connections",
            connections.len()
        );
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!("Connection task panicked: {}", e);
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    service: Arc<AnalyzeService>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
) {
    debug!("Connection from {}", peer);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        // Only waiting for the next request is interruptible
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = read_frame(&mut reader, max_frame_bytes) => read,
        };
        let request: Request = match read {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!("Bad request from {}: {}", peer, e);
                let response = Response::from_error(&e);
                let _ = write_frame(&mut writer, &response, max_frame_bytes).await;
                break;
            }
        };

        let response = dispatch(&service, request).await;
        if let Err(e) = write_frame(&mut writer, &response, max_frame_bytes).await {
            warn!("Failed to answer {}: {}", peer, e);
            break;
        }
    }

    debug!("Connection from {} closed", peer);
}

/// Ids that do not parse can never have been issued
fn job_id(raw: &str) -> Result<JobId> {
    JobId::parse(raw).ok_or_else(|| OrchestratorError::JobNotFound(raw.to_string()))
}

/// Run one request against the service
pub async fn dispatch(service: &AnalyzeService, request: Request) -> Response {
    let operation = request.name();

    let result = match request {
        Request::GetId => service.get_id().await.map(|id| Response::JobId {
            job_id: id.to_string(),
        }),
        Request::CheckUploadedFiles { digests } => service
            .check_uploaded_files(&digests)
            .await
            .map(|missing| Response::MissingFiles {
                digests: missing.into_iter().collect(),
            }),
        Request::Analyze { job_id: raw, bundle } => match job_id(&raw) {
            Ok(id) => service
                .submit(&id, bundle)
                .await
                .map(|part| Response::PartStored { part }),
            Err(e) => Err(e),
        },
        Request::Seal { job_id: raw } => match job_id(&raw) {
            Ok(id) => service.seal(&id).await.map(|parts| Response::Sealed { parts }),
            Err(e) => Err(e),
        },
        Request::GetStatus { job_id: raw } => match job_id(&raw) {
            Ok(id) => service
                .get_status(&id)
                .await
                .map(|state| Response::Status { state }),
            Err(e) => Err(e),
        },
        Request::GetResults { job_id: raw } => match job_id(&raw) {
            Ok(id) => service
                .get_results(&id)
                .await
                .map(|archive| Response::Results { archive }),
            Err(e) => Err(e),
        },
    };

    result.unwrap_or_else(|e| {
        match &e {
            OrchestratorError::JobNotFound(_)
            | OrchestratorError::NotCompleted { .. }
            | OrchestratorError::Sealed(_)
            | OrchestratorError::NothingToSeal(_) => debug!("{} rejected: {}", operation, e),
            _ => error!("{} failed: {}", operation, e),
        }
        Response::from_error(&e)
    })
}
