//! Connection to a remote analyze server

use remote_analyze_orchestration::protocol::{read_frame, write_frame};
use remote_analyze_orchestration::{JobState, Request, Response};
use remote_analyze_storage::{Digest, JobId};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One request/response connection; calls are strictly sequential
pub struct RemoteAnalyzeClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    max_frame_bytes: usize,
}

impl RemoteAnalyzeClient {
    pub async fn connect(addr: &str, max_frame_bytes: usize) -> ClientResult<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ClientError::connection(format!("cannot connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            max_frame_bytes,
        })
    }

    async fn call(&mut self, request: Request) -> ClientResult<Response> {
        let name = request.name();
        write_frame(&mut self.writer, &request, self.max_frame_bytes).await?;

        match read_frame(&mut self.reader, self.max_frame_bytes).await? {
            Some(Response::Error { kind, message }) => Err(ClientError::from_wire(kind, message)),
            Some(response) => Ok(response),
            None => Err(ClientError::connection(format!(
                "server closed the connection during {}",
                name
            ))),
        }
    }

    /// Allocate a new job
    pub async fn get_id(&mut self) -> ClientResult<JobId> {
        match self.call(Request::GetId).await? {
            Response::JobId { job_id } => JobId::parse(&job_id)
                .ok_or_else(|| ClientError::protocol(format!("malformed job id {:?}", job_id))),
            other => Err(unexpected("getId", &other)),
        }
    }

    /// The subset of `digests` the server does not have
    pub async fn check_uploaded_files(&mut self, digests: &[Digest]) -> ClientResult<BTreeSet<Digest>> {
        let request = Request::CheckUploadedFiles {
            digests: digests.to_vec(),
        };
        match self.call(request).await? {
            Response::MissingFiles { digests } => Ok(digests.into_iter().collect()),
            other => Err(unexpected("checkUploadedFiles", &other)),
        }
    }

    /// Submit one bundle; returns the part number it was stored as
    pub async fn analyze(&mut self, job_id: &JobId, bundle: Vec<u8>) -> ClientResult<u64> {
        let request = Request::Analyze {
            job_id: job_id.to_string(),
            bundle,
        };
        match self.call(request).await? {
            Response::PartStored { part } => Ok(part),
            other => Err(unexpected("analyze", &other)),
        }
    }

    /// Declare that no more parts follow; returns the job's part count
    pub async fn seal(&mut self, job_id: &JobId) -> ClientResult<u64> {
        let request = Request::Seal {
            job_id: job_id.to_string(),
        };
        match self.call(request).await? {
            Response::Sealed { parts } => Ok(parts),
            other => Err(unexpected("seal", &other)),
        }
    }

    pub async fn get_status(&mut self, job_id: &JobId) -> ClientResult<JobState> {
        let request = Request::GetStatus {
            job_id: job_id.to_string(),
        };
        match self.call(request).await? {
            Response::Status { state } => Ok(state),
            other => Err(unexpected("getStatus", &other)),
        }
    }

    /// The aggregated result archive of a completed job
    pub async fn get_results(&mut self, job_id: &JobId) -> ClientResult<Vec<u8>> {
        let request = Request::GetResults {
            job_id: job_id.to_string(),
        };
        match self.call(request).await? {
            Response::Results { archive } => Ok(archive),
            other => Err(unexpected("getResults", &other)),
        }
    }
}

fn unexpected(operation: &str, response: &Response) -> ClientError {
    let variant = match response {
        Response::JobId { .. } => "JobId",
        Response::MissingFiles { .. } => "MissingFiles",
        Response::PartStored { .. } => "PartStored",
        Response::Sealed { .. } => "Sealed",
        Response::Status { .. } => "Status",
        Response::Results { .. } => "Results",
        Response::Error { .. } => "Error",
    };
    ClientError::protocol(format!("unexpected {} response to {}", variant, operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_names_both_sides() {
        let err = unexpected("getStatus", &Response::PartStored { part: 3 });
        assert_eq!(
            err.to_string(),
            "Protocol error: unexpected PartStored response to getStatus"
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with no listener
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = RemoteAnalyzeClient::connect(&addr, 1024).await;
        assert!(matches!(result, Err(ClientError::ConnectionError(_))));
    }
}
