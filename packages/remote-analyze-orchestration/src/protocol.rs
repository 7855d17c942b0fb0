//! RPC messages and framing
//!
//! # Framing Protocol
//!
//! Each message is written as:
//! ```text
//! [u32_le length: 4 bytes][msgpack body: length bytes]
//! ```
//!
//! Bodies are `rmp_serde::to_vec_named` encodings of [`Request`] and
//! [`Response`]. One request is answered by exactly one response; a
//! connection may carry any number of exchanges.

use byteorder::{ByteOrder, LittleEndian};
use remote_analyze_storage::Digest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{OrchestratorError, Result};
use crate::job::JobState;

/// Largest accepted frame body
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    GetId,
    CheckUploadedFiles {
        digests: Vec<Digest>,
    },
    Analyze {
        job_id: String,
        #[serde(with = "serde_bytes")]
        bundle: Vec<u8>,
    },
    /// No more parts follow for this job
    Seal {
        job_id: String,
    },
    GetStatus {
        job_id: String,
    },
    GetResults {
        job_id: String,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetId => "getId",
            Request::CheckUploadedFiles { .. } => "checkUploadedFiles",
            Request::Analyze { .. } => "analyze",
            Request::Seal { .. } => "seal",
            Request::GetStatus { .. } => "getStatus",
            Request::GetResults { .. } => "getResults",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    JobId {
        job_id: String,
    },
    MissingFiles {
        digests: Vec<Digest>,
    },
    PartStored {
        part: u64,
    },
    Sealed {
        parts: u64,
    },
    Status {
        state: JobState,
    },
    Results {
        #[serde(with = "serde_bytes")]
        archive: Vec<u8>,
    },
    Error {
        kind: WireErrorKind,
        message: String,
    },
}

/// Failure signal carried in an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    NotFound,
    NotCompleted,
    Storage,
    InvalidRequest,
    Internal,
}

impl WireErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireErrorKind::NotFound => "not_found",
            WireErrorKind::NotCompleted => "not_completed",
            WireErrorKind::Storage => "storage",
            WireErrorKind::InvalidRequest => "invalid_request",
            WireErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&OrchestratorError> for WireErrorKind {
    fn from(error: &OrchestratorError) -> Self {
        match error {
            OrchestratorError::JobNotFound(_) => WireErrorKind::NotFound,
            OrchestratorError::NotCompleted { .. } => WireErrorKind::NotCompleted,
            OrchestratorError::StorageFailure(_) | OrchestratorError::Io(_) => {
                WireErrorKind::Storage
            }
            OrchestratorError::InvalidBundle(_)
            | OrchestratorError::Sealed(_)
            | OrchestratorError::NothingToSeal(_)
            | OrchestratorError::Protocol(_)
            | OrchestratorError::Archive(_) => WireErrorKind::InvalidRequest,
            _ => WireErrorKind::Internal,
        }
    }
}

impl Response {
    pub fn from_error(error: &OrchestratorError) -> Self {
        Response::Error {
            kind: error.into(),
            message: error.to_string(),
        }
    }
}

/// Encode `message` and write it as one frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = rmp_serde::to_vec_named(message).map_err(OrchestratorError::serialization)?;
    if body.len() > max_frame_bytes {
        return Err(OrchestratorError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            body.len(),
            max_frame_bytes
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| OrchestratorError::Protocol("frame length overflows u32".to_string()))?;

    let mut header = [0u8; 4];
    LittleEndian::write_u32(&mut header, len);

    writer.write_all(&header).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one frame
///
/// Returns `None` when the peer closed the stream before a new frame began.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = LittleEndian::read_u32(&header) as usize;
    if len > max_frame_bytes {
        return Err(OrchestratorError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            len, max_frame_bytes
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let message = rmp_serde::from_slice(&body).map_err(OrchestratorError::serialization)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Request::GetId, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();

        let len = LittleEndian::read_u32(&buffer[..4]) as usize;
        assert_eq!(len, buffer.len() - 4);
        assert_eq!(&buffer[..4], &(len as u32).to_le_bytes());

        let body: Request = rmp_serde::from_slice(&buffer[4..]).unwrap();
        assert_eq!(body, Request::GetId);
    }

    #[tokio::test]
    async fn test_several_frames_on_one_stream() {
        let mut buffer = Vec::new();
        let first = Request::Analyze {
            job_id: "abc".to_string(),
            bundle: vec![1, 2, 3],
        };
        let second = Request::GetStatus {
            job_id: "abc".to_string(),
        };
        write_frame(&mut buffer, &first, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        write_frame(&mut buffer, &second, DEFAULT_MAX_FRAME_BYTES).await.unwrap();

        let mut reader = Cursor::new(buffer);
        let a: Request = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        let b: Request = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        let end: Option<Request> = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap();

        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&1024u32.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 16]);

        let result: Result<Option<Request>> = read_frame(&mut Cursor::new(buffer), 64).await;
        assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&32u32.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 8]);

        let result: Result<Option<Request>> =
            read_frame(&mut Cursor::new(buffer), DEFAULT_MAX_FRAME_BYTES).await;
        assert!(matches!(result, Err(OrchestratorError::Io(_))));
    }

    #[test]
    fn test_error_kind_mapping() {
        let cases = [
            (OrchestratorError::JobNotFound("x".into()), WireErrorKind::NotFound),
            (
                OrchestratorError::NotCompleted {
                    job_id: "x".into(),
                    state: "QUEUED".into(),
                },
                WireErrorKind::NotCompleted,
            ),
            (OrchestratorError::StorageFailure("disk".into()), WireErrorKind::Storage),
            (OrchestratorError::InvalidBundle("zip".into()), WireErrorKind::InvalidRequest),
            (OrchestratorError::Sealed("x".into()), WireErrorKind::InvalidRequest),
            (OrchestratorError::NothingToSeal("x".into()), WireErrorKind::InvalidRequest),
            (OrchestratorError::Parse("x".into()), WireErrorKind::Internal),
        ];
        for (error, kind) in cases {
            assert_eq!(WireErrorKind::from(&error), kind);
        }
    }

    #[test]
    fn test_error_kind_wire_names() {
        let encoded = serde_json::to_string(&WireErrorKind::NotCompleted).unwrap();
        assert_eq!(encoded, "\"not_completed\"");
    }
}
