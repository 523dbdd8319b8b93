use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use http::StatusCode;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Url};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use upload_common::retry::parse_retry_after_header;

use crate::error::TransportError;
use crate::scanner::CandidateFile;

const FILE_FIELD: &str = "filedata";
const API_KEY_FIELD: &str = "apikey";
/// How much of a rejection body is kept for logging.
const REJECTION_BODY_LIMIT: usize = 512;

/// What happened to one upload attempt. The reconciler must handle every variant.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The remote answered 2xx for these exact bytes.
    Success,
    /// The remote answered with any other status.
    RemoteRejected {
        status: StatusCode,
        retry_after: Option<time::Duration>,
        message: Option<String>,
    },
    /// No usable answer: connect error, timeout, broken body stream, unreadable file.
    TransportFailure(TransportError),
    /// The file was gone when it was opened.
    FileVanished,
}

impl TransferOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferOutcome::Success => "success",
            TransferOutcome::RemoteRejected { .. } => "remote_rejected",
            TransferOutcome::TransportFailure(_) => "transport_failure",
            TransferOutcome::FileVanished => "file_vanished",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }

    /// Why a failed attempt failed: `rejected`, or the transport cause. None unless it failed.
    pub fn failure_kind(&self) -> Option<&'static str> {
        match self {
            TransferOutcome::RemoteRejected { .. } => Some("rejected"),
            TransferOutcome::TransportFailure(cause) => Some(cause.kind()),
            TransferOutcome::Success | TransferOutcome::FileVanished => None,
        }
    }
}

/// The fixed form fields sent along with every file.
#[derive(Clone)]
pub struct UploadMetadata {
    api_key: String,
}

impl UploadMetadata {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_owned(),
        }
    }

    fn fields(&self) -> [(&'static str, String); 1] {
        [(API_KEY_FIELD, self.api_key.clone())]
    }
}

impl fmt::Debug for UploadMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadMetadata")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// One attempt's request: an open handle on the file plus the metadata fields.
/// Built fresh for every attempt so a retry always reads the file again.
pub struct UploadRequest {
    file_name: String,
    content: File,
    length: u64,
    metadata: UploadMetadata,
}

impl UploadRequest {
    pub async fn open(file: &CandidateFile, metadata: &UploadMetadata) -> io::Result<Self> {
        let content = File::open(&file.path).await?;
        let length = content.metadata().await?.len();

        Ok(Self {
            file_name: file.file_name(),
            content,
            length,
            metadata: metadata.clone(),
        })
    }

    /// Build the multipart body. File bytes are streamed, never buffered whole.
    pub fn into_form(self) -> Form {
        let stream = LengthGuardedStream::new(ReaderStream::new(self.content), self.length);
        let part = Part::stream_with_length(Body::wrap_stream(stream), self.length)
            .file_name(self.file_name);

        self.metadata
            .fields()
            .into_iter()
            .fold(Form::new(), |form, (name, value)| form.text(name, value))
            .part(FILE_FIELD, part)
    }
}

/// Fails the body stream when the file does not hold exactly the bytes announced in the
/// Content-Length, which means a producer is still writing to it. The remote then never sees a
/// complete request for a partial file.
struct LengthGuardedStream<S> {
    inner: S,
    expected: u64,
    sent: u64,
    done: bool,
}

impl<S> LengthGuardedStream<S> {
    fn new(inner: S, expected: u64) -> Self {
        Self {
            inner,
            expected,
            sent: 0,
            done: false,
        }
    }
}

impl<S> Stream for LengthGuardedStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as u64;
                if self.sent > self.expected {
                    self.done = true;
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "file grew while it was being uploaded",
                    ))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.sent < self.expected {
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while it was being uploaded",
                    ))));
                }
                Poll::Ready(None)
            }
        }
    }
}

/// Transfers one candidate file to the remote. Never touches the local file beyond reading it.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &CandidateFile) -> TransferOutcome;
}

/// Uploads files as a multipart POST to a single endpoint.
pub struct UploadClient {
    client: reqwest::Client,
    url: Url,
    metadata: UploadMetadata,
}

impl UploadClient {
    /// Build a client whose requests give up after `request_timeout`, so a hung remote cannot
    /// stall the poll loop. Redirects are not followed: a redirected POST would be re-sent
    /// without its body, and only the endpoint's own answer counts.
    pub fn new(
        url: Url,
        metadata: UploadMetadata,
        request_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("photo-uploader")
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self::from_client(client, url, metadata))
    }

    pub fn from_client(client: reqwest::Client, url: Url, metadata: UploadMetadata) -> Self {
        Self {
            client,
            url,
            metadata,
        }
    }
}

#[async_trait]
impl Uploader for UploadClient {
    async fn upload(&self, file: &CandidateFile) -> TransferOutcome {
        let request = match UploadRequest::open(file, &self.metadata).await {
            Ok(request) => request,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return TransferOutcome::FileVanished
            }
            Err(error) => return TransferOutcome::TransportFailure(TransportError::Read(error)),
        };

        let response = match self
            .client
            .post(self.url.clone())
            .multipart(request.into_form())
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return TransferOutcome::TransportFailure(TransportError::Request(error)),
        };

        let status = response.status();
        if status.is_success() {
            return TransferOutcome::Success;
        }

        let retry_after = parse_retry_after_header(response.headers());
        let message = first_n_bytes_of_response(response, REJECTION_BODY_LIMIT).await;

        TransferOutcome::RemoteRejected {
            status,
            retry_after,
            message,
        }
    }
}

/// Read at most `n` bytes of a response body as lossy UTF-8. None if the body is empty or
/// could not be read; the status code alone still describes the rejection.
async fn first_n_bytes_of_response(mut response: reqwest::Response, n: usize) -> Option<String> {
    let mut body = Vec::with_capacity(n);

    while body.len() < n {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = n - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            }
            Ok(None) | Err(_) => break,
        }
    }

    let text = String::from_utf8_lossy(&body).trim().to_owned();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use futures::StreamExt;
    use httpmock::prelude::*;
    use tempfile::TempDir;
    use upload_common::retry::RetryPolicy;

    use super::*;
    use crate::reconcile::{Reconciler, Reconciliation};

    fn client_for(server: &MockServer, timeout: time::Duration) -> UploadClient {
        UploadClient::new(
            Url::parse(&server.url("/upload")).unwrap(),
            UploadMetadata::new("theapikey"),
            timeout,
        )
        .expect("failed to build upload client")
    }

    fn write_candidate(dir: &TempDir, name: &str, content: &[u8]) -> CandidateFile {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        CandidateFile::new(path).with_size(content.len() as u64)
    }

    #[tokio::test]
    async fn test_success_sends_file_and_api_key() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/upload")
                .header_exists("content-type")
                .body_contains("name=\"apikey\"")
                .body_contains("theapikey")
                .body_contains("name=\"filedata\"; filename=\"a.jpg\"")
                .body_contains("not really a jpeg");
            then.status(200);
        });
        let dir = TempDir::new().unwrap();
        let file = write_candidate(&dir, "a.jpg", b"not really a jpeg");

        let outcome = client_for(&server, time::Duration::from_secs(5))
            .upload(&file)
            .await;

        assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
        mock.assert_hits(1);
        // Uploading never deletes; that is the reconciler's decision.
        assert!(file.path.exists());
    }

    #[tokio::test]
    async fn test_any_2xx_is_success() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/upload");
            then.status(201);
        });
        let dir = TempDir::new().unwrap();
        let file = write_candidate(&dir, "a.jpg", b"jpeg");

        let outcome = client_for(&server, time::Duration::from_secs(5))
            .upload(&file)
            .await;

        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_non_2xx_is_rejected_with_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/upload");
            then.status(503)
                .header("retry-after", "7")
                .body("maintenance in progress");
        });
        let dir = TempDir::new().unwrap();
        let file = write_candidate(&dir, "c.jpg", b"jpeg");

        let outcome = client_for(&server, time::Duration::from_secs(5))
            .upload(&file)
            .await;

        assert_eq!(outcome.failure_kind(), Some("rejected"));
        match outcome {
            TransferOutcome::RemoteRejected {
                status,
                retry_after,
                message,
            } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(retry_after, Some(time::Duration::from_secs(7)));
                assert_eq!(message.as_deref(), Some("maintenance in progress"));
            }
            other => panic!("expected a rejection, got {:?}", other),
        }
        assert!(file.path.exists());
    }

    #[tokio::test]
    async fn test_redirect_is_rejected_not_followed() {
        let server = MockServer::start();
        let upload = server.mock(|when, then| {
            when.method(POST).path("/upload");
            then.status(302).header("location", "/landing");
        });
        let landing = server.mock(|when, then| {
            when.path("/landing");
            then.status(200);
        });
        let dir = TempDir::new().unwrap();
        let file = write_candidate(&dir, "r.jpg", b"jpeg");

        let outcome = client_for(&server, time::Duration::from_secs(5))
            .upload(&file)
            .await;

        match &outcome {
            TransferOutcome::RemoteRejected { status, .. } => {
                assert_eq!(*status, StatusCode::FOUND)
            }
            other => panic!("expected a rejection, got {:?}", other),
        }
        upload.assert_hits(1);
        landing.assert_hits(0);

        let reconciliation = Reconciler::new(RetryPolicy::default(), None)
            .reconcile(&file, &outcome)
            .await;
        assert!(matches!(reconciliation, Reconciliation::Retained { .. }));
        assert!(file.path.exists());
    }

    #[tokio::test]
    async fn test_timeout_is_transport_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/upload");
            then.status(200).delay(time::Duration::from_secs(2));
        });
        let dir = TempDir::new().unwrap();
        let file = write_candidate(&dir, "d.jpg", b"jpeg");

        let outcome = client_for(&server, time::Duration::from_millis(200))
            .upload(&file)
            .await;

        assert_eq!(outcome.failure_kind(), Some("timeout"));
        match outcome {
            TransferOutcome::TransportFailure(error) => assert!(error.is_timeout()),
            other => panic!("expected a transport failure, got {:?}", other),
        }
        assert!(file.path.exists());
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_transport_failure() {
        // Nothing listens on the discard port.
        let client = UploadClient::new(
            Url::parse("http://127.0.0.1:9/upload").unwrap(),
            UploadMetadata::new("theapikey"),
            time::Duration::from_secs(2),
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        let file = write_candidate(&dir, "e.jpg", b"jpeg");

        let outcome = client.upload(&file).await;

        assert!(matches!(outcome, TransferOutcome::TransportFailure(_)));
        assert_eq!(outcome.failure_kind(), Some("connect"));
    }

    #[tokio::test]
    async fn test_missing_file_is_vanished_without_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/upload");
            then.status(200);
        });
        let dir = TempDir::new().unwrap();
        let file = CandidateFile::new(dir.path().join("gone.jpg"));

        let outcome = client_for(&server, time::Duration::from_secs(5))
            .upload(&file)
            .await;

        assert!(matches!(outcome, TransferOutcome::FileVanished));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_length_guard_rejects_growth_and_shrinkage() {
        let chunks = || {
            futures::stream::iter(vec![
                Ok::<_, io::Error>(Bytes::from_static(b"abc")),
                Ok(Bytes::from_static(b"def")),
            ])
        };

        let exact: Vec<_> = LengthGuardedStream::new(chunks(), 6).collect().await;
        assert!(exact.iter().all(|chunk| chunk.is_ok()));

        let grown: Vec<_> = LengthGuardedStream::new(chunks(), 4).collect().await;
        assert_eq!(grown.len(), 2);
        assert_eq!(
            grown[1].as_ref().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );

        let shrunk: Vec<_> = LengthGuardedStream::new(chunks(), 10).collect().await;
        assert_eq!(shrunk.len(), 3);
        assert_eq!(
            shrunk[2].as_ref().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_metadata_debug_hides_api_key() {
        let metadata = UploadMetadata::new("theapikey");
        assert!(!format!("{:?}", metadata).contains("theapikey"));
    }
}
