use std::time::Duration;

use lista_contracts::{BatchItem, ErrorResponse, ListResponse, UpdateItemRequest, UploadResponse};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

pub mod camera;
pub mod tracker;

pub use camera::{CameraSession, CaptureDevice};
pub use tracker::UploadTracker;

#[derive(Debug)]
pub enum ClientError {
    Timeout,
    Http(reqwest::Error),
    Api {
        status: StatusCode,
        code: String,
        message: String,
        retryable: bool,
    },
    BadStatus(StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "list request timed out"),
            ClientError::Http(err) => write!(f, "list HTTP error: {}", err),
            ClientError::Api { code, message, .. } => write!(f, "{}: {}", code, message),
            ClientError::BadStatus(status) => {
                write!(f, "list service returned status {}", status)
            }
            ClientError::InvalidResponse => {
                write!(f, "list service returned invalid JSON response")
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Http(value)
        }
    }
}

impl ClientError {
    /// Whether a manual "try again" is worth offering to the user.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout => true,
            ClientError::Http(err) => err.is_connect() || err.is_request(),
            ClientError::Api { retryable, .. } => *retryable,
            ClientError::BadStatus(status) => status.is_server_error(),
            ClientError::InvalidResponse => false,
        }
    }

    /// Whether the local batch view has drifted from the server and the
    /// list should be refetched before the next attempt.
    pub fn is_stale_batch(&self) -> bool {
        matches!(
            self,
            ClientError::Api { code, .. }
                if code == "ERR_ITEM_NOT_IN_BATCH" || code == "ERR_ACTION_NOT_ALLOWED"
        )
    }
}

#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub item_id: i64,
    pub document_type: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub notes: Option<String>,
}

// Thin typed wrapper over the recipient link endpoints. Every call is made
// exactly once; the caller decides whether and when to retry.
#[derive(Debug, Clone)]
pub struct ListClient {
    base_url: String,
    http: reqwest::Client,
}

impl ListClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self { base_url, http })
    }

    pub async fn fetch_list(&self, hash: &str) -> Result<ListResponse, ClientError> {
        let resp = self.http.get(self.list_url(hash)).send().await?;
        decode(resp).await
    }

    pub async fn update_item(
        &self,
        hash: &str,
        update: &UpdateItemRequest,
    ) -> Result<BatchItem, ClientError> {
        let resp = self
            .http
            .patch(self.list_url(hash))
            .json(update)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn upload_document(
        &self,
        hash: &str,
        upload: DocumentUpload,
    ) -> Result<UploadResponse, ClientError> {
        let file = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.content_type)?;
        let mut form = reqwest::multipart::Form::new()
            .text("itemId", upload.item_id.to_string())
            .text("documentType", upload.document_type)
            .part("file", file);
        if let Some(notes) = upload.notes {
            form = form.text("notes", notes);
        }

        let resp = self
            .http
            .post(self.upload_url(hash))
            .multipart(form)
            .send()
            .await?;
        decode(resp).await
    }

    fn list_url(&self, hash: &str) -> String {
        format!("{}/api/lists/{}", self.base_url.trim_end_matches('/'), hash)
    }

    fn upload_url(&self, hash: &str) -> String {
        format!(
            "{}/api/lists/{}/upload",
            self.base_url.trim_end_matches('/'),
            hash
        )
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|_| ClientError::InvalidResponse);
    }

    match resp.json::<ErrorResponse>().await {
        Ok(body) => Err(ClientError::Api {
            status,
            code: body.error,
            message: body.message,
            retryable: body.retryable,
        }),
        Err(_) => Err(ClientError::BadStatus(status)),
    }
}
