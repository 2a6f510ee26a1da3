//! HTTP transport for the bot API

use super::{
    FileUpload, RawPayload, Transport, TransportError, TransportErrorKind, UpdateParams,
    UploadParams, UploadSource, METHOD_GET_UPDATES,
};
use crate::types::Update;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_API_HOST: &str = "api.telegram.org";

/// Deadline for ordinary calls; long polls get this on top of their own timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for multipart uploads, which scale with payload size
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Bot API over HTTPS
pub struct HttpTransport {
    client: Client,
    base_url: String,
    file_base_url: String,
}

impl HttpTransport {
    pub fn new(token: &str, host: Option<&str>) -> Result<Self, TransportError> {
        let host = host.unwrap_or(DEFAULT_API_HOST).trim_end_matches('/');
        let (scheme, host) = match host.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("https", host),
        };

        let client = Client::builder()
            .timeout(DEFAULT_OPERATION_TIMEOUT)
            .build()
            .map_err(|e| TransportError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{scheme}://{host}/bot{token}"),
            file_base_url: format!("{scheme}://{host}/file/bot{token}"),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    fn upload_request(&self, params: &UploadParams, form: Form) -> RequestBuilder {
        self.client
            .post(self.method_url(params.kind.method()))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
    }

    async fn send(&self, request: RequestBuilder) -> Result<RawPayload, TransportError> {
        let response = request.send().await.map_err(classify_request_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::network(format!("Failed to read response: {e}")))?;

        decode_envelope(status.as_u16(), &body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, method: &str, params: Value) -> Result<RawPayload, TransportError> {
        let request = self.client.post(self.method_url(method)).json(&params);
        self.send(request).await
    }

    async fn fetch_updates(&self, params: &UpdateParams) -> Result<Vec<Update>, TransportError> {
        // The server holds the request open for up to `timeout` seconds
        let request = self
            .client
            .post(self.method_url(METHOD_GET_UPDATES))
            .timeout(params.timeout_duration() + DEFAULT_OPERATION_TIMEOUT)
            .json(params);
        let payload = self.send(request).await?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn upload(
        &self,
        params: &UploadParams,
        file: FileUpload,
    ) -> Result<RawPayload, TransportError> {
        let part = match file.source {
            UploadSource::Bytes(bytes) => Part::bytes(bytes),
            UploadSource::Path(path) => {
                let handle = tokio::fs::File::open(&path).await.map_err(|e| {
                    TransportError::invalid_request(format!(
                        "Failed to open {}: {e}",
                        path.display()
                    ))
                })?;
                Part::stream(reqwest::Body::from(handle))
            }
        }
        .file_name(file.file_name);

        let mut form = Form::new();
        for (key, value) in params.form_fields() {
            form = form.text(key, value);
        }
        form = form.part(params.kind.field(), part);

        self.send(self.upload_request(params, form)).await
    }

    fn file_url(&self, file_path: &str) -> Option<String> {
        Some(format!(
            "{}/{}",
            self.file_base_url,
            file_path.trim_start_matches('/')
        ))
    }
}

fn classify_request_error(e: reqwest::Error) -> TransportError {
    // Strip the URL: it embeds the bot token
    let e = e.without_url();
    if e.is_timeout() {
        TransportError::timeout(format!("Request timeout: {e}"))
    } else if e.is_connect() || e.is_request() {
        TransportError::network(format!("Connection failed: {e}"))
    } else {
        TransportError::unknown(format!("Request failed: {e}"))
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Unwrap the `{ok, result, ...}` envelope every bot API response uses
fn decode_envelope(status: u16, body: &str) -> Result<RawPayload, TransportError> {
    let envelope: ApiEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            if (200..300).contains(&status) {
                return Err(TransportError::decode(format!(
                    "Malformed response envelope: {e}"
                )));
            }
            return Err(TransportError::new(
                TransportErrorKind::from_status(status),
                format!("HTTP {status}: {body}"),
            ));
        }
    };

    if envelope.ok {
        return Ok(envelope.result.unwrap_or(Value::Null));
    }

    let code = envelope
        .error_code
        .or_else(|| (!(200..300).contains(&status)).then_some(i64::from(status)));
    let kind = match code
        .and_then(|c| u16::try_from(c).ok())
        .map(TransportErrorKind::from_status)
    {
        Some(TransportErrorKind::Unknown) | None => TransportErrorKind::Rejected,
        Some(kind) => kind,
    };

    let mut err = TransportError::new(
        kind,
        envelope
            .description
            .unwrap_or_else(|| "request rejected without description".to_string()),
    );
    if let Some(code) = code {
        err = err.with_error_code(code);
    }
    if let Some(secs) = envelope.parameters.and_then(|p| p.retry_after) {
        err = err.with_retry_after(Duration::from_secs(secs));
    }
    Err(err)
}
