//! Bot API transport abstraction
//!
//! The polling loop and conversation engine only ever talk to a [`Transport`].
//! [`HttpTransport`] is the production implementation; [`Bot`] layers typed
//! helpers for the common outbound calls on top of any transport.

mod error;
mod http;
mod params;

pub use error::{TransportError, TransportErrorKind};
pub use http::{HttpTransport, DEFAULT_API_HOST, DEFAULT_OPERATION_TIMEOUT, UPLOAD_TIMEOUT};
pub use params::*;

use crate::types::{File, Message, Update, User};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Decoded `result` field of a successful API call
pub type RawPayload = Value;

pub const METHOD_GET_ME: &str = "getMe";
pub const METHOD_GET_UPDATES: &str = "getUpdates";
pub const METHOD_SEND_MESSAGE: &str = "sendMessage";
pub const METHOD_EDIT_MESSAGE_TEXT: &str = "editMessageText";
pub const METHOD_DELETE_MESSAGE: &str = "deleteMessage";
pub const METHOD_GET_FILE: &str = "getFile";

/// Request/response access to the remote bot API
#[async_trait]
pub trait Transport: Send + Sync {
    /// Call `method` with JSON parameters and return the decoded result
    async fn invoke(&self, method: &str, params: Value) -> Result<RawPayload, TransportError>;

    /// Long-poll for updates. May block up to `params.timeout` seconds.
    async fn fetch_updates(&self, params: &UpdateParams) -> Result<Vec<Update>, TransportError> {
        let payload = self
            .invoke(METHOD_GET_UPDATES, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Multipart upload through one of the `send*` methods
    async fn upload(
        &self,
        params: &UploadParams,
        _file: FileUpload,
    ) -> Result<RawPayload, TransportError> {
        Err(TransportError::invalid_request(format!(
            "{} uploads are not supported by this transport",
            params.kind.method()
        )))
    }

    /// Download URL for a `file_path` returned by `getFile`
    fn file_url(&self, _file_path: &str) -> Option<String> {
        None
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn invoke(&self, method: &str, params: Value) -> Result<RawPayload, TransportError> {
        (**self).invoke(method, params).await
    }

    async fn fetch_updates(&self, params: &UpdateParams) -> Result<Vec<Update>, TransportError> {
        (**self).fetch_updates(params).await
    }

    async fn upload(
        &self,
        params: &UploadParams,
        file: FileUpload,
    ) -> Result<RawPayload, TransportError> {
        (**self).upload(params, file).await
    }

    fn file_url(&self, file_path: &str) -> Option<String> {
        (**self).file_url(file_path)
    }
}

/// Logging wrapper for transports
pub struct LoggingTransport {
    inner: Arc<dyn Transport>,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self { inner }
    }

    fn log_outcome<R>(method: &str, started: Instant, result: &Result<R, TransportError>) {
        let duration = started.elapsed();
        match result {
            Ok(_) => {
                tracing::debug!(
                    method,
                    duration_ms = %duration.as_millis(),
                    "Bot API request completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    method,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    error_code = ?e.error_code,
                    retryable = e.is_retryable(),
                    "Bot API request failed"
                );
            }
        }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn invoke(&self, method: &str, params: Value) -> Result<RawPayload, TransportError> {
        let started = Instant::now();
        let result = self.inner.invoke(method, params).await;
        Self::log_outcome(method, started, &result);
        result
    }

    async fn fetch_updates(&self, params: &UpdateParams) -> Result<Vec<Update>, TransportError> {
        let started = Instant::now();
        let result = self.inner.fetch_updates(params).await;
        if let Ok(updates) = &result {
            tracing::trace!(offset = params.offset, count = updates.len(), "Fetched updates");
        }
        Self::log_outcome(METHOD_GET_UPDATES, started, &result);
        result
    }

    async fn upload(
        &self,
        params: &UploadParams,
        file: FileUpload,
    ) -> Result<RawPayload, TransportError> {
        let started = Instant::now();
        let result = self.inner.upload(params, file).await;
        Self::log_outcome(params.kind.method(), started, &result);
        result
    }

    fn file_url(&self, file_path: &str) -> Option<String> {
        self.inner.file_url(file_path)
    }
}

/// Typed helpers over a [`Transport`]
pub struct Bot<T: Transport> {
    transport: Arc<T>,
    me: Option<User>,
}

impl<T: Transport> Clone for Bot<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            me: self.me.clone(),
        }
    }
}

impl<T: Transport> Bot<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            me: None,
        }
    }

    /// Verify the credentials with `getMe` and remember the bot's own user
    pub async fn connect(transport: Arc<T>) -> Result<Self, TransportError> {
        let mut bot = Self::new(transport);
        let me = bot.get_me().await?;
        tracing::info!(bot_id = me.id, username = ?me.username, "Connected to bot API");
        bot.me = Some(me);
        Ok(bot)
    }

    /// The bot's own user, known after [`Bot::connect`]
    pub fn me(&self) -> Option<&User> {
        self.me.as_ref()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, TransportError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let payload = self
            .transport
            .invoke(method, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call(METHOD_GET_ME, &serde_json::json!({})).await
    }

    pub async fn send_message(&self, params: &TextMessageParams) -> Result<Message, TransportError> {
        self.call(METHOD_SEND_MESSAGE, params).await
    }

    /// Shorthand for a plain text reply into `chat_id`
    pub async fn send_text(
        &self,
        chat_id: i64,
        text: impl Into<String> + Send,
    ) -> Result<Message, TransportError> {
        self.send_message(&TextMessageParams::new(chat_id, text)).await
    }

    /// Edits a message; the remote answers with the edited message, or `true`
    /// for inline messages, in which case `None` is returned.
    pub async fn edit_message_text(
        &self,
        params: &EditMessageTextParams,
    ) -> Result<Option<Message>, TransportError> {
        let payload = self
            .transport
            .invoke(METHOD_EDIT_MESSAGE_TEXT, serde_json::to_value(params)?)
            .await?;
        if payload.is_boolean() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(payload)?))
    }

    pub async fn delete_message(&self, params: &DeleteMessageParams) -> Result<bool, TransportError> {
        self.call(METHOD_DELETE_MESSAGE, params).await
    }

    pub async fn get_file(&self, file_id: impl Into<String> + Send) -> Result<File, TransportError> {
        self.call(
            METHOD_GET_FILE,
            &GetFileParams {
                file_id: file_id.into(),
            },
        )
        .await
    }

    pub async fn upload_file(
        &self,
        params: &UploadParams,
        file: FileUpload,
    ) -> Result<Message, TransportError> {
        let payload = self.transport.upload(params, file).await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub fn file_url(&self, file: &File) -> Option<String> {
        file.file_path
            .as_deref()
            .and_then(|path| self.transport.file_url(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message_json, MockTransport};
    use serde_json::json;

    /// Implements only `invoke`, so the provided methods run
    struct InvokeOnly(Arc<MockTransport>);

    #[async_trait]
    impl Transport for InvokeOnly {
        async fn invoke(&self, method: &str, params: Value) -> Result<RawPayload, TransportError> {
            self.0.invoke(method, params).await
        }
    }

    #[tokio::test]
    async fn test_default_fetch_updates_goes_through_invoke() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Ok(json!([
            {"update_id": 5, "message": message_json(1, 7, 42, "hi")},
            {"update_id": 6}
        ])));

        let updates = InvokeOnly(Arc::clone(&mock))
            .fetch_updates(&UpdateParams {
                offset: 5,
                ..UpdateParams::default()
            })
            .await
            .unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].text(), Some("hi"));

        let calls = mock.recorded_invocations();
        assert_eq!(calls[0].0, METHOD_GET_UPDATES);
        assert_eq!(calls[0].1["offset"], 5);
    }

    #[tokio::test]
    async fn test_connect_caches_me() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Ok(json!({"id": 99, "is_bot": true, "first_name": "Q", "username": "q_bot"})));

        let bot = Bot::connect(mock).await.unwrap();
        assert_eq!(bot.me().map(|u| u.id), Some(99));
    }

    #[tokio::test]
    async fn test_connect_fails_on_auth_error() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Err(TransportError::auth("Unauthorized")));

        let err = Bot::connect(mock).await.err().unwrap();
        assert_eq!(err.kind, TransportErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_send_text_serializes_params() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Ok(message_json(10, 7, 99, "pong")));

        let bot = Bot::new(Arc::clone(&mock));
        let msg = bot.send_text(7, "pong").await.unwrap();
        assert_eq!(msg.id, 10);

        let calls = mock.recorded_invocations();
        assert_eq!(calls[0].0, METHOD_SEND_MESSAGE);
        assert_eq!(calls[0].1, json!({"chat_id": 7, "text": "pong"}));
    }

    #[tokio::test]
    async fn test_edit_message_text_accepts_boolean_result() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Ok(json!(true)));
        mock.queue_invoke(Ok(message_json(3, 7, 99, "edited")));

        let bot = Bot::new(Arc::clone(&mock));
        let params = EditMessageTextParams::new(7, 3, "edited");
        assert!(bot.edit_message_text(&params).await.unwrap().is_none());
        let edited = bot.edit_message_text(&params).await.unwrap().unwrap();
        assert_eq!(edited.text.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn test_decode_mismatch_is_decode_error() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Ok(json!({"unexpected": true})));

        let bot = Bot::new(mock);
        let err = bot.get_file("abc").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_upload_unsupported_by_default() {
        let bot = Bot::new(Arc::new(InvokeOnly(Arc::new(MockTransport::new()))));
        let err = bot
            .upload_file(
                &UploadParams::document(1),
                FileUpload::from_bytes("a.txt", b"a".to_vec()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_logging_transport_passes_results_through() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_invoke(Err(TransportError::server_error("Bad Gateway")));
        let logging = LoggingTransport::new(mock);

        let err = logging.invoke(METHOD_GET_ME, json!({})).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::ServerError);
        assert!(logging.file_url("documents/a.txt").is_none());
    }
}
