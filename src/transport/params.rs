//! Request parameter records

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::MessageEntity;

/// Upper bound the remote service accepts for `limit`
pub const MAX_UPDATES_LIMIT: u32 = 100;

/// Parameters of `getUpdates`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateParams {
    pub offset: i64,
    pub limit: u32,
    /// Long-poll timeout in seconds
    pub timeout: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_updates: Vec<String>,
}

impl UpdateParams {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout))
    }
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: MAX_UPDATES_LIMIT,
            timeout: 30,
            allowed_updates: vec!["message".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    MarkdownV2,
    #[serde(rename = "HTML")]
    Html,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyParameters {
    pub message_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

/// Parameters of `sendMessage`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMessageParams {
    pub chat_id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disable_notification: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub protect_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_parameters: Option<ReplyParameters>,
    /// Keyboard markup, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
}

impl TextMessageParams {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            parse_mode: None,
            entities: Vec::new(),
            disable_notification: false,
            protect_content: false,
            reply_parameters: None,
            reply_markup: None,
        }
    }

    #[must_use]
    pub fn parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_parameters = Some(ReplyParameters {
            message_id,
            chat_id: None,
        });
        self
    }

    #[must_use]
    pub fn silent(mut self) -> Self {
        self.disable_notification = true;
        self
    }
}

/// Parameters of `editMessageText`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditMessageTextParams {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
}

impl EditMessageTextParams {
    pub fn new(chat_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            message_id,
            text: text.into(),
            parse_mode: None,
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteMessageParams {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GetFileParams {
    pub file_id: String,
}

/// Which `send*` method carries an upload, and the form field holding the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Document,
    Photo,
    Audio,
    Video,
}

impl UploadKind {
    pub fn method(self) -> &'static str {
        match self {
            Self::Document => "sendDocument",
            Self::Photo => "sendPhoto",
            Self::Audio => "sendAudio",
            Self::Video => "sendVideo",
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Photo => "photo",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadParams {
    pub chat_id: i64,
    pub kind: UploadKind,
    pub caption: Option<String>,
}

impl UploadParams {
    pub fn document(chat_id: i64) -> Self {
        Self {
            chat_id,
            kind: UploadKind::Document,
            caption: None,
        }
    }

    /// Plain form fields sent next to the file part
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("chat_id", self.chat_id.to_string())];
        if let Some(caption) = &self.caption {
            fields.push(("caption", caption.clone()));
        }
        fields
    }
}

/// File contents to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    /// Streamed from disk at send time
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub source: UploadSource,
}

impl FileUpload {
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            source: UploadSource::Bytes(bytes),
        }
    }

    /// Uses the path's final component as the file name
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            file_name,
            source: UploadSource::Path(path),
        }
    }
}
