//! Bot API domain records
//!
//! Only the subset of the remote schema the library itself needs. Unknown
//! fields are ignored on decode so newer server responses keep parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One event from the long-poll feed.
///
/// `id` is assigned by the remote service and strictly increases. At most one
/// of the payload fields is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "update_id")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_channel_post: Option<Message>,
}

/// Which payload an update carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
}

impl UpdateKind {
    /// Name used in the `allowed_updates` request field
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditedMessage => "edited_message",
            Self::ChannelPost => "channel_post",
            Self::EditedChannelPost => "edited_channel_post",
        }
    }
}

impl Update {
    /// An update with no payload, mostly useful for tests and fixtures
    pub fn empty(id: i64) -> Self {
        Self {
            id,
            message: None,
            edited_message: None,
            channel_post: None,
            edited_channel_post: None,
        }
    }

    pub fn with_message(id: i64, message: Message) -> Self {
        Self {
            message: Some(message),
            ..Self::empty(id)
        }
    }

    /// Kind of payload carried, `None` for updates this crate does not model
    pub fn kind(&self) -> Option<UpdateKind> {
        if self.message.is_some() {
            Some(UpdateKind::Message)
        } else if self.edited_message.is_some() {
            Some(UpdateKind::EditedMessage)
        } else if self.channel_post.is_some() {
            Some(UpdateKind::ChannelPost)
        } else if self.edited_channel_post.is_some() {
            Some(UpdateKind::EditedChannelPost)
        } else {
            None
        }
    }

    /// The message payload regardless of which message-like field carried it
    pub fn message(&self) -> Option<&Message> {
        self.message
            .as_ref()
            .or(self.edited_message.as_ref())
            .or(self.channel_post.as_ref())
            .or(self.edited_channel_post.as_ref())
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.message().map(|m| m.chat.id)
    }

    /// Sender of the message. Channel posts usually have none.
    pub fn user_id(&self) -> Option<i64> {
        self.message().and_then(|m| m.from.as_ref()).map(|u| u.id)
    }

    pub fn text(&self) -> Option<&str> {
        self.message().and_then(|m| m.text.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message_id")]
    pub id: i64,
    /// Unix timestamp (seconds)
    pub date: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    #[serde(
        rename = "reply_to_message",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reply_to: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_date: Option<i64>,
}

impl Message {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.date, 0)
    }

    /// A message is a command when its first entity is a `bot_command` at
    /// offset 0, or, lacking entities, when the text is `/` followed by at
    /// least one character.
    pub fn is_command(&self) -> bool {
        if let Some(first) = self.entities.first() {
            return first.is_command();
        }
        self.text
            .as_deref()
            .and_then(|t| t.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty())
    }

    /// Command name without the leading `/`, any `@botname` suffix, or arguments.
    pub fn command(&self) -> Option<&str> {
        if !self.is_command() {
            return None;
        }
        let rest = self.text.as_deref()?.strip_prefix('/')?;
        let word = rest.split(char::is_whitespace).next().unwrap_or_default();
        Some(word.split('@').next().unwrap_or_default())
    }

    /// Text following the command word, trimmed
    pub fn command_args(&self) -> Option<&str> {
        self.command()?;
        let text = self.text.as_deref()?;
        Some(
            text.split_once(char::is_whitespace)
                .map_or("", |(_, args)| args.trim()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    /// `mention`, `hashtag`, `bot_command`, `url`, `text_link`, ...
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: i64,
    pub length: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl MessageEntity {
    pub fn bot_command(length: i64) -> Self {
        Self {
            kind: "bot_command".to_string(),
            offset: 0,
            length,
            url: None,
            user: None,
        }
    }

    pub fn is_command(&self) -> bool {
        self.offset == 0 && self.kind == "bot_command"
    }

    /// URL of a `text_link` entity
    pub fn parse_url(&self) -> Option<reqwest::Url> {
        self.url.as_deref().and_then(|u| reqwest::Url::parse(u).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_forum: bool,
}

impl Chat {
    pub fn private(id: i64) -> Self {
        Self {
            id,
            kind: ChatType::Private,
            title: None,
            username: None,
            first_name: None,
            last_name: None,
            is_forum: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl User {
    pub fn new(id: i64, first_name: impl Into<String>) -> Self {
        Self {
            id,
            is_bot: false,
            first_name: first_name.into(),
            last_name: None,
            username: None,
            language_code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// File metadata returned by `getFile`; `file_path` feeds `Bot::file_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageId {
    pub message_id: i64,
}
