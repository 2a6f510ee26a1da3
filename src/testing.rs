//! Mock implementations for testing
//!
//! These mocks let the poller, conversation engine and bot facade run
//! without any network I/O.

use crate::transport::{RawPayload, Transport, TransportError, UpdateParams};
use crate::types::{Chat, Message, MessageEntity, Update, User};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Mock Transport
// ============================================================================

/// Transport returning queued responses and recording every call.
///
/// An empty fetch queue behaves like a long poll that timed out with no
/// pending updates.
#[derive(Default)]
pub struct MockTransport {
    invoke_responses: Mutex<VecDeque<Result<RawPayload, TransportError>>>,
    fetch_responses: Mutex<VecDeque<Result<Vec<Update>, TransportError>>>,
    invocations: Mutex<Vec<(String, Value)>>,
    fetches: Mutex<Vec<UpdateParams>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_invoke(&self, response: Result<RawPayload, TransportError>) {
        self.invoke_responses.lock().unwrap().push_back(response);
    }

    pub fn queue_updates(&self, updates: Vec<Update>) {
        self.fetch_responses.lock().unwrap().push_back(Ok(updates));
    }

    pub fn queue_fetch_error(&self, error: TransportError) {
        self.fetch_responses.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }

    /// Offsets sent with each `getUpdates` call, in call order
    pub fn fetched_offsets(&self) -> Vec<i64> {
        self.fetches.lock().unwrap().iter().map(|p| p.offset).collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    /// Wait until at least `count` fetches happened
    pub async fn wait_for_fetches(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.fetch_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.fetch_count() >= count
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(&self, method: &str, params: Value) -> Result<RawPayload, TransportError> {
        self.invocations
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        self.invoke_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!(true)))
    }

    async fn fetch_updates(&self, params: &UpdateParams) -> Result<Vec<Update>, TransportError> {
        self.fetches.lock().unwrap().push(params.clone());
        self.fetch_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Wire JSON of a text message from `user_id` in `chat_id`
pub fn message_json(message_id: i64, chat_id: i64, user_id: i64, text: &str) -> Value {
    json!({
        "message_id": message_id,
        "date": 1_700_000_000,
        "chat": {"id": chat_id, "type": "private"},
        "from": {"id": user_id, "is_bot": false, "first_name": "Tester"},
        "text": text
    })
}

pub fn text_message(chat_id: i64, user_id: i64, text: &str) -> Message {
    let entities = if text.starts_with('/') {
        let len = text.split_whitespace().next().map_or(0, str::len);
        vec![MessageEntity::bot_command(i64::try_from(len).unwrap())]
    } else {
        Vec::new()
    };
    Message {
        id: 1,
        date: 1_700_000_000,
        chat: Chat::private(chat_id),
        from: Some(User::new(user_id, "Tester")),
        text: Some(text.to_string()),
        entities,
        document: None,
        reply_to: None,
        edit_date: None,
    }
}

/// Text update from `user_id` in `chat_id`
pub fn text_update(id: i64, chat_id: i64, user_id: i64, text: &str) -> Update {
    Update::with_message(id, text_message(chat_id, user_id, text))
}

/// Message updates with the given ids from a single chat/user
pub fn updates_with_ids(ids: &[i64]) -> Vec<Update> {
    ids.iter()
        .map(|&id| text_update(id, 7, 42, &format!("msg {id}")))
        .collect()
}
