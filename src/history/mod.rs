use crate::model::{Message, MessageContent, MessageKey, OutboundInteractiveMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const PLACEHOLDER_TEXT: &str = "test";

/// Looks message content up again when the protocol client has to
/// retransmit it.
pub trait MessageResolver: Send + Sync {
    fn resolve(&self, key: &MessageKey) -> Option<MessageContent>;
}

/// Answers every lookup with the same text message.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderResolver;

impl MessageResolver for PlaceholderResolver {
    fn resolve(&self, _key: &MessageKey) -> Option<MessageContent> {
        Some(MessageContent::text(PLACEHOLDER_TEXT))
    }
}

type HistoryKey = (String, String);

#[derive(Debug, Default)]
struct HistoryInner {
    order: VecDeque<HistoryKey>,
    by_key: HashMap<HistoryKey, MessageContent>,
}

/// Bounded in-memory record of recently seen messages, oldest evicted first.
#[derive(Debug)]
pub struct MessageHistory {
    capacity: usize,
    placeholder_fallback: bool,
    inner: Mutex<HistoryInner>,
}

impl MessageHistory {
    pub fn new(capacity: usize, placeholder_fallback: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            placeholder_fallback,
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    pub fn record(&self, message: &Message) {
        if let Some(content) = message.content.clone() {
            self.insert(&message.key, content);
        }
    }

    pub fn record_all<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) {
        for message in messages {
            self.record(message);
        }
    }

    /// Keeps an outbound message under the key the server assigned to it, so
    /// a retransmission request for it resolves to what was really sent.
    pub fn record_sent(&self, key: &MessageKey, message: &OutboundInteractiveMessage) {
        let payload = match serde_json::to_value(message.normalized()) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, id = %key.id, "cannot record sent message");
                return;
            }
        };
        let mut content = MessageContent::default();
        content.other.insert(message.content_key().to_string(), payload);
        self.insert(key, content);
    }

    fn insert(&self, key: &MessageKey, content: MessageContent) {
        let key = (key.remote_jid.clone(), key.id.clone());
        let mut inner = self.inner.lock().unwrap();
        if inner.by_key.insert(key.clone(), content).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.by_key.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

impl MessageResolver for MessageHistory {
    fn resolve(&self, key: &MessageKey) -> Option<MessageContent> {
        let found = self
            .inner
            .lock()
            .unwrap()
            .by_key
            .get(&(key.remote_jid.clone(), key.id.clone()))
            .cloned();
        match found {
            Some(content) => Some(content),
            None if self.placeholder_fallback => PlaceholderResolver.resolve(key),
            None => {
                tracing::debug!(id = %key.id, "message not in history");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, text: &str) -> Message {
        Message {
            key: MessageKey {
                remote_jid: "100@s.whatsapp.net".into(),
                id: id.into(),
                from_me: true,
            },
            content: Some(MessageContent::text(text)),
        }
    }

    #[test]
    fn resolves_recorded_content() {
        let history = MessageHistory::new(8, false);
        let msg = message("A1", "hello");
        history.record(&msg);
        assert_eq!(history.resolve(&msg.key), Some(MessageContent::text("hello")));
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let history = MessageHistory::new(2, false);
        let first = message("A1", "one");
        history.record_all([&first, &message("A2", "two"), &message("A3", "three")]);
        assert_eq!(history.len(), 2);
        assert_eq!(history.resolve(&first.key), None);
    }

    #[test]
    fn falls_back_to_placeholder_when_enabled() {
        let history = MessageHistory::new(2, true);
        let key = message("missing", "").key;
        assert_eq!(
            history.resolve(&key),
            Some(MessageContent::text(PLACEHOLDER_TEXT))
        );
    }

    #[test]
    fn sent_message_resolves_to_its_payload() {
        let history = MessageHistory::new(8, true);
        let key = MessageKey {
            remote_jid: "5515991426667@s.whatsapp.net".into(),
            id: "3EB0SENT".into(),
            from_me: true,
        };
        let sent = crate::harness::sample_message(crate::harness::HarnessStep::List);
        history.record_sent(&key, &sent);

        let content = history.resolve(&key).unwrap();
        assert_eq!(content.conversation, None, "not the placeholder");
        let stored = &content.other["listMessage"];
        let decoded: OutboundInteractiveMessage = serde_json::from_value(stored.clone()).unwrap();
        assert_eq!(decoded, sent);
    }
}
