use crate::model::{InboundMessageEvent, Message, MessageKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveReply {
    Button {
        key: MessageKey,
        selected_id: String,
        display_text: Option<String>,
    },
    List {
        key: MessageKey,
        selected_row_id: String,
        title: Option<String>,
    },
    Template {
        key: MessageKey,
        selected_id: String,
        display_text: Option<String>,
    },
}

impl InteractiveReply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Button { .. } => "button_reply",
            Self::List { .. } => "list_reply",
            Self::Template { .. } => "template_reply",
        }
    }

    /// Button id or list row id, for matching against what was sent.
    pub fn selected_id(&self) -> &str {
        match self {
            Self::Button { selected_id, .. } | Self::Template { selected_id, .. } => selected_id,
            Self::List {
                selected_row_id, ..
            } => selected_row_id,
        }
    }

    pub fn key(&self) -> &MessageKey {
        match self {
            Self::Button { key, .. } | Self::List { key, .. } | Self::Template { key, .. } => key,
        }
    }

    fn label(&self) -> Option<&str> {
        match self {
            Self::Button { display_text, .. } | Self::Template { display_text, .. } => {
                display_text.as_deref()
            }
            Self::List { title, .. } => title.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{kind} in message {message_id} carries no selection")]
    MissingSelection {
        kind: &'static str,
        message_id: String,
    },
}

/// First match wins: button reply, then list reply, then template reply.
pub fn classify(message: &Message) -> Result<Option<InteractiveReply>, DispatchError> {
    let Some(content) = &message.content else {
        return Ok(None);
    };
    let missing = |kind| DispatchError::MissingSelection {
        kind,
        message_id: message.key.id.clone(),
    };

    if let Some(reply) = &content.buttons_response {
        let selected_id = non_empty(&reply.selected_button_id).ok_or_else(|| missing("button_reply"))?;
        return Ok(Some(InteractiveReply::Button {
            key: message.key.clone(),
            selected_id,
            display_text: reply.selected_display_text.clone(),
        }));
    }

    if let Some(reply) = &content.list_response {
        let row_id = reply
            .single_select_reply
            .as_ref()
            .and_then(|s| non_empty(&s.selected_row_id))
            .ok_or_else(|| missing("list_reply"))?;
        return Ok(Some(InteractiveReply::List {
            key: message.key.clone(),
            selected_row_id: row_id,
            title: reply.title.clone(),
        }));
    }

    if let Some(reply) = &content.template_button_reply {
        let selected_id = non_empty(&reply.selected_id).ok_or_else(|| missing("template_reply"))?;
        return Ok(Some(InteractiveReply::Template {
            key: message.key.clone(),
            selected_id,
            display_text: reply.selected_display_text.clone(),
        }));
    }

    Ok(None)
}

/// Classifies every message of one upsert batch, in order, logging one line
/// per interactive reply. A malformed message is skipped, not fatal.
pub fn dispatch(event: &InboundMessageEvent) -> Vec<InteractiveReply> {
    let mut replies = Vec::new();
    for message in &event.messages {
        match classify(message) {
            Ok(Some(reply)) => {
                tracing::info!(
                    kind = reply.kind(),
                    id = %reply.selected_id(),
                    text = reply.label().unwrap_or_default(),
                    from = %reply.key().remote_jid,
                    upsert_type = %event.upsert_type,
                    "interactive reply received"
                );
                replies.push(reply);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed interactive reply");
            }
        }
    }
    replies
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
