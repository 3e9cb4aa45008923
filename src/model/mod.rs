use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";

/// Destination address on the messaging network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    /// Bare phone numbers get the user suffix; anything already carrying a
    /// server part (`@...`) is kept verbatim.
    pub fn normalize(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.contains('@') {
            Self(trimmed.to_string())
        } else {
            Self(format!("{trimmed}{USER_JID_SUFFIX}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Creds = serde_json::Map<String, serde_json::Value>;

/// Keying material addressed by `<category>-<id>` names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl KeyStore {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub creds: Creds,
    pub keys: KeyStore,
}

impl AuthState {
    pub fn is_registered(&self) -> bool {
        self.creds
            .get("registered")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Shallow-merges the creds patch and applies key writes/deletes.
    /// Returns whether anything changed.
    pub fn apply(&mut self, update: &CredsUpdate) -> bool {
        let mut changed = false;
        for (name, value) in &update.creds {
            if self.creds.get(name) != Some(value) {
                self.creds.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        for (name, value) in &update.keys {
            match value {
                Some(bytes) => {
                    if self.keys.get(name) != Some(bytes.as_slice()) {
                        self.keys.set(name.clone(), bytes.clone());
                        changed = true;
                    }
                }
                None => changed |= self.keys.remove(name).is_some(),
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredsUpdate {
    #[serde(default)]
    pub creds: Creds,
    #[serde(default)]
    pub keys: BTreeMap<String, Option<Vec<u8>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReason {
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
}

impl DisconnectReason {
    pub const LOGGED_OUT: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const CONNECTION_LOST: u16 = 408;
    pub const MULTIDEVICE_MISMATCH: u16 = 411;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const UNAVAILABLE_SERVICE: u16 = 503;
    pub const RESTART_REQUIRED: u16 = 515;

    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    /// Logout is the only closure that invalidates the stored credentials.
    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(Self::LOGGED_OUT)
    }

    pub fn label(&self) -> &'static str {
        match self.status_code {
            Some(Self::LOGGED_OUT) => "logged_out",
            Some(Self::FORBIDDEN) => "forbidden",
            Some(Self::CONNECTION_LOST) => "connection_lost",
            Some(Self::MULTIDEVICE_MISMATCH) => "multidevice_mismatch",
            Some(Self::CONNECTION_CLOSED) => "connection_closed",
            Some(Self::CONNECTION_REPLACED) => "connection_replaced",
            Some(Self::BAD_SESSION) => "bad_session",
            Some(Self::UNAVAILABLE_SERVICE) => "unavailable_service",
            Some(Self::RESTART_REQUIRED) => "restart_required",
            Some(_) => "other",
            None => "unknown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} ({code}): {}", self.label(), self.message),
            None => write!(f, "{}: {}", self.label(), self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Qr { code: String },
    Open { user_id: Option<String> },
    Closed { reason: DisconnectReason },
}

/// Everything a protocol client can report, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connection(ConnectionEvent),
    CredsUpdate(CredsUpdate),
    Messages(InboundMessageEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: MessageKey,
    #[serde(default, rename = "message")]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(
        default,
        rename = "buttonsResponseMessage",
        skip_serializing_if = "Option::is_none"
    )]
    pub buttons_response: Option<ButtonsResponse>,
    #[serde(
        default,
        rename = "listResponseMessage",
        skip_serializing_if = "Option::is_none"
    )]
    pub list_response: Option<ListResponse>,
    #[serde(
        default,
        rename = "templateButtonReplyMessage",
        skip_serializing_if = "Option::is_none"
    )]
    pub template_button_reply: Option<TemplateButtonReply>,
    /// Content kinds this crate does not model, carried through untouched.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonsResponse {
    #[serde(default)]
    pub selected_button_id: Option<String>,
    #[serde(default)]
    pub selected_display_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub single_select_reply: Option<SingleSelectReply>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSelectReply {
    #[serde(default)]
    pub selected_row_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateButtonReply {
    #[serde(default)]
    pub selected_id: Option<String>,
    #[serde(default)]
    pub selected_display_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    #[serde(rename = "type")]
    pub upsert_type: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonsMessage {
    pub body_text: String,
    pub buttons: Vec<Button>,
    pub footer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub row_id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMessage {
    pub body_text: String,
    pub title: String,
    pub action_label: String,
    pub sections: Vec<ListSection>,
    pub footer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum TemplateAction {
    QuickReply { display_text: String, id: String },
    Url { display_text: String, url: String },
    Call { display_text: String, phone_number: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateButton {
    /// 1-based position shown to the recipient.
    pub index: u32,
    pub action: TemplateAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateButtonsMessage {
    pub body_text: String,
    pub buttons: Vec<TemplateButton>,
    pub footer: String,
}

impl TemplateButtonsMessage {
    /// Buttons ordered by `index`; the recipient layout depends only on it.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.buttons.sort_by_key(|b| b.index);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundInteractiveMessage {
    Buttons(ButtonsMessage),
    List(ListMessage),
    TemplateButtons(TemplateButtonsMessage),
}

impl OutboundInteractiveMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buttons(_) => "buttons",
            Self::List(_) => "list",
            Self::TemplateButtons(_) => "template_buttons",
        }
    }

    /// Content field the message is stored under once sent.
    pub fn content_key(&self) -> &'static str {
        match self {
            Self::Buttons(_) => "buttonsMessage",
            Self::List(_) => "listMessage",
            Self::TemplateButtons(_) => "templateMessage",
        }
    }

    pub fn normalized(&self) -> Self {
        match self {
            Self::TemplateButtons(msg) => Self::TemplateButtons(msg.normalized()),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub key: MessageKey,
}
