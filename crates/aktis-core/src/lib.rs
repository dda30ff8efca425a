//! Core domain model for the Aktis collector: credentials, containers, child items.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "aktis-core";

/// Top-level stored field carrying the container an item was fetched for.
pub const CONTAINER_KEY_FIELD: &str = "containerKey";

/// One browser cookie as captured by the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, alias = "expirationDate")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

impl CookieSpec {
    /// Render as a `Set-Cookie` header value so a cookie jar can parse it.
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        let domain = self.domain.trim();
        if !domain.is_empty() {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        let path = if self.path.trim().is_empty() { "/" } else { self.path.trim() };
        out.push_str("; Path=");
        out.push_str(path);
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Browser-derived credentials for the remote suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    #[serde(default)]
    pub cookies: Vec<CookieSpec>,
    #[serde(default)]
    pub tokens: Map<String, JsonValue>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl CredentialBundle {
    /// A bundle without a base URL can never authenticate a request.
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    pub fn normalized_base_url(&self) -> String {
        self.base_url.trim().trim_end_matches('/').to_string()
    }

    pub fn token_str(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).and_then(|v| v.as_str())
    }

    pub fn cloud_id(&self) -> Option<&str> {
        self.token_str("cloudId")
    }

    pub fn atl_token(&self) -> Option<&str> {
        self.token_str("atlToken")
    }
}

/// The two container families the collector knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Project,
    Space,
}

impl ContainerKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Space => "space",
        }
    }

    pub fn item_label(self) -> &'static str {
        match self {
            Self::Project => "issue",
            Self::Space => "page",
        }
    }

    /// Name of the derived count field on the stored container document.
    pub fn count_field(self) -> &'static str {
        match self {
            Self::Project => "issueCount",
            Self::Space => "pageCount",
        }
    }

    /// JSON pointer to the stable key of a child item payload.
    pub fn item_key_pointer(self) -> &'static str {
        match self {
            Self::Project => "/key",
            Self::Space => "/id",
        }
    }

    /// JSON pointer to the container reference embedded in a child item payload.
    pub fn item_container_pointer(self) -> &'static str {
        match self {
            Self::Project => "/fields/project/key",
            Self::Space => "/space/key",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Derived child count of a container. `Unknown` means the count fetch failed.
///
/// Encoded on the wire and on disk as `-1` for `Unknown`, otherwise the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemCount {
    #[default]
    Unknown,
    Known(u64),
}

impl ItemCount {
    pub fn known(self) -> Option<u64> {
        match self {
            Self::Known(n) => Some(n),
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }

    fn from_json(value: &JsonValue) -> Self {
        match value.as_i64() {
            Some(n) if n >= 0 => Self::Known(n as u64),
            Some(_) => Self::Unknown,
            None => value.as_u64().map(Self::Known).unwrap_or(Self::Unknown),
        }
    }

    fn to_json(self) -> JsonValue {
        match self {
            Self::Known(n) => JsonValue::from(n),
            Self::Unknown => JsonValue::from(-1),
        }
    }
}

impl fmt::Display for ItemCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(n) => write!(f, "{n}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for ItemCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(n) => serializer.serialize_u64(*n),
            Self::Unknown => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for ItemCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(if raw < 0 { Self::Unknown } else { Self::Known(raw as u64) })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("{what} payload is not a JSON object")]
    NotAnObject { what: &'static str },
    #[error("{what} payload has no usable key")]
    MissingKey { what: &'static str },
}

/// A project or space, with the remote document kept verbatim for pass-through.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub kind: ContainerKind,
    pub key: String,
    pub name: String,
    pub id: String,
    pub count: ItemCount,
    document: Map<String, JsonValue>,
}

impl ContainerRecord {
    /// Build from a remote or stored document. A count field present on the
    /// document is honoured; otherwise the count starts as `Unknown`.
    pub fn from_value(kind: ContainerKind, value: JsonValue) -> Result<Self, RecordError> {
        let JsonValue::Object(document) = value else {
            return Err(RecordError::NotAnObject { what: kind.label() });
        };
        let key = document
            .get("key")
            .and_then(|v| v.as_str())
            .filter(|k| !k.is_empty())
            .ok_or(RecordError::MissingKey { what: kind.label() })?
            .to_string();
        let name = document
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let id = match document.get("id") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let count = document
            .get(kind.count_field())
            .map(ItemCount::from_json)
            .unwrap_or_default();
        Ok(Self {
            kind,
            key,
            name,
            id,
            count,
            document,
        })
    }

    /// The stored representation: the remote document plus the count field.
    pub fn to_document(&self) -> JsonValue {
        let mut document = self.document.clone();
        document.insert(self.kind.count_field().to_string(), self.count.to_json());
        JsonValue::Object(document)
    }
}

/// An issue or page: typed envelope around an opaque remote payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildItem {
    pub key: String,
    /// Container this item was fetched for.
    pub container_key: String,
    /// Container the payload claims to belong to, when it says.
    pub reported_container: Option<String>,
    pub payload: JsonValue,
}

impl ChildItem {
    pub fn from_payload(
        kind: ContainerKind,
        requested_container: &str,
        payload: JsonValue,
    ) -> Result<Self, RecordError> {
        if !payload.is_object() {
            return Err(RecordError::NotAnObject { what: kind.item_label() });
        }
        let key = json_key_at(&payload, kind.item_key_pointer())
            .ok_or(RecordError::MissingKey { what: kind.item_label() })?;
        let reported_container = json_key_at(&payload, kind.item_container_pointer());
        Ok(Self {
            key,
            container_key: requested_container.to_string(),
            reported_container,
            payload,
        })
    }

    pub fn is_misrouted(&self) -> bool {
        self.reported_container
            .as_deref()
            .is_some_and(|reported| reported != self.container_key)
    }

    /// The stored representation: payload plus the `containerKey` annotation.
    pub fn to_document(&self) -> JsonValue {
        self.clone().into_document()
    }

    pub fn into_document(self) -> JsonValue {
        let mut document = self.payload;
        if let JsonValue::Object(map) = &mut document {
            map.insert(
                CONTAINER_KEY_FIELD.to_string(),
                JsonValue::String(self.container_key),
            );
        }
        document
    }
}

/// Container key of a stored item document: the annotation first, then the
/// reference embedded in the remote payload.
pub fn stored_container_key(kind: ContainerKind, document: &JsonValue) -> Option<String> {
    document
        .get(CONTAINER_KEY_FIELD)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .or_else(|| json_key_at(document, kind.item_container_pointer()))
}

fn json_key_at(value: &JsonValue, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// Operator-facing progress line, consumed by the UI log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub level: ProgressLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(level: ProgressLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
