use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

pub const TYPE_KEY: &str = "@type";
pub const EXTRA_KEY: &str = "@extra";

/// Backend call or response: `{ "@type": name, ...fields, "@extra"?: tag }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(type_name: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_KEY.to_string(), Value::String(type_name.to_string()));
        Self { fields }
    }

    /// Wraps a JSON object carrying a string `@type`.
    pub fn from_fields(value: Value) -> Result<Self, ClientError> {
        let Value::Object(fields) = value else {
            return Err(ClientError::Malformed("envelope must be an object".into()));
        };
        if !matches!(fields.get(TYPE_KEY), Some(Value::String(_))) {
            return Err(ClientError::Malformed("envelope has no @type".into()));
        }
        Ok(Self { fields })
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn type_name(&self) -> &str {
        self.fields
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.fields.insert(key.to_string(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn extra(&self) -> Option<&Value> {
        self.fields.get(EXTRA_KEY)
    }

    pub fn take_extra(&mut self) -> Option<Value> {
        self.fields.remove(EXTRA_KEY)
    }

    pub fn set_extra(&mut self, extra: Option<Value>) {
        match extra {
            Some(extra) => {
                self.fields.insert(EXTRA_KEY.to_string(), extra);
            }
            None => {
                self.fields.remove(EXTRA_KEY);
            }
        }
    }

    pub fn is_error(&self) -> bool {
        self.type_name() == "error"
    }

    /// `(code, message)` of an `error` envelope.
    pub fn error_parts(&self) -> Option<(i64, String)> {
        if !self.is_error() {
            return None;
        }
        let code = self.get_i64("code").unwrap_or_default();
        let message = self
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((code, message))
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Correlation tag the client puts in `@extra`; the caller's own tag is
/// nested under `original`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTag {
    pub query_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Value>,
}

/// Operations answered locally with code 400 instead of reaching the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedMethod {
    GetStorageStatistics,
    GetStorageStatisticsFast,
    OptimizeStorage,
    AddProxy,
    Init,
    Start,
}

impl UnsupportedMethod {
    pub const ALL: [UnsupportedMethod; 6] = [
        Self::GetStorageStatistics,
        Self::GetStorageStatisticsFast,
        Self::OptimizeStorage,
        Self::AddProxy,
        Self::Init,
        Self::Start,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::GetStorageStatistics => "getStorageStatistics",
            Self::GetStorageStatisticsFast => "getStorageStatisticsFast",
            Self::OptimizeStorage => "optimizeStorage",
            Self::AddProxy => "addProxy",
            Self::Init => "init",
            Self::Start => "start",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.name() == name)
    }
}

/// Byte range requested from the file cache. `size == None` means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFileRequest {
    pub file_id: i64,
    pub offset: u64,
    pub size: Option<u64>,
}

impl ReadFileRequest {
    pub fn whole(file_id: i64) -> Self {
        Self {
            file_id,
            offset: 0,
            size: None,
        }
    }

    pub fn range(file_id: i64, offset: u64, size: u64) -> Self {
        Self {
            file_id,
            offset,
            size: (size > 0).then_some(size),
        }
    }
}

/// Routing decision for one outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Unsupported(UnsupportedMethod),
    ReadFile(ReadFileRequest),
    DeleteFile { file_id: i64, envelope: Envelope },
    Forward(Envelope),
}

impl Request {
    pub fn classify(envelope: Envelope) -> Request {
        let type_name = envelope.type_name();
        if let Some(method) = UnsupportedMethod::from_name(type_name) {
            return Request::Unsupported(method);
        }
        match type_name {
            "readFile" | "readFilePart" => match envelope.get_i64("file_id") {
                Some(file_id) => {
                    let offset = envelope.get_u64("offset").unwrap_or(0);
                    let size = envelope
                        .get_u64("size")
                        .or_else(|| envelope.get_u64("count"))
                        .unwrap_or(0);
                    Request::ReadFile(ReadFileRequest::range(file_id, offset, size))
                }
                None => Request::Forward(envelope),
            },
            "deleteFile" => match envelope.get_i64("file_id") {
                Some(file_id) => Request::DeleteFile { file_id, envelope },
                None => Request::Forward(envelope),
            },
            _ => Request::Forward(envelope),
        }
    }
}
