use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::VaultItem;
use crate::settings::Settings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },
}

/// Query payload the launcher sends with every keystroke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    #[serde(deserialize_with = "null_as_default")]
    pub search: String,
    #[serde(rename = "searchTerms", deserialize_with = "null_as_default")]
    pub search_terms: Vec<String>,
    #[serde(rename = "actionKeyword", deserialize_with = "null_as_default")]
    pub action_keyword: String,
    #[serde(rename = "rawQuery", deserialize_with = "null_as_default")]
    pub raw_query: String,
}

/// Payload attached to search results and handed back to us by the host
/// for the copy and context menu actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub item: VaultItem,
    #[serde(default)]
    pub score: u32,
    #[serde(deserialize_with = "port_from_value")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyField {
    Email,
    Password,
    Totp,
}

impl CopyField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Password => "password",
            Self::Totp => "totp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcAction {
    pub method: String,
    pub parameters: Vec<Value>,
}

/// One row in the launcher's result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub title: String,
    pub subtitle: String,
    #[serde(rename = "jsonRPCAction")]
    pub action: JsonRpcAction,
    #[serde(rename = "IcoPath")]
    pub icon_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(rename = "contextData", default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginResponse {
    Results {
        result: Vec<ResultItem>,
    },
    Hide {
        #[serde(rename = "Hide")]
        hide: bool,
    },
    Empty,
}

impl PluginResponse {
    pub fn results(result: Vec<ResultItem>) -> Self {
        Self::Results { result }
    }

    pub fn hide() -> Self {
        Self::Hide { hide: true }
    }

    pub fn keep_open() -> Self {
        Self::Hide { hide: false }
    }
}

/// Requests the plugin sends back to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    OpenUrl { url: String },
    ChangeQuery { query: String, requery: bool },
}

impl HostCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::OpenUrl { .. } => "OpenUrl",
            Self::ChangeQuery { .. } => "ChangeQuery",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Self::OpenUrl { url } => serde_json::json!({ "url": url }),
            Self::ChangeQuery { query, requery } => serde_json::json!([query, requery]),
        }
    }
}

/// Every method the launcher may invoke on the plugin. Ports are optional
/// wherever the host may omit them; handlers fall back to the settings port.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginRequest {
    Initialize { settings: Option<Settings> },
    Query { query: QueryParams, settings: Option<Settings> },
    ContextMenu { context: Option<ActionContext> },
    Login { url: String },
    Unlock { password: String, port: Option<u16> },
    Lock { port: Option<u16> },
    StartSearch,
    StartServer { port: Option<u16> },
    StopServer { port: Option<u16> },
    ResetAllCache { port: Option<u16> },
    ResetCache,
    CopyToClipboard { context: ActionContext, field: CopyField },
}

impl PluginRequest {
    pub fn parse(method: &str, params: Value) -> Result<Self, ContractError> {
        let args = positional(params);
        let invalid = |message: &str| ContractError::InvalidParams {
            method: method.to_string(),
            message: message.to_string(),
        };

        let request = match method {
            "initialize" => Self::Initialize {
                settings: args.iter().find_map(settings_from),
            },
            "query" => {
                let query = args
                    .first()
                    .cloned()
                    .ok_or_else(|| invalid("missing query"))?;
                let query: QueryParams =
                    serde_json::from_value(query).map_err(|e| invalid(&e.to_string()))?;
                Self::Query {
                    query,
                    settings: args.get(1).and_then(settings_from),
                }
            }
            "context_menu" => Self::ContextMenu {
                context: args
                    .first()
                    .and_then(|value| serde_json::from_value(value.clone()).ok()),
            },
            "bw_login" => Self::Login {
                url: args
                    .first()
                    .and_then(Value::as_str)
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| invalid("missing url"))?
                    .to_string(),
            },
            "bw_unlock" => Self::Unlock {
                password: args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                port: args.get(1).and_then(port_of),
            },
            "bw_lock" => Self::Lock {
                port: args.first().and_then(port_of),
            },
            "bw_start_search" => Self::StartSearch,
            "start_bw_server" => Self::StartServer {
                port: args.first().and_then(port_of),
            },
            "stop_bw_server" => Self::StopServer {
                port: args.first().and_then(port_of),
            },
            "reset_all_cache" => Self::ResetAllCache {
                port: args.first().and_then(port_of),
            },
            "reset_cache" => Self::ResetCache,
            "copy_to_clipboard" => {
                if args.len() < 2 {
                    return Err(invalid("expected [context, field]"));
                }
                let context: ActionContext = serde_json::from_value(args[0].clone())
                    .map_err(|e| invalid(&e.to_string()))?;
                // Older actions carry the copied value in the middle; the
                // field always comes last.
                let field: CopyField = serde_json::from_value(args[args.len() - 1].clone())
                    .map_err(|e| invalid(&e.to_string()))?;
                Self::CopyToClipboard { context, field }
            }
            other => return Err(ContractError::UnknownMethod(other.to_string())),
        };
        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Query { .. } => "query",
            Self::ContextMenu { .. } => "context_menu",
            Self::Login { .. } => "bw_login",
            Self::Unlock { .. } => "bw_unlock",
            Self::Lock { .. } => "bw_lock",
            Self::StartSearch => "bw_start_search",
            Self::StartServer { .. } => "start_bw_server",
            Self::StopServer { .. } => "stop_bw_server",
            Self::ResetAllCache { .. } => "reset_all_cache",
            Self::ResetCache => "reset_cache",
            Self::CopyToClipboard { .. } => "copy_to_clipboard",
        }
    }
}

/// Flattens the host's params into a positional list. Some hosts wrap the
/// action parameters in one more array.
fn positional(params: Value) -> Vec<Value> {
    match params {
        Value::Array(mut items) => {
            if items.len() == 1 && items[0].is_array() {
                match items.remove(0) {
                    Value::Array(inner) => inner,
                    other => vec![other],
                }
            } else {
                items
            }
        }
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn settings_from(value: &Value) -> Option<Settings> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Accepts `58765`, `"58765"`, or a settings object carrying the port.
pub fn port_of(value: &Value) -> Option<u16> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0),
        Value::String(raw) => raw.trim().parse::<u16>().ok().filter(|port| *port != 0),
        Value::Object(_) => settings_from(value).map(|settings| settings.port()),
        _ => None,
    }
}

fn port_from_value<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    port_of(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid port: {value}")))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
