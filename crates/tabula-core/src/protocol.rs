use crate::channel::ChannelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
}

/// Paths and flags the parent decides for this host process. All optional
/// pieces default to absent so older parents keep working.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostEnvironment {
    pub builtin_plugins_path: PathBuf,
    #[serde(default)]
    pub user_plugins_path: Option<PathBuf>,
    #[serde(default)]
    pub plugin_development_path: Option<PathBuf>,
    #[serde(default)]
    pub plugin_tests_path: Option<PathBuf>,
}

/// One-shot configuration snapshot delivered over the parent channel at the
/// start of the handshake. Immutable for the lifetime of the process.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostInitData {
    pub parent_pid: u32,
    #[serde(default)]
    pub workspace: Option<WorkspaceInfo>,
    #[serde(default)]
    pub configuration: Value,
    pub environment: HostEnvironment,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCallError {
    pub code: String,
    pub detail: String,
}

impl RemoteCallError {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RemoteCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostWireMessage {
    /// First signal from the host: observable before the parent sends any
    /// configuration.
    Ready,
    /// Second signal: the host can accept dispatch from this point on.
    Initialized,
    InitData {
        init: HostInitData,
    },
    Request {
        id: u64,
        target: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteCallError>,
    },
    Shutdown,
}

impl HostWireMessage {
    pub const fn kind_tag(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Initialized => "initialized",
            Self::InitData { .. } => "init_data",
            Self::Request { .. } => "request",
            Self::Reply { .. } => "reply",
            Self::Shutdown => "shutdown",
        }
    }
}

pub fn encode(message: &HostWireMessage) -> Result<Vec<u8>, ChannelError> {
    serde_json::to_vec(message)
        .map_err(|err| ChannelError::Codec(format!("serialize wire message failed: {err}")))
}

pub fn decode(frame: &[u8]) -> Result<HostWireMessage, ChannelError> {
    serde_json::from_slice(frame)
        .map_err(|err| ChannelError::Codec(format!("invalid wire message: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signals_roundtrip_as_bare_kinds() {
        for message in [
            HostWireMessage::Ready,
            HostWireMessage::Initialized,
            HostWireMessage::Shutdown,
        ] {
            let frame = encode(&message).expect("encode signal");
            let text = String::from_utf8(frame.clone()).expect("utf8 frame");
            assert_eq!(text, format!(r#"{{"kind":"{}"}}"#, message.kind_tag()));
            assert_eq!(decode(&frame).expect("decode signal"), message);
        }
    }

    #[test]
    fn init_data_roundtrips_with_optional_fields_absent() {
        let json = r#"{
            "kind": "init_data",
            "init": {
                "parentPid": 4242,
                "environment": { "builtinPluginsPath": "/opt/tabula/plugins" }
            }
        }"#;
        let message = decode(json.as_bytes()).expect("decode init data");
        match message {
            HostWireMessage::InitData { init } => {
                assert_eq!(init.parent_pid, 4242);
                assert!(init.workspace.is_none());
                assert_eq!(init.configuration, Value::Null);
                assert_eq!(
                    init.environment.builtin_plugins_path,
                    PathBuf::from("/opt/tabula/plugins")
                );
                assert!(init.environment.plugin_tests_path.is_none());
            }
            other => panic!("unexpected message kind: {}", other.kind_tag()),
        }
    }

    #[test]
    fn request_tolerates_missing_args() {
        let json = r#"{"kind":"request","id":7,"target":"plugin_activation","method":"activate_by_event"}"#;
        let message = decode(json.as_bytes()).expect("decode request");
        match message {
            HostWireMessage::Request {
                id, target, args, ..
            } => {
                assert_eq!(id, 7);
                assert_eq!(target, "plugin_activation");
                assert!(args.is_empty());
            }
            other => panic!("unexpected message kind: {}", other.kind_tag()),
        }
    }

    #[test]
    fn reply_roundtrips_with_error_payload() {
        let message = HostWireMessage::Reply {
            id: 9,
            result: None,
            error: Some(RemoteCallError::new(
                "unknown_remote_target",
                "no receiver registered for target: missing",
            )),
        };
        let frame = encode(&message).expect("encode reply");
        assert_eq!(decode(&frame).expect("decode reply"), message);
    }

    #[test]
    fn init_data_roundtrips_with_full_payload() {
        let message = HostWireMessage::InitData {
            init: HostInitData {
                parent_pid: 1001,
                workspace: Some(WorkspaceInfo {
                    id: "ws-1".to_string(),
                    name: "demo".to_string(),
                    root: PathBuf::from("/home/dev/demo"),
                }),
                configuration: json!({"editor": {"tabSize": 4}}),
                environment: HostEnvironment {
                    builtin_plugins_path: PathBuf::from("/opt/tabula/plugins"),
                    user_plugins_path: Some(PathBuf::from("/home/dev/.tabula/plugins")),
                    plugin_development_path: Some(PathBuf::from("/home/dev/my-plugin")),
                    plugin_tests_path: Some(PathBuf::from("/home/dev/my-plugin/tests")),
                },
            },
        };
        let frame = encode(&message).expect("encode init data");
        assert_eq!(decode(&frame).expect("decode init data"), message);
    }
}
