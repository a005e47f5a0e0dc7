//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a fresh full snapshot
    RequestSnapshot,

    /// Invoke an exposed manager method
    RpcRequest {
        id: String,
        manager: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Any envelope type this server does not know about
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::ClientMessage;
    use serde_json::json;

    #[test]
    fn parses_rpc_request() {
        let json = r#"{
          "type":"rpc_request",
          "id":"req-1",
          "manager":"counter",
          "method":"increment",
          "args":[5]
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse rpc_request");
        match &parsed {
            ClientMessage::RpcRequest {
                id,
                manager,
                method,
                args,
            } => {
                assert_eq!(id, "req-1");
                assert_eq!(manager, "counter");
                assert_eq!(method, "increment");
                assert_eq!(args, &vec![json!(5)]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn rpc_request_args_default_to_empty() {
        let json = r#"{"type":"rpc_request","id":"r","manager":"counter","method":"reset"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse");
        match parsed {
            ClientMessage::RpcRequest { args, .. } => assert!(args.is_empty()),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn parses_request_snapshot() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"request_snapshot"}"#).expect("parse");
        assert_eq!(parsed, ClientMessage::RequestSnapshot);
    }

    #[test]
    fn unrecognized_type_decodes_to_unknown() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_presence"}"#).expect("parse");
        assert_eq!(parsed, ClientMessage::Unknown);
    }

    #[test]
    fn missing_type_is_a_parse_error() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{"id":"x"}"#);
        assert!(parsed.is_err());
    }
}
