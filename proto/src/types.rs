// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! The JSON payloads exchanged during connection setup: the server's `INFO`
//! document and the client's `CONNECT` options.

use serde::{Deserialize, Serialize};

/// Information sent by the server in its `INFO` frame, both as the initial
/// hello and as later cluster topology updates. Authoritative while the
/// connection it arrived on lasts.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerInfo {
    /// The unique identifier of the NATS server.
    pub server_id: String,
    /// Generated server name.
    pub server_name: String,
    /// The host the server advertises itself under.
    pub host: String,
    /// The port the server advertises itself under.
    pub port: u16,
    /// The version of the NATS server.
    pub version: String,
    /// Whether the server requires authentication on connect.
    pub auth_required: bool,
    /// Whether the server requires TLS before `CONNECT`.
    pub tls_required: bool,
    /// Whether the server is able to upgrade to TLS.
    pub tls_available: bool,
    /// Maximum payload size the server will accept.
    pub max_payload: usize,
    /// The protocol version in use.
    pub proto: i8,
    /// The server-assigned client id. This may change across reconnects.
    pub client_id: u64,
    /// The version of golang the server was built with.
    pub go: String,
    /// The nonce to be signed when using signed authentication.
    pub nonce: String,
    /// Peer server URLs a client may connect to instead.
    pub connect_urls: Vec<String>,
    /// The client IP as seen by the server.
    pub client_ip: String,
    /// Whether the server supports message headers.
    pub headers: bool,
    /// Whether the server has entered lame duck mode and will shut down.
    #[serde(rename = "ldm")]
    pub lame_duck_mode: bool,
    /// Name of the cluster the server belongs to, if any.
    pub cluster: String,
}

/// Options sent to the server in the `CONNECT` frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Turns on `+OK` acknowledgements for every protocol message.
    pub verbose: bool,
    /// Turns on additional strict format checking, e.g. of properly formed
    /// subjects.
    pub pedantic: bool,
    /// Indicates whether the client will try to upgrade to TLS.
    pub tls_required: bool,
    /// Authentication token, when token auth is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// User name, when user/password auth is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password, when user/password auth is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// The JWT, when JWT-based auth is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// The public NKey identifying the client, when signed auth is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    /// The signature over the server-provided nonce, when signed auth is
    /// used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    /// Optional client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The implementation language of the client.
    pub lang: String,
    /// The version of the client.
    pub version: String,
    /// Sending 1 (or higher) asks the server for asynchronous `INFO`
    /// updates carrying discovered peers.
    pub protocol: u8,
    /// Whether the server should echo the client's own publishes back to
    /// its matching subscriptions.
    pub echo: bool,
    /// Whether the client understands message headers.
    pub headers: bool,
    /// Whether the client wants `503` status replies when a request finds
    /// no responders.
    pub no_responders: bool,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        ConnectInfo {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: None,
            pass: None,
            jwt: None,
            nkey: None,
            sig: None,
            name: None,
            lang: "rust".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            protocol: 1,
            echo: true,
            headers: true,
            no_responders: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_tolerates_missing_fields() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"server_id":"a1","host":"127.0.0.1","port":4222,"max_payload":1048576,"proto":1,"headers":true}"#,
        )
        .unwrap();
        assert_eq!(info.server_id, "a1");
        assert_eq!(info.max_payload, 1048576);
        assert!(info.headers);
        assert!(!info.lame_duck_mode);
        assert!(info.connect_urls.is_empty());
    }

    #[test]
    fn info_reads_cluster_updates() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"server_id":"a1","connect_urls":["10.0.0.2:4222","10.0.0.3:4222"],"ldm":true}"#,
        )
        .unwrap();
        assert_eq!(info.connect_urls.len(), 2);
        assert!(info.lame_duck_mode);
    }

    #[test]
    fn connect_skips_unset_auth() {
        let connect = ConnectInfo::default();
        let json = serde_json::to_string(&connect).unwrap();
        assert!(!json.contains("auth_token"));
        assert!(!json.contains("user"));
        assert!(!json.contains("nkey"));
        assert!(json.contains(r#""protocol":1"#));
        assert!(json.contains(r#""echo":true"#));
    }
}
