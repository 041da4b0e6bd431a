//! # Socket.IO Packet Codec
//!
//! Text framing for Socket.IO v4 running on Engine.IO v4 over a websocket.
//! Every websocket text frame is one Engine.IO packet; Engine.IO `message`
//! packets (`4...`) carry one Socket.IO packet.
//!
//! ## Engine.IO packet types:
//! `0` open, `1` close, `2` ping, `3` pong, `4` message, `5` upgrade, `6` noop
//!
//! ## Socket.IO packet layout:
//! ```text
//! <type>[<attachments>-][/<namespace>,][<ack id>][<json>]
//! ```
//! Types: `0` connect, `1` disconnect, `2` event, `3` ack, `4` connect error,
//! `5` binary event, `6` binary ack. Binary packets announce how many raw
//! websocket binary frames follow them.
//!
//! Only the default namespace is used; a namespace prefix on inbound packets
//! is accepted and ignored.

use crate::error::{AppError, AppResult};
use serde_json::{json, Value};

/// One Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    /// Handshake data (`sid`, `pingInterval`, `pingTimeout`, ...)
    Open(Value),
    Close,
    Ping(String),
    Pong(String),
    /// Socket.IO packet text
    Message(String),
    Upgrade,
    Noop,
}

/// One Socket.IO packet, with event arguments split into name and first payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Value),
    Disconnect,
    Event {
        ack_id: Option<u64>,
        name: String,
        payload: Value,
    },
    Ack {
        ack_id: u64,
        payload: Value,
    },
    ConnectError(Value),
    BinaryEvent {
        attachments: usize,
        ack_id: Option<u64>,
        name: String,
        payload: Value,
    },
    BinaryAck {
        attachments: usize,
        ack_id: u64,
        payload: Value,
    },
}

fn protocol(msg: impl Into<String>) -> AppError {
    AppError::Protocol(msg.into())
}

/// Decode one Engine.IO text frame.
pub fn decode_engine(text: &str) -> AppResult<EnginePacket> {
    let kind = *text
        .as_bytes()
        .first()
        .ok_or_else(|| protocol("empty engine.io packet"))?;
    if !kind.is_ascii() {
        return Err(protocol(format!("unknown engine.io packet type in {:?}", text)));
    }
    let rest = &text[1..];

    let packet = match kind {
        b'0' => EnginePacket::Open(serde_json::from_str(rest)?),
        b'1' => EnginePacket::Close,
        b'2' => EnginePacket::Ping(rest.to_string()),
        b'3' => EnginePacket::Pong(rest.to_string()),
        b'4' => EnginePacket::Message(rest.to_string()),
        b'5' => EnginePacket::Upgrade,
        b'6' => EnginePacket::Noop,
        _ => return Err(protocol(format!("unknown engine.io packet type in {:?}", text))),
    };
    Ok(packet)
}

/// Decode one Socket.IO packet (the body of an Engine.IO message).
pub fn decode_socket(text: &str) -> AppResult<SocketPacket> {
    let bytes = text.as_bytes();
    let kind = *bytes
        .first()
        .ok_or_else(|| protocol("empty socket.io packet"))?;
    if !kind.is_ascii_digit() {
        return Err(protocol(format!("unknown socket.io packet type in {:?}", text)));
    }
    let mut pos = 1;

    let attachments = if matches!(kind, b'5' | b'6') {
        let start = pos;
        while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'-') {
            return Err(protocol(format!("binary packet without attachment count: {:?}", text)));
        }
        let count = text[start..pos]
            .parse()
            .map_err(|_| protocol(format!("bad attachment count in {:?}", text)))?;
        pos += 1;
        count
    } else {
        0
    };

    if bytes.get(pos) == Some(&b'/') {
        pos = match text[pos..].find(',') {
            Some(comma) => pos + comma + 1,
            None => bytes.len(),
        };
    }

    let id_start = pos;
    while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
        pos += 1;
    }
    let ack_id = if pos > id_start {
        Some(
            text[id_start..pos]
                .parse::<u64>()
                .map_err(|_| protocol(format!("bad ack id in {:?}", text)))?,
        )
    } else {
        None
    };

    let data: Value = if pos < bytes.len() {
        serde_json::from_str(&text[pos..])?
    } else {
        Value::Null
    };

    let packet = match kind {
        b'0' => SocketPacket::Connect(data),
        b'1' => SocketPacket::Disconnect,
        b'2' => {
            let (name, payload) = split_event(data)?;
            SocketPacket::Event {
                ack_id,
                name,
                payload,
            }
        }
        b'3' => SocketPacket::Ack {
            ack_id: ack_id.ok_or_else(|| protocol("ack without id"))?,
            payload: first_arg(data),
        },
        b'4' => SocketPacket::ConnectError(data),
        b'5' => {
            let (name, payload) = split_event(data)?;
            SocketPacket::BinaryEvent {
                attachments,
                ack_id,
                name,
                payload,
            }
        }
        b'6' => SocketPacket::BinaryAck {
            attachments,
            ack_id: ack_id.ok_or_else(|| protocol("binary ack without id"))?,
            payload: first_arg(data),
        },
        _ => return Err(protocol(format!("unknown socket.io packet type in {:?}", text))),
    };
    Ok(packet)
}

fn split_event(data: Value) -> AppResult<(String, Value)> {
    let Value::Array(mut args) = data else {
        return Err(protocol("event arguments must be an array"));
    };
    if args.is_empty() {
        return Err(protocol("event without a name"));
    }
    let name = match args.remove(0) {
        Value::String(name) => name,
        other => return Err(protocol(format!("event name must be a string, got {}", other))),
    };
    let payload = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
    Ok((name, payload))
}

fn first_arg(data: Value) -> Value {
    match data {
        Value::Array(mut args) if !args.is_empty() => args.swap_remove(0),
        Value::Array(_) => Value::Null,
        other => other,
    }
}

/// Engine.IO pong answering a server ping.
pub fn encode_pong(data: &str) -> String {
    format!("3{}", data)
}

/// Socket.IO connect to the default namespace with an auth payload.
pub fn encode_connect(auth: &Value) -> String {
    format!("40{}", auth)
}

/// Socket.IO event, with an ack id when the sender wants an acknowledgment.
pub fn encode_event(name: &str, payload: &Value, ack_id: Option<u64>) -> String {
    let id = ack_id.map(|id| id.to_string()).unwrap_or_default();
    format!("42{}{}", id, json!([name, payload]))
}

/// Socket.IO binary event; `attachments` binary frames must follow it.
pub fn encode_binary_event(
    name: &str,
    payload: &Value,
    attachments: usize,
    ack_id: Option<u64>,
) -> String {
    let id = ack_id.map(|id| id.to_string()).unwrap_or_default();
    format!("45{}-{}{}", attachments, id, json!([name, payload]))
}

/// Socket.IO acknowledgment of an event the server sent with an ack id.
pub fn encode_ack(ack_id: u64, args: &[Value]) -> String {
    format!("43{}{}", ack_id, Value::Array(args.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_engine_open_and_ping() {
        let open = decode_engine(r#"0{"sid":"abc","pingInterval":25000,"pingTimeout":20000}"#).unwrap();
        match open {
            EnginePacket::Open(info) => assert_eq!(info["sid"], "abc"),
            other => panic!("unexpected packet: {other:?}"),
        }
        assert_eq!(decode_engine("2").unwrap(), EnginePacket::Ping(String::new()));
        assert_eq!(
            decode_engine(r#"42["hangup",{}]"#).unwrap(),
            EnginePacket::Message(r#"2["hangup",{}]"#.to_string())
        );
        assert!(decode_engine("").is_err());
        assert!(decode_engine("9").is_err());
    }

    #[test]
    fn test_decode_event() {
        let packet = decode_socket(r#"2["dialStatus",{"sessionId":"s1","status":"Connected"}]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                ack_id: None,
                name: "dialStatus".to_string(),
                payload: json!({ "sessionId": "s1", "status": "Connected" }),
            }
        );
    }

    #[test]
    fn test_decode_event_with_namespace_and_ack_id() {
        let packet = decode_socket(r#"2/calls,17["newSession",{"sessionId":"s1"}]"#).unwrap();
        match packet {
            SocketPacket::Event { ack_id, name, .. } => {
                assert_eq!(ack_id, Some(17));
                assert_eq!(name, "newSession");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_decode_ack_takes_first_argument() {
        let packet = decode_socket(r#"342[{"received":true}]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Ack {
                ack_id: 42,
                payload: json!({ "received": true }),
            }
        );
        assert!(decode_socket("3[]").is_err());
    }

    #[test]
    fn test_decode_binary_event() {
        let packet = decode_socket(
            r#"51-["audio",{"sessionId":"s1","audioData":{"_placeholder":true,"num":0}}]"#,
        )
        .unwrap();
        match packet {
            SocketPacket::BinaryEvent {
                attachments,
                ack_id,
                name,
                payload,
            } => {
                assert_eq!(attachments, 1);
                assert_eq!(ack_id, None);
                assert_eq!(name, "audio");
                assert_eq!(payload["sessionId"], "s1");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        assert!(decode_socket(r#"51["audio",{}]"#).is_err());
    }

    #[test]
    fn test_decode_connect_and_errors() {
        assert_eq!(
            decode_socket(r#"0{"sid":"xyz"}"#).unwrap(),
            SocketPacket::Connect(json!({ "sid": "xyz" }))
        );
        assert_eq!(decode_socket("1").unwrap(), SocketPacket::Disconnect);
        assert_eq!(
            decode_socket(r#"4{"message":"Not authorized"}"#).unwrap(),
            SocketPacket::ConnectError(json!({ "message": "Not authorized" }))
        );
        assert!(decode_socket(r#"2{"not":"an array"}"#).is_err());
    }

    #[test]
    fn test_encoders() {
        assert_eq!(encode_pong(""), "3");
        assert_eq!(encode_connect(&json!({ "token": "t" })), r#"40{"token":"t"}"#);
        assert_eq!(
            encode_event("joinRoom", &json!({ "sessionId": "s1" }), None),
            r#"42["joinRoom",{"sessionId":"s1"}]"#
        );
        assert_eq!(
            encode_binary_event("audio", &json!({ "sessionId": "s1" }), 1, Some(7)),
            r#"451-7["audio",{"sessionId":"s1"}]"#
        );
        assert_eq!(encode_ack(3, &[]), "433[]");
    }
}
