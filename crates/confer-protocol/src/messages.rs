use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{
    ClientId, ConsumerParams, DtlsParameters, MediaKind, ProducerId, RtpCapabilities,
    RtpParameters, TransportParams,
};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join (creating if needed) a named room
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        room_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_description: Option<String>,
    },

    /// Ask for the current room names, answered with `RoomsFetched`
    FetchRooms,

    /// Request expecting exactly one `Response` carrying the same id
    #[serde(rename_all = "camelCase")]
    Request { request_id: u64, request: Request },

    /// Ping to keep connection alive
    Ping,
}

impl ClientMessage {
    /// Decode one text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Request/response verbs of the signaling protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Request {
    GetRouterRtpCapabilities,

    #[serde(rename_all = "camelCase")]
    CreateProducerTransport {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_capabilities: Option<RtpCapabilities>,
    },

    CreateConsumerTransport,

    /// Producers in the caller's room, excluding `socket_id` (the caller if unset)
    #[serde(rename_all = "camelCase")]
    GetRoomProducers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<ClientId>,
    },

    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport { dtls_parameters: DtlsParameters },

    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport { dtls_parameters: DtlsParameters },

    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// `producer_id` is the publishing participant's id
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: ClientId,
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename_all = "camelCase")]
    Resume { producer_id: ClientId },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Request::CreateProducerTransport { .. } => "createProducerTransport",
            Request::CreateConsumerTransport => "createConsumerTransport",
            Request::GetRoomProducers { .. } => "getRoomProducers",
            Request::ConnectProducerTransport { .. } => "connectProducerTransport",
            Request::ConnectConsumerTransport { .. } => "connectConsumerTransport",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
            Request::Resume { .. } => "resume",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Request payload is well-formed but not acceptable (e.g. incompatible capabilities)
    Validation,
    /// The media engine rejected the operation
    Engine,
    /// A room, transport, producer or consumer does not exist
    NotFound,
    /// Request arrived before its prerequisite state
    ProtocolViolation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub error: String,
    pub kind: ErrorKind,
}

/// Payload of a `Response`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", content = "data", rename_all = "camelCase")]
pub enum Reply {
    RouterRtpCapabilities(RtpCapabilities),
    TransportCreated(TransportParams),
    RoomProducers(Vec<ClientId>),
    /// Acknowledges a transport connect
    Connected,
    Produced { id: ProducerId },
    Consumed(ConsumerParams),
    Resumed,
    Error(ErrorReply),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Sent once when the connection is accepted
    #[serde(rename_all = "camelCase")]
    Connected { socket_id: ClientId },

    #[serde(rename_all = "camelCase")]
    RoomsFetched { available_rooms: Vec<String> },

    /// Another participant in the room started producing
    #[serde(rename_all = "camelCase")]
    NewProducer {
        socket_id: ClientId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    #[serde(rename_all = "camelCase")]
    Response { request_id: u64, reply: Reply },

    /// Failure of a fire-and-forget event or an unparseable frame
    Error { message: String },

    /// Pong response to ping
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "request",
            "requestId": 4,
            "request": { "method": "resume", "data": { "producerId": "67e55044-10b1-426f-9247-bb680e5fe0c8" } }
        }))
        .unwrap();

        match msg {
            ClientMessage::Request { request_id, request } => {
                assert_eq!(request_id, 4);
                assert_eq!(request.method(), "resume");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame() {
        let err = ClientMessage::from_json(r#"{"type":"dance"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[test]
    fn test_unit_request_without_data() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "request",
            "requestId": 1,
            "request": { "method": "getRouterRtpCapabilities" }
        }))
        .unwrap();

        assert!(matches!(
            msg,
            ClientMessage::Request {
                request: Request::GetRouterRtpCapabilities,
                ..
            }
        ));
    }

    #[test]
    fn test_new_producer_wire_names() {
        let socket_id = uuid::Uuid::new_v4();
        let producer_id = uuid::Uuid::new_v4();
        let value = serde_json::to_value(ServerMessage::NewProducer {
            socket_id,
            producer_id,
            kind: MediaKind::Video,
        })
        .unwrap();

        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["socketId"], socket_id.to_string());
        assert_eq!(value["producerId"], producer_id.to_string());
        assert_eq!(value["kind"], "video");
    }

    #[test]
    fn test_error_reply_shape() {
        let value = serde_json::to_value(Reply::Error(ErrorReply {
            error: "cannot consume".to_string(),
            kind: ErrorKind::Validation,
        }))
        .unwrap();

        assert_eq!(value["reply"], "error");
        assert_eq!(value["data"]["error"], "cannot consume");
        assert_eq!(value["data"]["kind"], "validation");
    }
}
