//! Connectivity Channel Protocol
//!
//! Binary Protobuf frames exchanged over the connectivity channel. Every
//! frame carries exactly one payload variant; a frame without one is
//! rejected at decode time.

use prost::Message;

/// Wire envelope
#[derive(Clone, PartialEq, Message)]
pub struct WsMessage {
    #[prost(oneof = "ws_message::Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<ws_message::Payload>,
}

pub mod ws_message {
    /// Envelope payload
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        PingMessage(super::PingMessage),
        #[prost(message, tag = "2")]
        ConnectivityInfoMessage(super::ConnectivityInfoMessage),
        #[prost(message, tag = "3")]
        ErrorMessage(super::ErrorMessage),
        #[prost(message, tag = "4")]
        SettingsMessage(super::SettingsMessage),
    }
}

/// Application-level ping; the server echoes it back unchanged
#[derive(Clone, PartialEq, Message)]
pub struct PingMessage {
    #[prost(uint64, tag = "1")]
    pub request_time: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub token: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub application_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectivityInfoMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub token: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub bytes_downloaded: u64,
    #[prost(uint64, tag = "3")]
    pub bytes_uploaded: u64,
    #[prost(bool, tag = "4")]
    pub refresh_tokens: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorMessage {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub payload: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SettingsMessage {
    #[prost(string, tag = "1")]
    pub dns_server: String,
}

/// Decoded channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Ping {
        request_time: u64,
        token: Vec<u8>,
        application_id: Vec<u8>,
    },
    ConnectivityInfo {
        token: Vec<u8>,
        bytes_downloaded: u64,
        bytes_uploaded: u64,
        refresh_tokens: bool,
    },
    Error {
        code: String,
        payload: String,
    },
    Settings {
        dns_server: String,
    },
}

impl ChannelMessage {
    pub fn encode(&self) -> Vec<u8> {
        use ws_message::Payload;

        let payload = match self.clone() {
            ChannelMessage::Ping {
                request_time,
                token,
                application_id,
            } => Payload::PingMessage(PingMessage {
                request_time,
                token,
                application_id,
            }),
            ChannelMessage::ConnectivityInfo {
                token,
                bytes_downloaded,
                bytes_uploaded,
                refresh_tokens,
            } => Payload::ConnectivityInfoMessage(ConnectivityInfoMessage {
                token,
                bytes_downloaded,
                bytes_uploaded,
                refresh_tokens,
            }),
            ChannelMessage::Error { code, payload } => {
                Payload::ErrorMessage(ErrorMessage { code, payload })
            }
            ChannelMessage::Settings { dns_server } => {
                Payload::SettingsMessage(SettingsMessage { dns_server })
            }
        };

        WsMessage {
            payload: Some(payload),
        }
        .encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        use ws_message::Payload;

        let message = WsMessage::decode(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        match message.payload.ok_or(ProtocolError::EmptyPayload)? {
            Payload::PingMessage(m) => Ok(ChannelMessage::Ping {
                request_time: m.request_time,
                token: m.token,
                application_id: m.application_id,
            }),
            Payload::ConnectivityInfoMessage(m) => Ok(ChannelMessage::ConnectivityInfo {
                token: m.token,
                bytes_downloaded: m.bytes_downloaded,
                bytes_uploaded: m.bytes_uploaded,
                refresh_tokens: m.refresh_tokens,
            }),
            Payload::ErrorMessage(m) => Ok(ChannelMessage::Error {
                code: m.code,
                payload: m.payload,
            }),
            Payload::SettingsMessage(m) => Ok(ChannelMessage::Settings {
                dns_server: m.dns_server,
            }),
        }
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Frame has no payload")]
    EmptyPayload,
}
