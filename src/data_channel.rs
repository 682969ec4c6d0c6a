use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use webrtc::data_channel::RTCDataChannel;

use crate::{error::Error, forwarder::ForwarderStats};

/// JSON messages exchanged with a client over its control data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Size the client renders a video track at.
    VideoSize {
        track_id: String,
        width: u32,
        height: u32,
    },
    /// A request carries no forwarders; the reply carries the snapshot.
    Stats {
        #[serde(default)]
        forwarders: Vec<ForwarderStats>,
    },
    VadStarted {
        ssrc: u32,
        client_id: String,
    },
    VadEnded {
        ssrc: u32,
        client_id: String,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Destination of messages sent to a client.
#[async_trait]
pub trait MessageSink: Send + Sync + Debug {
    async fn send(&self, message: &ClientMessage) -> Result<(), Error>;
}

/// [`MessageSink`] over a webrtc-rs data channel.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DataChannelSink {
    #[derivative(Debug = "ignore")]
    channel: Arc<RTCDataChannel>,
}

impl DataChannelSink {
    pub fn new(channel: Arc<RTCDataChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl MessageSink for DataChannelSink {
    async fn send(&self, message: &ClientMessage) -> Result<(), Error> {
        let text = message.to_json()?;
        self.channel.send_text(text).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::ErrorKind;

    /// Sink keeping every message it is given.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMessageSink {
        pub(crate) messages: Mutex<Vec<ClientMessage>>,
    }

    impl RecordingMessageSink {
        pub(crate) fn taken(&self) -> Vec<ClientMessage> {
            self.messages
                .lock()
                .map(|mut messages| std::mem::take(&mut *messages))
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingMessageSink {
        async fn send(&self, message: &ClientMessage) -> Result<(), Error> {
            if let Ok(mut messages) = self.messages.lock() {
                messages.push(message.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn messages_use_snake_case_type_tags() {
        let message = ClientMessage::parse(r#"{"type":"video_size","track_id":"cam","width":640,"height":360}"#)
            .expect("video_size");
        assert_eq!(
            message,
            ClientMessage::VideoSize {
                track_id: "cam".to_owned(),
                width: 640,
                height: 360
            }
        );

        let request = ClientMessage::parse(r#"{"type":"stats"}"#).expect("stats");
        assert_eq!(request, ClientMessage::Stats { forwarders: vec![] });

        let started = ClientMessage::VadStarted {
            ssrc: 7,
            client_id: "alice".to_owned(),
        };
        assert_eq!(
            started.to_json().expect("json"),
            r#"{"type":"vad_started","ssrc":7,"client_id":"alice"}"#
        );
    }

    #[test]
    fn unknown_message_is_a_json_error() {
        let err = ClientMessage::parse(r#"{"type":"dance"}"#).expect_err("unknown type");
        assert_eq!(err.kind, ErrorKind::Json);
    }
}
