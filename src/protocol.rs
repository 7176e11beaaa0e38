use serde::{Deserialize, Serialize};

/// Control events sent to the realtime endpoint.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend {
        /// Base64 of little-endian PCM16
        audio: String,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

// 会话参数，未设置的字段不会序列化
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ClientEvent {
    pub fn session_update(voice: impl Into<String>, instructions: impl Into<String>) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionSettings {
                voice: Some(voice.into()),
                instructions: Some(instructions.into()),
            },
        }
    }

    pub fn voice_update(voice: impl Into<String>) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionSettings {
                voice: Some(voice.into()),
                instructions: None,
            },
        }
    }

    pub fn instructions_update(instructions: impl Into<String>) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionSettings {
                voice: None,
                instructions: Some(instructions.into()),
            },
        }
    }

    pub fn audio_append(base64_pcm: impl Into<String>) -> Self {
        ClientEvent::InputAudioAppend {
            audio: base64_pcm.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Envelope of events pushed by the realtime endpoint. Only the fields the
/// link acts on are parsed.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Base64 audio for `response.*audio.delta`
    pub delta: Option<String>,
    pub error: Option<ServerError>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerError {
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl ServerEvent {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_audio_delta(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "response.audio.delta" | "response.output_audio.delta"
        )
    }

    pub fn is_error(&self) -> bool {
        self.event_type == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn as_json(event: &ClientEvent) -> Value {
        serde_json::from_str(&event.encode().unwrap()).unwrap()
    }

    #[test]
    fn session_update_shape() {
        let event = ClientEvent::session_update("alloy", "Translate to English");
        assert_eq!(
            as_json(&event),
            json!({
                "type": "session.update",
                "session": {"voice": "alloy", "instructions": "Translate to English"}
            })
        );
    }

    #[test]
    fn partial_updates_omit_unset_fields() {
        assert_eq!(
            as_json(&ClientEvent::voice_update("verse")),
            json!({"type": "session.update", "session": {"voice": "verse"}})
        );
        assert_eq!(
            as_json(&ClientEvent::instructions_update("be brief")),
            json!({"type": "session.update", "session": {"instructions": "be brief"}})
        );
    }

    #[test]
    fn audio_and_cancel_shape() {
        assert_eq!(
            as_json(&ClientEvent::audio_append("AAEC")),
            json!({"type": "input_audio_buffer.append", "audio": "AAEC"})
        );
        assert_eq!(ClientEvent::ResponseCancel.encode().unwrap(), r#"{"type":"response.cancel"}"#);
    }

    #[test]
    fn server_events() {
        let delta = ServerEvent::parse(r#"{"type":"response.output_audio.delta","delta":"AQI=","item_id":"x"}"#).unwrap();
        assert!(delta.is_audio_delta());
        assert_eq!(delta.delta.as_deref(), Some("AQI="));

        let err = ServerEvent::parse(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#).unwrap();
        assert!(err.is_error());
        assert_eq!(err.error.unwrap().message.as_deref(), Some("bad"));
    }
}
