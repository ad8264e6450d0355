//! Wire protocol spoken with the remote audio service
//!
//! Every text frame carries a JSON array of messages tagged by `type`, e.g.
//! `[{"type":"status","id":"…","status":"ONLINE"},{"type":"heartbeat"}]`.

use serde::{Deserialize, Serialize};

use crate::audio::rules::DelayRange;
use crate::config::TrackSettings;
use crate::EntityId;

/// Messages exchanged in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Player presence
    Status(StatusMessage),
    /// Audio directive for one track of a player
    Audio(AudioMessage),
    /// Playback settings of a track
    TrackMeta(TrackMetaMessage),
    /// Liveness probe, echoed back
    Heartbeat,
    /// Presence change sent by older remote services
    Command(CommandMessage),
    /// Audio sources added to or removed from the remote library
    AudioList(AudioListMessage),
    /// Any type this client does not understand
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn status(id: EntityId, status: PlayerStatus) -> Self {
        Message::Status(StatusMessage { id, status })
    }

    pub fn track_meta(id: EntityId, track: &str, settings: &TrackSettings) -> Self {
        Message::TrackMeta(TrackMetaMessage {
            id,
            track: track.to_string(),
            default_track: settings.default,
            repeating: settings.repeating,
            random: settings.random,
            fading: settings.fading,
        })
    }

    /// Tag name as it appears on the wire
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Status(_) => "status",
            Message::Audio(_) => "audio",
            Message::TrackMeta(_) => "track-meta",
            Message::Heartbeat => "heartbeat",
            Message::Command(_) => "command",
            Message::AudioList(_) => "audio-list",
            Message::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub id: EntityId,
    pub status: PlayerStatus,
}

/// Full state of one track; absent fields mean "unchanged"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMessage {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// An empty list means "stop all audio on the track"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_range: Option<DelayRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetaMessage {
    pub id: EntityId,
    pub track: String,
    pub default_track: bool,
    pub repeating: bool,
    pub random: bool,
    pub fading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub id: EntityId,
    pub command: CommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioListMessage {
    pub action: ListAction,
    #[serde(default)]
    pub audio_ids: Vec<String>,
}

/// Encode a batch of messages into one text frame
pub fn encode(messages: &[Message]) -> Result<String, EncodeError> {
    serde_json::to_string(messages).map_err(|e| EncodeError(e.to_string()))
}

/// Decode a text frame; a single bare object is accepted as a one-message batch
pub fn decode(frame: &str) -> Result<Vec<Message>, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(frame).map_err(|e| DecodeError(e.to_string()))?;
    if value.is_array() {
        serde_json::from_value(value).map_err(|e| DecodeError(e.to_string()))
    } else {
        serde_json::from_value(value)
            .map(|message| vec![message])
            .map_err(|e| DecodeError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_encode_status_and_heartbeat() {
        let id = Uuid::nil();
        let frame = encode(&[Message::status(id, PlayerStatus::Online), Message::Heartbeat]).unwrap();
        assert_eq!(
            frame,
            r#"[{"type":"status","id":"00000000-0000-0000-0000-000000000000","status":"ONLINE"},{"type":"heartbeat"}]"#
        );
    }

    #[test]
    fn test_encode_audio_omits_absent_fields() {
        let msg = Message::Audio(AudioMessage {
            id: Uuid::nil(),
            track: Some("default".to_string()),
            audio_ids: Some(vec!["forest".to_string()]),
            delay_range: None,
        });
        let frame = encode(&[msg]).unwrap();
        assert!(frame.contains(r#""type":"audio""#));
        assert!(frame.contains(r#""audioIds":["forest"]"#));
        assert!(!frame.contains("delayRange"));
    }

    #[test]
    fn test_encode_emptied_track_keeps_audio_ids() {
        let msg = Message::Audio(AudioMessage {
            id: Uuid::nil(),
            track: Some("default".to_string()),
            audio_ids: Some(Vec::new()),
            delay_range: None,
        });
        let frame = encode(&[msg]).unwrap();
        assert!(frame.contains(r#""audioIds":[]"#));
    }

    #[test]
    fn test_encode_track_meta() {
        let settings = TrackSettings {
            default: true,
            repeating: true,
            random: false,
            fading: true,
        };
        let frame = encode(&[Message::track_meta(Uuid::nil(), "music", &settings)]).unwrap();
        assert!(frame.contains(r#""type":"track-meta""#));
        assert!(frame.contains(r#""defaultTrack":true"#));
        assert!(frame.contains(r#""random":false"#));
    }

    #[test]
    fn test_decode_batch() {
        let id = Uuid::new_v4();
        let frame = format!(
            r#"[{{"type":"status","id":"{id}","status":"OFFLINE"}},
                {{"type":"command","id":"{id}","command":"ADD"}},
                {{"type":"audio-list","action":"ADD","audioIds":["a","b"]}},
                {{"type":"audio","id":"{id}","delayRange":{{"min":1,"max":4}}}}]"#
        );
        let messages = decode(&frame).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::status(id, PlayerStatus::Offline));
        assert_eq!(
            messages[1],
            Message::Command(CommandMessage { id, command: CommandKind::Add })
        );
        match &messages[2] {
            Message::AudioList(list) => {
                assert_eq!(list.action, ListAction::Add);
                assert_eq!(list.audio_ids, vec!["a", "b"]);
            }
            other => panic!("Wrong message type: {other:?}"),
        }
        match &messages[3] {
            Message::Audio(audio) => {
                assert!(audio.track.is_none());
                assert_eq!(audio.delay_range, Some(DelayRange { min: 1, max: 4 }));
            }
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let messages = decode(r#"[{"type":"volume"},{"type":"heartbeat"}]"#).unwrap();
        assert_eq!(messages, vec![Message::Unknown, Message::Heartbeat]);
    }

    #[test]
    fn test_decode_single_object() {
        let messages = decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(messages, vec![Message::Heartbeat]);
    }

    #[test]
    fn test_decode_errors() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"[{"type":"status","id":"nope","status":"ONLINE"}]"#).is_err());
        assert!(decode(r#"[{"type":"status","id":"00000000-0000-0000-0000-000000000000","status":"AWAY"}]"#).is_err());
    }
}
