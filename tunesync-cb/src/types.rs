//! Wire types for provider callbacks and core domain enums

use serde::{Deserialize, Serialize};

/// Stage reported by the provider for a generation task.
///
/// Stages arrive at-least-once and possibly out of order; `Error` is
/// reachable from any state. Unrecognized future stages deserialize to
/// `Unknown` and are treated as stage markers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackType {
    Text,
    First,
    Complete,
    Error,
    #[serde(other)]
    Unknown,
}

impl CallbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackType::Text => "text",
            CallbackType::First => "first",
            CallbackType::Complete => "complete",
            CallbackType::Error => "error",
            CallbackType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CallbackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation callback envelope: `{code, msg, data: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<CallbackData>,
}

impl CallbackEnvelope {
    pub fn task_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.task_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn callback_type(&self) -> CallbackType {
        self.data
            .as_ref()
            .and_then(|d| d.callback_type)
            .unwrap_or(CallbackType::Unknown)
    }

    /// Provider-reported failure: HTTP-style code >= 400 is always
    /// terminal, whatever the declared callback type.
    pub fn is_provider_error(&self) -> bool {
        self.code.is_some_and(|c| c >= 400) || self.callback_type() == CallbackType::Error
    }
}

/// Inner callback data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackData {
    #[serde(default, alias = "taskId")]
    pub task_id: Option<String>,
    #[serde(default, rename = "callbackType")]
    pub callback_type: Option<CallbackType>,
    /// Variant array; absent or null on stage-marker-only callbacks
    #[serde(default)]
    pub data: Option<Vec<CallbackVariant>>,
}

/// One candidate result among several for a task. Index 0 is primary.
///
/// Field names follow the provider's snake_case payloads with camelCase
/// aliases for the older wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackVariant {
    /// Provider-side clip/variant id
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "audioUrl")]
    pub audio_url: Option<String>,
    /// Time-limited preview URL, available before the full render
    #[serde(default, alias = "streamAudioUrl")]
    pub stream_audio_url: Option<String>,
    #[serde(default, alias = "imageUrl")]
    pub image_url: Option<String>,
    #[serde(default, alias = "videoUrl")]
    pub video_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    /// Lyrics text as echoed back by the provider
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl CallbackVariant {
    /// URL to make playable right now: prefer the streaming preview,
    /// fall back to the full audio URL.
    pub fn immediate_url(&self) -> Option<&str> {
        self.stream_audio_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.audio_url.as_deref().filter(|s| !s.is_empty()))
    }

    /// Best source for the durable upload: the full render when present,
    /// else the preview.
    pub fn upload_source_url(&self) -> Option<&str> {
        self.audio_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.stream_audio_url.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Track lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Pending => "pending",
            TrackStatus::Processing => "processing",
            TrackStatus::Completed => "completed",
            TrackStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TrackStatus::Pending),
            "processing" => Some(TrackStatus::Processing),
            "completed" => Some(TrackStatus::Completed),
            "failed" => Some(TrackStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never left by callback processing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackStatus::Completed | TrackStatus::Failed)
    }
}

impl std::fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_snake_case() {
        let envelope: CallbackEnvelope = serde_json::from_value(json!({
            "code": 200,
            "msg": "success",
            "data": {
                "callbackType": "first",
                "task_id": "t1",
                "data": [{
                    "id": "c0",
                    "audio_url": "a0.mp3",
                    "stream_audio_url": "s0.mp3",
                    "image_url": "i0.jpg",
                    "duration": 120.5
                }]
            }
        }))
        .unwrap();

        assert_eq!(envelope.task_id(), Some("t1"));
        assert_eq!(envelope.callback_type(), CallbackType::First);
        assert!(!envelope.is_provider_error());

        let variants = envelope.data.unwrap().data.unwrap();
        assert_eq!(variants[0].immediate_url(), Some("s0.mp3"));
        assert_eq!(variants[0].upload_source_url(), Some("a0.mp3"));
    }

    #[test]
    fn test_envelope_camel_case_aliases() {
        let envelope: CallbackEnvelope = serde_json::from_value(json!({
            "code": 200,
            "data": {
                "callbackType": "complete",
                "taskId": "t2",
                "data": [{"audioUrl": "a.mp3", "imageUrl": "i.jpg"}]
            }
        }))
        .unwrap();

        assert_eq!(envelope.task_id(), Some("t2"));
        let variants = envelope.data.unwrap().data.unwrap();
        assert_eq!(variants[0].audio_url.as_deref(), Some("a.mp3"));
        assert_eq!(variants[0].image_url.as_deref(), Some("i.jpg"));
    }

    #[test]
    fn test_error_detection() {
        let by_code: CallbackEnvelope = serde_json::from_value(json!({
            "code": 451,
            "msg": "moderated",
            "data": {"callbackType": "first", "task_id": "t"}
        }))
        .unwrap();
        assert!(by_code.is_provider_error());

        let by_type: CallbackEnvelope = serde_json::from_value(json!({
            "code": 200,
            "data": {"callbackType": "error", "task_id": "t"}
        }))
        .unwrap();
        assert!(by_type.is_provider_error());
    }

    #[test]
    fn test_unknown_stage_tolerated() {
        let envelope: CallbackEnvelope = serde_json::from_value(json!({
            "code": 200,
            "data": {"callbackType": "preview", "task_id": "t"}
        }))
        .unwrap();
        assert_eq!(envelope.callback_type(), CallbackType::Unknown);
    }

    #[test]
    fn test_immediate_url_skips_empty_strings() {
        let variant = CallbackVariant {
            stream_audio_url: Some(String::new()),
            audio_url: Some("a.mp3".to_string()),
            ..Default::default()
        };
        assert_eq!(variant.immediate_url(), Some("a.mp3"));
    }

    #[test]
    fn test_terminal_status() {
        assert!(TrackStatus::Completed.is_terminal());
        assert!(TrackStatus::Failed.is_terminal());
        assert!(!TrackStatus::Processing.is_terminal());
        assert_eq!(TrackStatus::parse("processing"), Some(TrackStatus::Processing));
        assert_eq!(TrackStatus::parse("bogus"), None);
    }
}
