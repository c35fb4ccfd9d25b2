//! Outbound requests and the outcomes callers get back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_core::codec::encode_binary;
use iris_core::reply::{self, response_type_for};
use serde_json::{json, Map, Value};

/// A request a session can submit.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Utterance { text: String, lang: String },
    /// Spoken input; `audio` is base64.
    Audio { audio: String, lang: String },
    /// Transcribe audio without running skills.
    Stt { audio: String, lang: String },
    /// Synthesize speech for `text`.
    Tts { text: String, lang: String, gender: String },
}

/// Which reply completes a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expectation {
    /// `klat.response` or `complete.intent.failure`.
    Chat,
    /// A specific `<type>.response`.
    Api(String),
}

impl Request {
    pub fn utterance(text: impl Into<String>, lang: impl Into<String>) -> Self {
        Self::Utterance {
            text: text.into(),
            lang: lang.into(),
        }
    }

    pub fn audio(bytes: &[u8], lang: impl Into<String>) -> Self {
        Self::Audio {
            audio: encode_binary(bytes),
            lang: lang.into(),
        }
    }

    pub fn stt(bytes: &[u8], lang: impl Into<String>) -> Self {
        Self::Stt {
            audio: encode_binary(bytes),
            lang: lang.into(),
        }
    }

    pub fn tts(text: impl Into<String>, lang: impl Into<String>) -> Self {
        Self::Tts {
            text: text.into(),
            lang: lang.into(),
            gender: "female".into(),
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Utterance { .. } => reply::UTTERANCE,
            Self::Audio { .. } => reply::AUDIO_INPUT,
            Self::Stt { .. } => reply::GET_STT,
            Self::Tts { .. } => reply::GET_TTS,
        }
    }

    pub fn expects(&self) -> Expectation {
        match self {
            Self::Utterance { .. } | Self::Audio { .. } => Expectation::Chat,
            Self::Stt { .. } | Self::Tts { .. } => Expectation::Api(response_type_for(self.msg_type())),
        }
    }

    pub fn lang(&self) -> &str {
        match self {
            Self::Utterance { lang, .. }
            | Self::Audio { lang, .. }
            | Self::Stt { lang, .. }
            | Self::Tts { lang, .. } => lang,
        }
    }

    /// The `data` object sent on the wire.
    pub fn payload(&self) -> Map<String, Value> {
        let value = match self {
            Self::Utterance { text, lang } => json!({
                "utterances": [text],
                "lang": lang,
            }),
            Self::Audio { audio, lang } => json!({
                "lang": lang,
                "audio_data": audio,
            }),
            Self::Stt { audio, lang } => json!({
                "audio_data": audio,
                "utterances": [""],
                "lang": lang,
            }),
            Self::Tts { text, lang, gender } => json!({
                "text": text,
                "utterance": text,
                "utterances": [""],
                "speaker": {"name": "Neon", "language": lang, "gender": gender},
                "lang": lang,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Short human description, used in "no response" messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Utterance { text, .. } | Self::Tts { text, .. } => text.clone(),
            Self::Audio { audio, .. } | Self::Stt { audio, .. } => {
                format!("<{} bytes of audio>", audio.len() / 4 * 3)
            }
        }
    }
}

/// Speech produced for one language of a completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LangResponse {
    pub lang: String,
    pub sentence: String,
    pub artifacts: Vec<PathBuf>,
}

/// A completed chat request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatReply {
    pub responses: Vec<LangResponse>,
    /// What the service heard, for audio input.
    pub transcript: Option<String>,
}

impl ChatReply {
    pub fn sentences(&self) -> Vec<&str> {
        self.responses.iter().map(|r| r.sentence.as_str()).collect()
    }

    pub fn artifacts(&self) -> Vec<&Path> {
        self.responses
            .iter()
            .flat_map(|r| r.artifacts.iter().map(PathBuf::as_path))
            .collect()
    }

    /// All sentences joined one per line.
    pub fn text(&self) -> String {
        self.sentences().join("\n")
    }
}

/// Raw reply to an API request, or an error reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiReply {
    pub msg_type: String,
    pub data: Map<String, Value>,
}

impl ApiReply {
    /// First entry of `data.transcripts`, as returned by STT.
    pub fn transcript(&self) -> Option<&str> {
        self.data
            .get("transcripts")
            .and_then(Value::as_array)
            .and_then(|t| t.first())
            .and_then(Value::as_str)
    }
}

/// How a submitted request ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Response(ChatReply),
    /// The service understood the request but no skill handled it.
    NoIntentMatch,
    Api(ApiReply),
    /// The service answered on the error queue.
    Error(ApiReply),
    /// No matching reply arrived in time. The session stays usable.
    TimedOut { after: Duration },
}

impl Outcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Response(_) => "response",
            Self::NoIntentMatch => "no_intent_match",
            Self::Api(_) => "api",
            Self::Error(_) => "error",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}
