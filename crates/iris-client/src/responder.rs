//! A stand-in service that answers requests over any broker adapter.
//!
//! It consumes the request queue and replies to the routing identity each
//! request was stamped with, echoing the request context back. Used by the
//! CLI loopback mode and the integration tests.

use std::sync::Arc;

use bytes::Bytes;
use iris_broker::{BrokerAdapter, BrokerConfig, BrokerConnection};
use iris_core::reply::{self, response_type_for};
use iris_core::{decode, decode_binary, encode, encode_binary, Envelope};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ClientError;

/// Samples of silence in generated audio (0.1 s at 16 kHz).
const SILENT_SAMPLES: u32 = 1600;

pub struct EchoResponder {
    connection: Arc<dyn BrokerConnection>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EchoResponder {
    pub async fn start(
        adapter: Arc<dyn BrokerAdapter>,
        config: &BrokerConfig,
        request_queue: &str,
    ) -> Result<Self, ClientError> {
        let connection = adapter.connect(config).await?;
        let mut requests = connection.subscribe(request_queue, request_queue, true).await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let connection = connection.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    let delivery = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = requests.recv() => match next {
                            Some(delivery) => delivery,
                            None => break,
                        },
                    };
                    let request = match decode(&delivery.body) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "responder got an undecodable request");
                            continue;
                        }
                    };
                    for (target, body) in answer(&request) {
                        if let Err(e) = connection.publish(&target, body).await {
                            warn!(error = %e, "responder failed to publish");
                        }
                    }
                }
                debug!("responder stopped");
            }
        });
        Ok(Self {
            connection,
            cancel,
            task,
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        self.connection.close().await;
    }
}

/// Replies to `request`, each with the queue or routing key to publish to.
pub fn answer(request: &Envelope) -> Vec<(String, Bytes)> {
    let Some(target) = request.context.target_identity().map(str::to_string) else {
        debug!(msg_type = %request.msg_type, "request without routing identity");
        return Vec::new();
    };
    let lang = request
        .data
        .get("lang")
        .and_then(Value::as_str)
        .unwrap_or("en-us")
        .to_string();

    let replies: Vec<(String, Value)> = match request.msg_type.as_str() {
        reply::UTTERANCE => {
            let text = request
                .data
                .get("utterances")
                .and_then(Value::as_array)
                .and_then(|u| u.first())
                .and_then(Value::as_str)
                .unwrap_or_default();
            vec![chat_reply(text, &lang)]
        }
        reply::AUDIO_INPUT => {
            let transcript = heard(&request.data);
            vec![
                (
                    response_type_for(reply::AUDIO_INPUT),
                    json!({"transcripts": [transcript.clone()], "lang": lang}),
                ),
                chat_reply(&transcript, &lang),
            ]
        }
        reply::GET_STT => vec![(
            response_type_for(reply::GET_STT),
            json!({"transcripts": [heard(&request.data)], "lang": lang}),
        )],
        reply::GET_TTS => {
            let text = request.data.get("text").and_then(Value::as_str).unwrap_or_default();
            vec![(
                response_type_for(reply::GET_TTS),
                json!({lang.clone(): {"sentence": text, "audio": {"female": encode_binary(&silent_wav())}}}),
            )]
        }
        other => {
            debug!(msg_type = other, "responder ignoring request");
            Vec::new()
        }
    };

    replies
        .into_iter()
        .filter_map(|(msg_type, data)| {
            let data = match data {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            match encode(&msg_type, &data, &request.context) {
                Ok(wire) => Some((target.clone(), Bytes::from(wire))),
                Err(e) => {
                    warn!(error = %e, "responder failed to encode reply");
                    None
                }
            }
        })
        .collect()
}

fn chat_reply(text: &str, lang: &str) -> (String, Value) {
    if !text.chars().any(char::is_alphanumeric) {
        return (reply::INTENT_FAILURE.to_string(), json!({}));
    }
    let sentence = format!("You said: {text}");
    let digest = Sha256::digest(sentence.as_bytes());
    let server_path = format!("/var/cache/neon/tts/{lang}/female/{digest:x}.wav");
    (
        reply::COMPLETION.to_string(),
        json!({"responses": {lang: {
            "sentence": sentence,
            "audio": {"female": encode_binary(&silent_wav())},
            "female": server_path,
        }}}),
    )
}

/// A made-up transcript naming how much audio arrived.
fn heard(data: &Map<String, Value>) -> String {
    let bytes = data
        .get("audio_data")
        .and_then(Value::as_str)
        .and_then(|audio| decode_binary(audio).ok())
        .map(|audio| audio.len())
        .unwrap_or_default();
    format!("{bytes} bytes of audio")
}

/// Mono 16-bit 16 kHz PCM WAV of silence.
fn silent_wav() -> Vec<u8> {
    let data_len = SILENT_SAMPLES * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&16_000u32.to_le_bytes());
    wav.extend_from_slice(&32_000u32.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}
