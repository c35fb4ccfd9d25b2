//! The protocol envelope exchanged over the broker.
//!
//! On the wire an envelope is the JSON object `{msg_type, data, context}`.
//! `context` carries the routing information the Correlator relies on; its
//! keys serialize in declaration order and anything the remote side adds is
//! kept in [`RoutingContext::extra`] so a round trip loses nothing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::SessionId;
use crate::reply::ReplyKind;

/// Structured unit exchanged over the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub context: RoutingContext,
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>, data: Map<String, Value>, context: RoutingContext) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            context,
        }
    }

    /// Classify this envelope as a reply arriving on the response channel.
    pub fn reply_kind(&self) -> ReplyKind {
        ReplyKind::classify(&self.msg_type)
    }
}

/// Routing sub-object; the key is fixed by the remote protocol.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTag {
    #[serde(default)]
    pub routing_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionTag {
    pub session_id: SessionId,
}

/// Client-side timing hints echoed back by the service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// Seconds the request spent queued behind the session's previous request.
    pub wait_in_queue: f64,
    /// Epoch seconds at which the request was handed to the broker.
    pub client_sent: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingContext {
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_profiles: Vec<Value>,
    #[serde(rename = "klat_data", default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoutingContext {
    /// Routing identity of the audience the original request targeted.
    ///
    /// Replies echo it under `klat_data.routing_key`; error replies may carry
    /// it at the top level as `routing_key` instead.
    pub fn target_identity(&self) -> Option<&str> {
        self.routing
            .as_ref()
            .map(|tag| tag.routing_key.as_str())
            .filter(|key| !key.is_empty())
            .or_else(|| self.extra.get("routing_key").and_then(Value::as_str))
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|tag| &tag.session_id)
    }

    /// The echoed request ident, if the service kept it.
    pub fn request_ident(&self) -> Option<&str> {
        Some(self.ident.as_str()).filter(|ident| !ident.is_empty())
    }
}
