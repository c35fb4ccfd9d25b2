//! Shared types for the Iris broker client: identifiers, the wire envelope,
//! the message codec, reply classification and user profiles.

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod profile;
pub mod reply;

pub use codec::{decode, decode_binary, encode, encode_binary, encode_envelope};
pub use envelope::{Envelope, RoutingContext, RoutingTag, SessionTag, Timing};
pub use errors::CodecError;
pub use ids::{RequestId, RoutingIdentity, SessionId};
pub use profile::{deep_merge, UserProfile};
pub use reply::{DataKind, ReplyKind};
