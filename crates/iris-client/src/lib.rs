//! Request/response correlation over a message broker.
//!
//! [`IrisClient`] sends requests for many sessions over one connection and
//! routes the shared reply stream back to the session that asked.

pub mod artifacts;
pub mod client;
pub mod correlator;
pub mod errors;
pub mod handler;
pub mod request;
pub mod responder;
pub mod sequencer;
pub mod sessions;
pub mod settings;

pub use artifacts::ArtifactCache;
pub use client::IrisClient;
pub use correlator::{Ack, Channel, Correlator, Disposition, IgnoreReason, Verdict};
pub use errors::{ClientError, SettingsError};
pub use handler::{NoopHandler, ResponseHandler};
pub use request::{ApiReply, ChatReply, Expectation, LangResponse, Outcome, Request};
pub use responder::EchoResponder;
pub use sequencer::{RequestSink, Sequencer};
pub use sessions::{Session, SessionRegistry};
pub use settings::{DecodeFailurePolicy, IrisSettings, SettingsSources};
