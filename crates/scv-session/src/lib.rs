//! Session orchestration for the SCV server.
//!
//! `SessionService` is the request-handling layer: given a credential or a
//! lease token it drives the scheduling core (`scv-core`) and the stores
//! (`scv-store`) through stream creation, activation, frame buffering,
//! checkpoint commits and stops. `http` exposes it over HTTP/1.1.

pub mod auth;
pub mod codec;
pub mod error;
pub mod http;
pub mod service;

pub use auth::{Authenticator, Principal, StaticAuthenticator, UserCredential};
pub use codec::{CodecError, Encoding, decode_base64, decode_payload};
pub use error::SessionError;
pub use http::{HttpServeError, HttpServerConfig, serve, serve_until};
pub use service::{
    ActivateRequest, ActivateResponse, CheckpointRequest, CheckpointResponse,
    CreateStreamRequest, CreateStreamResponse, FrameRequest, SessionConfig, SessionService,
    StartResponse, StopRequest,
};
