//! # simba-core — protocol and session model for the Simba gateway
//!
//! The gateway brokers between browser WebSocket clients and Android
//! devices running a streaming server. This crate holds everything
//! that is pure protocol or pure state:
//!
//! | Module     | Purpose                                              |
//! |------------|------------------------------------------------------|
//! | `envelope` | One-byte-tagged binary frames emitted to clients     |
//! | `wire`     | Device-side handshake and media unit framing         |
//! | `sps`      | Minimal H.264 SPS parse (profile bytes, dimensions)  |
//! | `control`  | Client → device control frame classification         |
//! | `translate`| Device media units → client envelopes                |
//! | `message`  | JSON command/event unions for the client protocol    |
//! | `session`  | Session ids, lifecycle phases, server options        |
//! | `error`    | The gateway error taxonomy                           |
//!
//! Runtime policy — sockets, processes, ADB — lives in the
//! `simba-gateway` binary crate.

pub mod control;
pub mod envelope;
pub mod error;
pub mod message;
pub mod session;
pub mod sps;
pub mod translate;
pub mod wire;

pub use envelope::{Envelope, EnvelopeTag};
pub use error::GatewayError;
pub use message::{
    parse_client_command, AdbCommandType, ClientCommand, DeviceEntry, DeviceState, DisplayEntry,
    ParseFailure, ServerEvent,
};
pub use session::{DisplayMode, ServerOptions, SessionId, SessionPhase, StreamSelection};
pub use sps::SpsInfo;
pub use translate::{AudioTranslator, Translated, VideoTranslator};
pub use wire::{UnitHeader, VideoMeta};
