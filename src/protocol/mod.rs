//! Protocol module - control-channel frames and their JSON codec.
//!
//! This module implements the message schema shared by relay and worker:
//! - [`Frame`] tagged union selected by the `type` field
//! - payload structs for registration, requests and responses
//! - [`FrameCodec`] for text/binary WebSocket messages

mod codec;
mod frame;

pub use codec::FrameCodec;
pub use frame::{now_millis, ApiRequest, Frame, JobId, Registration, ResponsePayload, StreamStart};
