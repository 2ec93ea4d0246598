//! Parley SFU core
//!
//! Signaling, meeting membership, and media fan-out for the Parley
//! conferencing server. Media arrives from each participant over WebRTC
//! and is selectively forwarded to everyone else in the meeting.
//!
//! ## Architecture
//!
//! - **`MeetingPool`**: every live meeting, the create/join entry points
//! - **`Meeting`**: membership, join replay, track fan-out, retirement
//! - **`ParticipantConnection`**: one participant, session plus link
//! - **`PeerSession`**: engine peer lifecycle and liveness deadlines
//! - **`SignalingLink`**: control-socket signaling with a silent upgrade
//!   to the peer data channel
//! - **`WebRtcEngine`**: production engine backed by the `webrtc` crate

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod link;
pub mod logging;
pub mod meeting;
pub mod message;
pub mod pool;
pub mod session;
pub mod transport;
pub mod types;
pub mod webrtc_engine;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
pub use pool::MeetingPool;
pub use webrtc_engine::WebRtcEngine;
