//! Sonara core: reactive bindings over a pluggable real-time media engine.
//!
//! The engine (transport, signaling, codecs, device capture) is an opaque
//! collaborator behind the [`engine`] traits. This crate projects its
//! lifecycle events onto observable snapshots: a [`Connection`] tracks the
//! desired channel and the remote participants' tracks, and the local
//! track managers acquire, publish and release capture devices as their
//! enabled flag flips. Consumers observe everything through
//! `tokio::sync::watch` receivers; no event wiring of their own.

pub mod config;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod events;
pub mod local_tracks;
pub mod mock;
pub mod snapshot;

pub use config::{ChannelMode, ClientOptions, SessionConfig, SonaraContext, VideoCodec};
pub use connection::Connection;
pub use engine::{
    ClientEvent, ConnectionState, LocalTrack, MediaKind, ParticipantId, RemoteTrack, RtcClient,
    RtcEngine,
};
pub use errors::SonaraError;
pub use events::{SonaraEvent, SonaraEventListener};
pub use local_tracks::{LocalTrackHandle, LocalTrackState};
pub use snapshot::{ConnectionSnapshot, RemoteTrackPair};
