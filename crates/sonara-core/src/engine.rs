//! The boundary to the underlying real-time media engine.
//!
//! Transport, signaling, codec negotiation and device capture all live
//! behind these traits. This crate never looks inside a track handle; it
//! only moves handles between the engine and the observable snapshots.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ClientOptions;
use crate::errors::SonaraError;

/// Opaque identifier of a remote peer within a channel.
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Connection lifecycle as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications delivered on the stream returned by
/// [`RtcEngine::create_client`], in the order the engine observed them.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ParticipantJoined { participant: ParticipantId },
    ParticipantLeft { participant: ParticipantId },
    MediaPublished { participant: ParticipantId, kind: MediaKind },
    MediaUnpublished { participant: ParticipantId, kind: MediaKind },
    ConnectionStateChanged(ConnectionState),
}

/// Handle to a remote media stream obtained through `subscribe`.
pub trait RemoteTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
}

/// Handle to a local capture device track.
pub trait LocalTrack: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Release the underlying capture device.
    fn close(&self);
}

/// A single engine session: join/leave a channel, publish local tracks,
/// subscribe to remote media.
#[async_trait]
pub trait RtcClient: fmt::Debug + Send + Sync {
    async fn join(&self, app_id: &str, channel: &str, token: &str) -> Result<(), SonaraError>;
    async fn leave(&self) -> Result<(), SonaraError>;
    async fn subscribe(
        &self,
        participant: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteTrack>, SonaraError>;
    async fn publish(&self, track: Arc<dyn LocalTrack>) -> Result<(), SonaraError>;
    async fn unpublish(&self, track: Arc<dyn LocalTrack>) -> Result<(), SonaraError>;
    /// Current connection state, as last reported by the engine.
    fn connection_state(&self) -> ConnectionState;
}

/// Entry point into the engine: client and capture-device factories.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Create a session handle together with its lifecycle event stream.
    ///
    /// The returned receiver is the only delivery path for
    /// [`ClientEvent`]s; dropping it detaches the session from its
    /// observers but does not tear the session down.
    fn create_client(
        &self,
        options: &ClientOptions,
    ) -> (Arc<dyn RtcClient>, mpsc::UnboundedReceiver<ClientEvent>);

    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, SonaraError>;
    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, SonaraError>;
}
