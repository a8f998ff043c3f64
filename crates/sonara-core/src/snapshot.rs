use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{ConnectionState, MediaKind, ParticipantId, RemoteTrack, RtcClient};

/// Remote media handles for one participant.
///
/// Created empty when the participant joins. Fields are filled in as
/// subscriptions complete and cleared again when media is unpublished;
/// the pair itself is only removed when the participant leaves.
#[derive(Debug, Clone, Default)]
pub struct RemoteTrackPair {
    pub audio: Option<Arc<dyn RemoteTrack>>,
    pub video: Option<Arc<dyn RemoteTrack>>,
}

impl RemoteTrackPair {
    pub fn get(&self, kind: MediaKind) -> Option<&Arc<dyn RemoteTrack>> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<Arc<dyn RemoteTrack>> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }
}

/// Observable state of one connection.
///
/// Owned and mutated exclusively by the connection driver task; consumers
/// read clones through a `watch::Receiver`.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub client: Arc<dyn RtcClient>,
    pub channel: Option<String>,
    pub is_loading: bool,
    pub is_connected: bool,
    pub remote_tracks: HashMap<ParticipantId, RemoteTrackPair>,
}

impl ConnectionSnapshot {
    pub(crate) fn new(client: Arc<dyn RtcClient>, channel: Option<String>) -> Self {
        Self {
            client,
            channel,
            is_loading: false,
            is_connected: false,
            remote_tracks: HashMap::new(),
        }
    }

    /// Ids of all currently joined remote participants, sorted.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.remote_tracks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn add_participant(&mut self, id: &str) {
        self.remote_tracks.entry(id.to_owned()).or_default();
    }

    pub(crate) fn remove_participant(&mut self, id: &str) {
        self.remote_tracks.remove(id);
    }

    /// Store a subscribed track. Returns false if the participant is no
    /// longer present; a late subscription must not resurrect a removed
    /// entry.
    pub(crate) fn set_remote_track(
        &mut self,
        id: &str,
        kind: MediaKind,
        track: Arc<dyn RemoteTrack>,
    ) -> bool {
        match self.remote_tracks.get_mut(id) {
            Some(pair) => {
                *pair.slot_mut(kind) = Some(track);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_remote_track(&mut self, id: &str, kind: MediaKind) {
        if let Some(pair) = self.remote_tracks.get_mut(id) {
            *pair.slot_mut(kind) = None;
        }
    }

    pub(crate) fn apply_connection_state(&mut self, state: ConnectionState) {
        let (is_loading, is_connected) = project_connection_state(state);
        self.is_loading = is_loading;
        self.is_connected = is_connected;
    }
}

/// Project an engine connection state onto the snapshot flags.
///
/// Pure and idempotent: the flags depend on nothing but the given state.
pub(crate) fn project_connection_state(state: ConnectionState) -> (bool, bool) {
    match state {
        ConnectionState::Connecting
        | ConnectionState::Reconnecting
        | ConnectionState::Disconnecting => (true, false),
        ConnectionState::Connected => (false, true),
        ConnectionState::Disconnected => (false, false),
    }
}
