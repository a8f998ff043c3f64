//! In-memory engine used by the test suite.
//!
//! Records every SDK call in invocation order, supports failure injection
//! for join and device acquisition, and lets tests drive the client event
//! stream directly. Downstream consumers can use it to test their own UI
//! glue without a real transport.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::config::ClientOptions;
use crate::engine::{
    ClientEvent, ConnectionState, LocalTrack, MediaKind, RemoteTrack, RtcClient, RtcEngine,
};
use crate::errors::SonaraError;

/// Every engine call a test can assert on, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateClient { options: ClientOptions },
    Join { app_id: String, channel: String, token: String },
    Leave,
    Subscribe { participant: String, kind: MediaKind },
    Publish { track_id: String },
    Unpublish { track_id: String },
    CreateMicrophoneTrack,
    CreateCameraTrack,
    CloseTrack { track_id: String },
}

#[derive(Default)]
struct Behavior {
    join_error: Option<String>,
    microphone_error: Option<String>,
    camera_error: Option<String>,
    subscribe_gate: Option<Arc<Notify>>,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<EngineCall>>,
    behavior: Mutex<Behavior>,
}

impl Shared {
    fn record(&self, call: EngineCall) {
        self.calls.lock().expect("mock lock poisoned").push(call);
    }

    fn behavior(&self) -> std::sync::MutexGuard<'_, Behavior> {
        self.behavior.lock().expect("mock lock poisoned")
    }
}

pub struct MockEngine {
    shared: Arc<Shared>,
    client: Mutex<Option<Arc<MockClient>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            client: Mutex::new(None),
        }
    }

    /// The most recently created client. Panics if no client exists yet.
    pub fn client(&self) -> Arc<MockClient> {
        self.client
            .lock()
            .expect("mock lock poisoned")
            .clone()
            .expect("no client created yet")
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.shared.calls.lock().expect("mock lock poisoned").clone()
    }

    /// Make every subsequent join fail with the given reason.
    pub fn fail_joins(&self, reason: &str) {
        self.shared.behavior().join_error = Some(reason.to_owned());
    }

    /// Make every subsequent microphone acquisition fail.
    pub fn fail_microphone(&self, reason: &str) {
        self.shared.behavior().microphone_error = Some(reason.to_owned());
    }

    /// Make every subsequent camera acquisition fail.
    pub fn fail_camera(&self, reason: &str) {
        self.shared.behavior().camera_error = Some(reason.to_owned());
    }

    pub fn clear_failures(&self) {
        let mut behavior = self.shared.behavior();
        behavior.join_error = None;
        behavior.microphone_error = None;
        behavior.camera_error = None;
    }

    /// Hold subsequent subscribe calls until the returned gate is
    /// notified (one `notify_one` releases one subscribe).
    pub fn gate_subscribes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.shared.behavior().subscribe_gate = Some(gate.clone());
        gate
    }

    /// Poll the call log until `pred` matches, panicking after 2s.
    pub async fn wait_for<F>(&self, pred: F) -> Vec<EngineCall>
    where
        F: Fn(&[EngineCall]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let calls = self.calls();
            if pred(&calls) {
                return calls;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("mock engine: condition not reached within 2s; calls so far: {calls:?}");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    fn create_client(
        &self,
        options: &ClientOptions,
    ) -> (Arc<dyn RtcClient>, mpsc::UnboundedReceiver<ClientEvent>) {
        self.shared.record(EngineCall::CreateClient { options: *options });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Arc::new(MockClient {
            shared: self.shared.clone(),
            event_tx,
            state: Mutex::new(ConnectionState::Disconnected),
        });
        *self.client.lock().expect("mock lock poisoned") = Some(client.clone());
        (client, event_rx)
    }

    async fn create_microphone_track(&self) -> Result<Arc<dyn LocalTrack>, SonaraError> {
        self.shared.record(EngineCall::CreateMicrophoneTrack);
        if let Some(reason) = self.shared.behavior().microphone_error.clone() {
            return Err(SonaraError::Device(reason));
        }
        Ok(Arc::new(MockLocalTrack::new(
            MediaKind::Audio,
            self.shared.clone(),
        )))
    }

    async fn create_camera_track(&self) -> Result<Arc<dyn LocalTrack>, SonaraError> {
        self.shared.record(EngineCall::CreateCameraTrack);
        if let Some(reason) = self.shared.behavior().camera_error.clone() {
            return Err(SonaraError::Device(reason));
        }
        Ok(Arc::new(MockLocalTrack::new(
            MediaKind::Video,
            self.shared.clone(),
        )))
    }
}

pub struct MockClient {
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    state: Mutex<ConnectionState>,
}

impl MockClient {
    /// Push a lifecycle event into the client's event stream.
    ///
    /// A `ConnectionStateChanged` event also updates the polled state so
    /// the two stay consistent, as they do in a real engine.
    pub fn emit(&self, event: ClientEvent) {
        if let ClientEvent::ConnectionStateChanged(state) = &event {
            *self.state.lock().expect("mock lock poisoned") = *state;
        }
        let _ = self.event_tx.send(event);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock().expect("mock lock poisoned") = state;
    }
}

impl fmt::Debug for MockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClient")
            .field("state", &self.connection_state())
            .finish()
    }
}

#[async_trait]
impl RtcClient for MockClient {
    async fn join(&self, app_id: &str, channel: &str, token: &str) -> Result<(), SonaraError> {
        self.shared.record(EngineCall::Join {
            app_id: app_id.to_owned(),
            channel: channel.to_owned(),
            token: token.to_owned(),
        });
        if let Some(reason) = self.shared.behavior().join_error.clone() {
            return Err(SonaraError::Join(reason));
        }
        *self.state.lock().expect("mock lock poisoned") = ConnectionState::Connected;
        Ok(())
    }

    async fn leave(&self) -> Result<(), SonaraError> {
        self.shared.record(EngineCall::Leave);
        *self.state.lock().expect("mock lock poisoned") = ConnectionState::Disconnected;
        Ok(())
    }

    async fn subscribe(
        &self,
        participant: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteTrack>, SonaraError> {
        self.shared.record(EngineCall::Subscribe {
            participant: participant.to_owned(),
            kind,
        });
        let gate = self.shared.behavior().subscribe_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Arc::new(MockRemoteTrack {
            id: Uuid::new_v4().to_string(),
            participant: participant.to_owned(),
            kind,
        }))
    }

    async fn publish(&self, track: Arc<dyn LocalTrack>) -> Result<(), SonaraError> {
        self.shared.record(EngineCall::Publish {
            track_id: track.id().to_owned(),
        });
        Ok(())
    }

    async fn unpublish(&self, track: Arc<dyn LocalTrack>) -> Result<(), SonaraError> {
        self.shared.record(EngineCall::Unpublish {
            track_id: track.id().to_owned(),
        });
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().expect("mock lock poisoned")
    }
}

pub struct MockLocalTrack {
    id: String,
    kind: MediaKind,
    shared: Arc<Shared>,
}

impl MockLocalTrack {
    fn new(kind: MediaKind, shared: Arc<Shared>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            shared,
        }
    }
}

impl fmt::Debug for MockLocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockLocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl LocalTrack for MockLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.shared.record(EngineCall::CloseTrack {
            track_id: self.id.clone(),
        });
    }
}

pub struct MockRemoteTrack {
    id: String,
    participant: String,
    kind: MediaKind,
}

impl MockRemoteTrack {
    pub fn participant(&self) -> &str {
        &self.participant
    }
}

impl fmt::Debug for MockRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockRemoteTrack")
            .field("id", &self.id)
            .field("participant", &self.participant)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RemoteTrack for MockRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

#[cfg(test)]
pub(crate) fn remote_track_for_tests(participant: &str, kind: MediaKind) -> Arc<dyn RemoteTrack> {
    Arc::new(MockRemoteTrack {
        id: Uuid::new_v4().to_string(),
        participant: participant.to_owned(),
        kind,
    })
}
