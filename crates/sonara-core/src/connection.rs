use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::engine::{ClientEvent, MediaKind, ParticipantId, RemoteTrack, RtcClient, RtcEngine};
use crate::errors::SonaraError;
use crate::events::{EventEmitter, SonaraEvent, SonaraEventListener};
use crate::snapshot::ConnectionSnapshot;

/// Completion of a spawned subscribe, posted back to the driver task.
///
/// Tagged with the rejoin epoch it was spawned under so a completion that
/// straddles a channel switch can be dropped instead of writing into the
/// wrong snapshot.
struct SubscribeOutcome {
    epoch: u64,
    participant: ParticipantId,
    kind: MediaKind,
    result: Result<Arc<dyn RemoteTrack>, SonaraError>,
}

/// A live binding between a desired-channel input and one engine client.
///
/// The driver task joins whatever channel the input names, rejoins on
/// every change (leaving first), and keeps the [`ConnectionSnapshot`]
/// current with the client's lifecycle events. Dropping the handle tears
/// the binding down; [`Connection::close`] does the same but waits until
/// the final leave has run.
pub struct Connection {
    client: Arc<dyn RtcClient>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
    emitter: EventEmitter,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn spawn(
        engine: Arc<dyn RtcEngine>,
        config: Arc<SessionConfig>,
        channel_rx: watch::Receiver<Option<String>>,
    ) -> Self {
        let options = config.client_options.unwrap_or_default();
        let (client, events) = engine.create_client(&options);

        let (snapshot_tx, snapshot_rx) =
            watch::channel(ConnectionSnapshot::new(client.clone(), None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let emitter = EventEmitter::new();

        let driver = tokio::spawn(drive(
            client.clone(),
            config,
            channel_rx,
            shutdown_rx,
            events,
            snapshot_tx,
            emitter.clone(),
        ));

        Self {
            client,
            snapshot_rx,
            emitter,
            shutdown_tx,
            driver,
        }
    }

    /// The shared client handle. Local track managers publish through it.
    pub fn client(&self) -> Arc<dyn RtcClient> {
        self.client.clone()
    }

    /// Current snapshot value.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver observing every snapshot update.
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Register a listener for connection events.
    pub fn add_listener(&self, listener: Arc<dyn SonaraEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Shut the binding down and wait for the driver to leave the channel.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.driver.await {
            tracing::warn!("connection driver task failed: {e}");
        }
    }
}

async fn drive(
    client: Arc<dyn RtcClient>,
    config: Arc<SessionConfig>,
    mut channel_rx: watch::Receiver<Option<String>>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    emitter: EventEmitter,
) {
    let (subscribe_tx, mut subscribe_rx) = mpsc::unbounded_channel::<SubscribeOutcome>();
    let mut epoch: u64 = 0;
    let mut events_open = true;

    'rejoin: loop {
        epoch += 1;
        let desired = channel_rx.borrow_and_update().clone();

        // Fresh snapshot for the (re)join: empty track map, flags cleared.
        snapshot_tx.send_replace(ConnectionSnapshot::new(client.clone(), desired.clone()));

        if let Some(channel) = desired.as_deref() {
            match client.join(&config.app_id, channel, &config.token).await {
                Ok(()) => tracing::info!(channel, "joined channel"),
                Err(e) => {
                    // Surfaced to the caller, never retried here; a new
                    // channel value re-runs the join.
                    tracing::warn!(channel, error = %e, "join failed");
                    emitter.emit(SonaraEvent::JoinFailed {
                        channel: channel.to_owned(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        loop {
            tokio::select! {
                changed = channel_rx.changed() => {
                    // Teardown for the run that just ended: leave before
                    // the next join. The join above has already settled,
                    // so leave can never overtake it.
                    if let Err(e) = client.leave().await {
                        tracing::debug!(error = %e, "leave failed");
                    }
                    if changed.is_err() {
                        // Input dropped: the channel can never change again.
                        break 'rejoin;
                    }
                    continue 'rejoin;
                }
                _ = shutdown_rx.changed() => {
                    if let Err(e) = client.leave().await {
                        tracing::debug!(error = %e, "leave failed");
                    }
                    break 'rejoin;
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => apply_event(
                            event,
                            epoch,
                            &client,
                            &snapshot_tx,
                            &emitter,
                            &subscribe_tx,
                        ),
                        None => {
                            tracing::debug!("client event stream closed");
                            events_open = false;
                        }
                    }
                }
                Some(outcome) = subscribe_rx.recv() => {
                    apply_subscribe_outcome(outcome, epoch, &snapshot_tx, &emitter);
                }
            }
        }
    }

    tracing::debug!("connection driver exited");
}

fn apply_event(
    event: ClientEvent,
    epoch: u64,
    client: &Arc<dyn RtcClient>,
    snapshot_tx: &watch::Sender<ConnectionSnapshot>,
    emitter: &EventEmitter,
    subscribe_tx: &mpsc::UnboundedSender<SubscribeOutcome>,
) {
    match event {
        ClientEvent::ParticipantJoined { participant } => {
            snapshot_tx.send_modify(|snap| snap.add_participant(&participant));
            emitter.emit(SonaraEvent::ParticipantJoined(participant));
        }
        ClientEvent::ParticipantLeft { participant } => {
            snapshot_tx.send_modify(|snap| snap.remove_participant(&participant));
            emitter.emit(SonaraEvent::ParticipantLeft(participant));
        }
        ClientEvent::MediaPublished { participant, kind } => {
            // Subscribing is the one operation that runs off the driver
            // task; the completion comes back through subscribe_rx.
            let client = client.clone();
            let subscribe_tx = subscribe_tx.clone();
            tokio::spawn(async move {
                let result = client.subscribe(&participant, kind).await;
                let _ = subscribe_tx.send(SubscribeOutcome {
                    epoch,
                    participant,
                    kind,
                    result,
                });
            });
        }
        ClientEvent::MediaUnpublished { participant, kind } => {
            snapshot_tx.send_modify(|snap| snap.clear_remote_track(&participant, kind));
            emitter.emit(SonaraEvent::TrackCleared { participant, kind });
        }
        ClientEvent::ConnectionStateChanged(state) => {
            snapshot_tx.send_if_modified(|snap| {
                let before = (snap.is_loading, snap.is_connected);
                snap.apply_connection_state(state);
                before != (snap.is_loading, snap.is_connected)
            });
            emitter.emit(SonaraEvent::ConnectionStateChanged(state));
        }
    }
}

fn apply_subscribe_outcome(
    outcome: SubscribeOutcome,
    epoch: u64,
    snapshot_tx: &watch::Sender<ConnectionSnapshot>,
    emitter: &EventEmitter,
) {
    if outcome.epoch != epoch {
        tracing::debug!(
            participant = %outcome.participant,
            "dropping subscribe outcome from a previous channel"
        );
        return;
    }
    match outcome.result {
        Ok(track) => {
            let mut applied = false;
            snapshot_tx.send_if_modified(|snap| {
                applied = snap.set_remote_track(&outcome.participant, outcome.kind, track.clone());
                applied
            });
            if applied {
                emitter.emit(SonaraEvent::TrackSubscribed {
                    participant: outcome.participant,
                    kind: outcome.kind,
                });
            } else {
                tracing::debug!(
                    participant = %outcome.participant,
                    "participant left before subscribe completed"
                );
            }
        }
        Err(e) => {
            tracing::warn!(participant = %outcome.participant, error = %e, "subscribe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientOptions, SonaraContext};
    use crate::engine::ConnectionState;
    use crate::mock::{EngineCall, MockEngine};
    use std::sync::Mutex;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn setup(channel: Option<&str>) -> (Arc<MockEngine>, watch::Sender<Option<String>>, Connection) {
        let engine = Arc::new(MockEngine::new());
        let ctx = SonaraContext::with_config(engine.clone(), SessionConfig::new("A1", "T1"));
        let (channel_tx, channel_rx) = watch::channel(channel.map(str::to_owned));
        let connection = ctx.connect(channel_rx).unwrap();
        (engine, channel_tx, connection)
    }

    async fn wait_snapshot(
        rx: &mut watch::Receiver<ConnectionSnapshot>,
        pred: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> ConnectionSnapshot {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed")
            .clone()
    }

    fn joins_and_leaves(calls: &[EngineCall]) -> Vec<EngineCall> {
        calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Join { .. } | EngineCall::Leave))
            .cloned()
            .collect()
    }

    struct EventCapture {
        events: Arc<Mutex<Vec<SonaraEvent>>>,
    }

    impl SonaraEventListener for EventCapture {
        fn on_event(&self, event: SonaraEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn joins_with_configured_credentials_and_rejoins_on_change() {
        init_tracing();
        let (engine, channel_tx, connection) = setup(Some("room-1"));

        engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, EngineCall::Join { .. }))
            })
            .await;

        channel_tx.send(Some("room-2".to_owned())).unwrap();
        let calls = engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .filter(|c| matches!(c, EngineCall::Join { .. }))
                    .count()
                    == 2
            })
            .await;

        assert_eq!(
            joins_and_leaves(&calls),
            vec![
                EngineCall::Join {
                    app_id: "A1".to_owned(),
                    channel: "room-1".to_owned(),
                    token: "T1".to_owned(),
                },
                EngineCall::Leave,
                EngineCall::Join {
                    app_id: "A1".to_owned(),
                    channel: "room-2".to_owned(),
                    token: "T1".to_owned(),
                },
            ]
        );

        connection.close().await;
    }

    #[tokio::test]
    async fn no_join_without_a_channel() {
        let (engine, _channel_tx, connection) = setup(None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            engine.calls(),
            vec![EngineCall::CreateClient {
                options: ClientOptions::default()
            }]
        );

        connection.close().await;
    }

    #[tokio::test]
    async fn client_created_with_configured_options() {
        let engine = Arc::new(MockEngine::new());
        let mut config = SessionConfig::new("A1", "T1");
        config.client_options = Some(ClientOptions {
            mode: crate::config::ChannelMode::Live,
            codec: crate::config::VideoCodec::H264,
        });
        let ctx = SonaraContext::with_config(engine.clone(), config.clone());
        let (_channel_tx, channel_rx) = watch::channel(None);
        let connection = ctx.connect(channel_rx).unwrap();

        assert_eq!(
            engine.calls()[0],
            EngineCall::CreateClient {
                options: config.client_options.unwrap()
            }
        );

        connection.close().await;
    }

    #[tokio::test]
    async fn track_map_keys_follow_participant_lifecycle() {
        let (engine, _channel_tx, connection) = setup(Some("room-1"));
        let mut rx = connection.watch();
        wait_snapshot(&mut rx, |s| s.channel.as_deref() == Some("room-1")).await;

        let client = engine.client();
        client.emit(ClientEvent::ParticipantJoined { participant: "p1".into() });
        client.emit(ClientEvent::ParticipantJoined { participant: "p2".into() });
        wait_snapshot(&mut rx, |s| s.remote_tracks.len() == 2).await;

        client.emit(ClientEvent::ParticipantLeft { participant: "p1".into() });
        let snap = wait_snapshot(&mut rx, |s| s.remote_tracks.len() == 1).await;
        assert_eq!(snap.participant_ids(), ["p2"]);
        assert!(snap.remote_tracks["p2"].is_empty());

        connection.close().await;
    }

    #[tokio::test]
    async fn published_media_is_subscribed_and_cleared_independently() {
        let (engine, _channel_tx, connection) = setup(Some("room-1"));
        let mut rx = connection.watch();
        let client = engine.client();

        client.emit(ClientEvent::ParticipantJoined { participant: "p1".into() });
        client.emit(ClientEvent::MediaPublished {
            participant: "p1".into(),
            kind: MediaKind::Video,
        });
        client.emit(ClientEvent::MediaPublished {
            participant: "p1".into(),
            kind: MediaKind::Audio,
        });

        wait_snapshot(&mut rx, |s| {
            s.remote_tracks
                .get("p1")
                .is_some_and(|pair| pair.audio.is_some() && pair.video.is_some())
        })
        .await;

        client.emit(ClientEvent::MediaUnpublished {
            participant: "p1".into(),
            kind: MediaKind::Video,
        });
        let snap = wait_snapshot(&mut rx, |s| {
            s.remote_tracks
                .get("p1")
                .is_some_and(|pair| pair.video.is_none())
        })
        .await;
        assert!(snap.remote_tracks["p1"].audio.is_some());

        connection.close().await;
    }

    #[tokio::test]
    async fn late_subscribe_does_not_resurrect_departed_participant() {
        init_tracing();
        let (engine, _channel_tx, connection) = setup(Some("room-1"));
        let gate = engine.gate_subscribes();
        let mut rx = connection.watch();
        let client = engine.client();

        client.emit(ClientEvent::ParticipantJoined { participant: "p1".into() });
        client.emit(ClientEvent::MediaPublished {
            participant: "p1".into(),
            kind: MediaKind::Audio,
        });
        engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, EngineCall::Subscribe { .. }))
            })
            .await;

        client.emit(ClientEvent::ParticipantLeft { participant: "p1".into() });
        wait_snapshot(&mut rx, |s| s.remote_tracks.is_empty()).await;

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connection.snapshot().remote_tracks.is_empty());

        connection.close().await;
    }

    #[tokio::test]
    async fn subscribe_outcome_from_previous_channel_is_dropped() {
        let (engine, channel_tx, connection) = setup(Some("room-1"));
        let gate = engine.gate_subscribes();
        let mut rx = connection.watch();
        let client = engine.client();

        client.emit(ClientEvent::ParticipantJoined { participant: "p1".into() });
        client.emit(ClientEvent::MediaPublished {
            participant: "p1".into(),
            kind: MediaKind::Audio,
        });
        engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, EngineCall::Subscribe { .. }))
            })
            .await;

        channel_tx.send(Some("room-2".to_owned())).unwrap();
        wait_snapshot(&mut rx, |s| s.channel.as_deref() == Some("room-2")).await;
        client.emit(ClientEvent::ParticipantJoined { participant: "p1".into() });
        wait_snapshot(&mut rx, |s| s.remote_tracks.contains_key("p1")).await;

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connection.snapshot().remote_tracks["p1"].audio.is_none());

        connection.close().await;
    }

    #[tokio::test]
    async fn channel_change_resets_the_track_map() {
        let (engine, channel_tx, connection) = setup(Some("room-1"));
        let mut rx = connection.watch();
        let client = engine.client();

        client.emit(ClientEvent::ParticipantJoined { participant: "p1".into() });
        wait_snapshot(&mut rx, |s| s.remote_tracks.contains_key("p1")).await;

        channel_tx.send(Some("room-2".to_owned())).unwrap();
        let snap = wait_snapshot(&mut rx, |s| s.channel.as_deref() == Some("room-2")).await;
        assert!(snap.remote_tracks.is_empty());

        connection.close().await;
    }

    #[tokio::test]
    async fn connection_state_projects_onto_flags() {
        let (engine, _channel_tx, connection) = setup(Some("room-1"));
        let mut rx = connection.watch();
        let client = engine.client();

        client.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connecting));
        wait_snapshot(&mut rx, |s| s.is_loading && !s.is_connected).await;

        client.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));
        wait_snapshot(&mut rx, |s| s.is_connected && !s.is_loading).await;

        client.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Reconnecting));
        wait_snapshot(&mut rx, |s| s.is_loading && !s.is_connected).await;

        client.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        wait_snapshot(&mut rx, |s| !s.is_loading && !s.is_connected).await;

        connection.close().await;
    }

    #[tokio::test]
    async fn failed_join_is_reported_once_and_not_retried() {
        let (engine, channel_tx, connection) = setup(None);
        engine.fail_joins("no such channel");

        let events = Arc::new(Mutex::new(Vec::new()));
        connection.add_listener(Arc::new(EventCapture { events: events.clone() }));

        channel_tx.send(Some("room-x".to_owned())).unwrap();
        let calls = engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, EngineCall::Join { .. }))
            })
            .await;
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, EngineCall::Join { .. }))
                .count(),
            1
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let failed = events.lock().unwrap().iter().any(
                    |e| matches!(e, SonaraEvent::JoinFailed { channel, .. } if channel == "room-x"),
                );
                if failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("JoinFailed was never emitted");

        // Still exactly one join attempt after the failure settled.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            engine
                .calls()
                .iter()
                .filter(|c| matches!(c, EngineCall::Join { .. }))
                .count(),
            1
        );

        connection.close().await;
    }

    #[tokio::test]
    async fn close_leaves_the_channel() {
        let (engine, _channel_tx, connection) = setup(Some("room-1"));
        engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, EngineCall::Join { .. }))
            })
            .await;

        connection.close().await;
        assert_eq!(engine.calls().last(), Some(&EngineCall::Leave));
    }

    #[tokio::test]
    async fn rapid_channel_flips_never_interleave_join_and_leave() {
        let (engine, channel_tx, connection) = setup(Some("room-1"));
        engine
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, EngineCall::Join { .. }))
            })
            .await;

        channel_tx.send(Some("room-2".to_owned())).unwrap();
        channel_tx.send(Some("room-3".to_owned())).unwrap();
        channel_tx.send(Some("room-4".to_owned())).unwrap();

        let calls = engine
            .wait_for(|calls| {
                calls.iter().any(
                    |c| matches!(c, EngineCall::Join { channel, .. } if channel == "room-4"),
                )
            })
            .await;

        // Strict alternation: every rejoin is preceded by exactly one leave.
        let sequence = joins_and_leaves(&calls);
        for pair in sequence.windows(2) {
            match (&pair[0], &pair[1]) {
                (EngineCall::Join { .. }, EngineCall::Leave) => {}
                (EngineCall::Leave, EngineCall::Join { .. }) => {}
                other => panic!("join/leave interleaved: {other:?}"),
            }
        }

        connection.close().await;
    }
}
