use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::{ConnectionState, LocalTrack, MediaKind, RtcClient, RtcEngine};
use crate::errors::SonaraError;

/// Observable state of one local capture track.
#[derive(Debug, Clone, Default)]
pub enum LocalTrackState {
    #[default]
    Idle,
    Loading,
    Ready(Arc<dyn LocalTrack>),
    Failed(Arc<SonaraError>),
}

impl LocalTrackState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LocalTrackState::Loading)
    }

    pub fn track(&self) -> Option<&Arc<dyn LocalTrack>> {
        match self {
            LocalTrackState::Ready(track) => Some(track),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SonaraError> {
        match self {
            LocalTrackState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Handle to a local track manager.
///
/// Dropping the handle tears the track down (unpublish, then release the
/// device); [`LocalTrackHandle::close`] does the same but waits until the
/// teardown has run.
pub struct LocalTrackHandle {
    state_rx: watch::Receiver<LocalTrackState>,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl LocalTrackHandle {
    pub fn state(&self) -> LocalTrackState {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LocalTrackState> {
        self.state_rx.clone()
    }

    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.driver.await {
            tracing::warn!("local track driver task failed: {e}");
        }
    }
}

pub(crate) fn spawn(
    engine: Arc<dyn RtcEngine>,
    kind: MediaKind,
    client_rx: watch::Receiver<Option<Arc<dyn RtcClient>>>,
    enabled_rx: watch::Receiver<bool>,
) -> LocalTrackHandle {
    let (state_tx, state_rx) = watch::channel(LocalTrackState::Idle);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = tokio::spawn(drive(engine, kind, client_rx, enabled_rx, shutdown_rx, state_tx));
    LocalTrackHandle {
        state_rx,
        shutdown_tx,
        driver,
    }
}

enum Wake {
    Input,
    Shutdown,
}

async fn wait_for_wake(
    client_rx: &mut watch::Receiver<Option<Arc<dyn RtcClient>>>,
    enabled_rx: &mut watch::Receiver<bool>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Wake {
    tokio::select! {
        changed = enabled_rx.changed() => {
            if changed.is_ok() { Wake::Input } else { Wake::Shutdown }
        }
        changed = client_rx.changed() => {
            if changed.is_ok() { Wake::Input } else { Wake::Shutdown }
        }
        _ = shutdown_rx.changed() => Wake::Shutdown,
    }
}

fn inputs_dirty(
    client_rx: &watch::Receiver<Option<Arc<dyn RtcClient>>>,
    enabled_rx: &watch::Receiver<bool>,
    shutdown_rx: &watch::Receiver<bool>,
) -> bool {
    client_rx.has_changed().unwrap_or(true)
        || enabled_rx.has_changed().unwrap_or(true)
        || !matches!(shutdown_rx.has_changed(), Ok(false))
}

async fn drive(
    engine: Arc<dyn RtcEngine>,
    kind: MediaKind,
    mut client_rx: watch::Receiver<Option<Arc<dyn RtcClient>>>,
    mut enabled_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<LocalTrackState>,
) {
    'outer: loop {
        if !matches!(shutdown_rx.has_changed(), Ok(false)) {
            break;
        }
        let client = client_rx.borrow_and_update().clone();
        let enabled = *enabled_rx.borrow_and_update();

        let Some(client) = client.filter(|_| enabled) else {
            state_tx.send_replace(LocalTrackState::Idle);
            match wait_for_wake(&mut client_rx, &mut enabled_rx, &mut shutdown_rx).await {
                Wake::Input => continue 'outer,
                Wake::Shutdown => break 'outer,
            }
        };

        state_tx.send_replace(LocalTrackState::Loading);
        let acquired = match kind {
            MediaKind::Audio => engine.create_microphone_track().await,
            MediaKind::Video => engine.create_camera_track().await,
        };
        let track = match acquired {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "device acquisition failed");
                state_tx.send_replace(LocalTrackState::Failed(Arc::new(e)));
                match wait_for_wake(&mut client_rx, &mut enabled_rx, &mut shutdown_rx).await {
                    Wake::Input => continue 'outer,
                    Wake::Shutdown => break 'outer,
                }
            }
        };

        // Inputs may have flipped while the device was opening; such a
        // track is released without ever being published.
        if inputs_dirty(&client_rx, &enabled_rx, &shutdown_rx) {
            track.close();
            continue 'outer;
        }

        state_tx.send_replace(LocalTrackState::Ready(track.clone()));

        if client.connection_state() == ConnectionState::Connected {
            if let Err(e) = client.publish(track.clone()).await {
                tracing::warn!(kind = %kind, error = %e, "publish failed");
            }
        } else {
            // Publishing happens once, at acquisition time. A client
            // that connects later will not pick this track up.
            tracing::warn!(kind = %kind, "client not connected; track stays unpublished");
        }

        let wake = wait_for_wake(&mut client_rx, &mut enabled_rx, &mut shutdown_rx).await;

        // Teardown: unpublish before releasing the device, errors swallowed.
        if let Err(e) = client.unpublish(track.clone()).await {
            tracing::debug!(kind = %kind, error = %e, "unpublish failed");
        }
        track.close();

        if matches!(wake, Wake::Shutdown) {
            break 'outer;
        }
    }

    state_tx.send_replace(LocalTrackState::Idle);
    tracing::debug!(kind = %kind, "local track driver exited");
}
