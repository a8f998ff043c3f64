use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::connection::Connection;
use crate::engine::{MediaKind, RtcClient, RtcEngine};
use crate::errors::SonaraError;
use crate::local_tracks::{self, LocalTrackHandle};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Rtc,
    Live,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    Vp8,
    Vp9,
    H264,
    Av1,
}

/// Options handed to the engine when the client is created.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ClientOptions {
    #[serde(default)]
    pub mode: ChannelMode,
    #[serde(default)]
    pub codec: VideoCodec,
}

/// Credentials and client options for one engine session.
///
/// Set once per [`SonaraContext`] and read-only thereafter.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub app_id: String,
    pub token: String,
    #[serde(default)]
    pub client_options: Option<ClientOptions>,
}

impl SessionConfig {
    pub fn new(app_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            token: token.into(),
            client_options: None,
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SonaraError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SonaraError::Config(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| SonaraError::Config(e.to_string()))
    }
}

/// Explicit configuration holder and entry point.
///
/// One context per engine session scope. There is deliberately no
/// process-wide singleton; tests and embedders create as many independent
/// contexts as they need.
pub struct SonaraContext {
    engine: Arc<dyn RtcEngine>,
    config: OnceLock<Arc<SessionConfig>>,
}

impl SonaraContext {
    /// Create an unconfigured context. [`SonaraContext::init`] must run
    /// before [`SonaraContext::connect`].
    pub fn new(engine: Arc<dyn RtcEngine>) -> Self {
        Self {
            engine,
            config: OnceLock::new(),
        }
    }

    /// Create a context with its configuration already applied.
    pub fn with_config(engine: Arc<dyn RtcEngine>, config: SessionConfig) -> Self {
        let ctx = Self::new(engine);
        let _ = ctx.config.set(Arc::new(config));
        ctx
    }

    /// Store the session configuration. Exactly once per context.
    pub fn init(&self, config: SessionConfig) -> Result<(), SonaraError> {
        self.config
            .set(Arc::new(config))
            .map_err(|_| SonaraError::AlreadyConfigured)
    }

    pub fn config(&self) -> Result<Arc<SessionConfig>, SonaraError> {
        self.config
            .get()
            .cloned()
            .ok_or(SonaraError::ConfigurationMissing)
    }

    /// Bind a connection to the desired-channel input.
    ///
    /// The returned [`Connection`] joins whatever channel `channel_rx`
    /// currently names, rejoins on every change, and leaves on teardown.
    /// Fails synchronously with [`SonaraError::ConfigurationMissing`] if
    /// the context was never initialized.
    pub fn connect(
        &self,
        channel_rx: watch::Receiver<Option<String>>,
    ) -> Result<Connection, SonaraError> {
        let config = self.config()?;
        Ok(Connection::spawn(self.engine.clone(), config, channel_rx))
    }

    /// Manage a local microphone track: acquired and published while
    /// `enabled_rx` is true and a client is present, released otherwise.
    pub fn use_local_audio_track(
        &self,
        client_rx: watch::Receiver<Option<Arc<dyn RtcClient>>>,
        enabled_rx: watch::Receiver<bool>,
    ) -> LocalTrackHandle {
        local_tracks::spawn(self.engine.clone(), MediaKind::Audio, client_rx, enabled_rx)
    }

    /// Manage a local camera track. Same contract as
    /// [`SonaraContext::use_local_audio_track`].
    pub fn use_local_video_track(
        &self,
        client_rx: watch::Receiver<Option<Arc<dyn RtcClient>>>,
        enabled_rx: watch::Receiver<bool>,
    ) -> LocalTrackHandle {
        local_tracks::spawn(self.engine.clone(), MediaKind::Video, client_rx, enabled_rx)
    }
}
