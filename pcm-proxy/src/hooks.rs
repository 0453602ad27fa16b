//! Side effects around playback: player volume and finished-track notices.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Callbacks the streaming layer fires at playback boundaries.
#[async_trait]
pub trait PlaybackHooks: Send + Sync + 'static {
    /// A decoder stream is about to start producing audio.
    async fn before_stream(&self) {}

    /// A request for the whole track arrived, which means the player moved on
    /// from whatever it was playing before.
    async fn full_resource_requested(&self) {}

    /// Fired once per stream, after its decoder has been reaped.
    async fn track_finished(&self, _track_id: &str) {}
}

/// Hooks that do nothing.
pub struct NoopHooks;

impl PlaybackHooks for NoopHooks {}

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("volume request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected volume response: {0}")]
    Response(String),
    #[error("volume is {actual}% after setting it to {requested}%")]
    NotApplied { requested: u8, actual: u8 },
}

/// Reads and sets the media player's output volume.
#[async_trait]
pub trait VolumeControl: Send + Sync + 'static {
    async fn current_volume(&self) -> Result<u8, VolumeError>;
    async fn set_volume(&self, percent: u8) -> Result<(), VolumeError>;
}

/// Volume control over the player's JSON-RPC endpoint.
pub struct JsonRpcVolume {
    client: reqwest::Client,
    url: String,
}

impl JsonRpcVolume {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn call(&self, body: serde_json::Value) -> Result<serde_json::Value, VolumeError> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl VolumeControl for JsonRpcVolume {
    async fn current_volume(&self) -> Result<u8, VolumeError> {
        let reply = self
            .call(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "Application.GetProperties",
                "params": { "properties": ["volume", "muted"] },
            }))
            .await?;
        parse_volume_reply(&reply)
    }

    async fn set_volume(&self, percent: u8) -> Result<(), VolumeError> {
        self.call(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "Application.SetVolume",
            "params": { "volume": percent },
        }))
        .await?;
        Ok(())
    }
}

fn parse_volume_reply(reply: &serde_json::Value) -> Result<u8, VolumeError> {
    reply
        .get("result")
        .and_then(|r| r.get("volume"))
        .and_then(|v| v.as_u64())
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| VolumeError::Response(reply.to_string()))
}

/// Switches the player to a requested volume while streaming and puts the
/// previous volume back once a new full track is requested.
pub struct VolumeKeeper<V> {
    control: V,
    requested: u8,
    saved: Mutex<Option<u8>>,
}

impl<V: VolumeControl> VolumeKeeper<V> {
    pub fn new(control: V, requested: u8) -> Self {
        Self {
            control,
            requested,
            saved: Mutex::new(None),
        }
    }

    pub fn saved_volume(&self) -> Option<u8> {
        *self.saved.lock().unwrap()
    }

    /// Save the current volume and switch to the requested one. Does nothing
    /// while a saved volume is already held.
    pub async fn apply_requested(&self) -> Result<(), VolumeError> {
        if self.saved_volume().is_some() {
            return Ok(());
        }
        let current = self.control.current_volume().await?;
        self.control.set_volume(self.requested).await?;

        let actual = self.control.current_volume().await?;
        if actual != self.requested {
            return Err(VolumeError::NotApplied {
                requested: self.requested,
                actual,
            });
        }
        *self.saved.lock().unwrap() = Some(current);
        debug!(
            "Saved volume: {}%, new stream volume: {}%",
            current, self.requested
        );
        Ok(())
    }

    /// Put back the volume saved by [`Self::apply_requested`], if any.
    pub async fn restore_saved(&self) -> Result<(), VolumeError> {
        let Some(saved) = self.saved_volume() else {
            return Ok(());
        };
        self.control.set_volume(saved).await?;
        *self.saved.lock().unwrap() = None;
        debug!("Reset volume to saved volume: {}%", saved);
        Ok(())
    }
}

/// Hooks used by the binary: optional volume handling plus a log line per
/// finished track.
pub struct ProxyHooks {
    volume: Option<VolumeKeeper<Box<dyn VolumeControl>>>,
}

impl ProxyHooks {
    pub fn new(volume: Option<VolumeKeeper<Box<dyn VolumeControl>>>) -> Self {
        Self { volume }
    }
}

#[async_trait]
impl VolumeControl for Box<dyn VolumeControl> {
    async fn current_volume(&self) -> Result<u8, VolumeError> {
        (**self).current_volume().await
    }

    async fn set_volume(&self, percent: u8) -> Result<(), VolumeError> {
        (**self).set_volume(percent).await
    }
}

#[async_trait]
impl PlaybackHooks for ProxyHooks {
    async fn before_stream(&self) {
        if let Some(volume) = &self.volume {
            if let Err(e) = volume.apply_requested().await {
                warn!("Could not apply stream volume: {e}");
            }
        }
    }

    async fn full_resource_requested(&self) {
        if let Some(volume) = &self.volume {
            if let Err(e) = volume.restore_saved().await {
                warn!("Could not restore saved volume: {e}");
            }
        }
    }

    async fn track_finished(&self, track_id: &str) {
        info!("Track '{}' finished", track_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// In-memory player volume. `sticky` makes set_volume a no-op.
    struct FakeVolume {
        level: Arc<Mutex<u8>>,
        sets: Arc<Mutex<Vec<u8>>>,
        sticky: bool,
    }

    impl FakeVolume {
        fn new(level: u8) -> Self {
            Self {
                level: Arc::new(Mutex::new(level)),
                sets: Arc::new(Mutex::new(Vec::new())),
                sticky: false,
            }
        }
    }

    #[async_trait]
    impl VolumeControl for FakeVolume {
        async fn current_volume(&self) -> Result<u8, VolumeError> {
            Ok(*self.level.lock().unwrap())
        }

        async fn set_volume(&self, percent: u8) -> Result<(), VolumeError> {
            self.sets.lock().unwrap().push(percent);
            if !self.sticky {
                *self.level.lock().unwrap() = percent;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn apply_then_restore() {
        let fake = FakeVolume::new(80);
        let level = fake.level.clone();
        let keeper = VolumeKeeper::new(fake, 40);

        keeper.apply_requested().await.unwrap();
        assert_eq!(*level.lock().unwrap(), 40);
        assert_eq!(keeper.saved_volume(), Some(80));

        keeper.restore_saved().await.unwrap();
        assert_eq!(*level.lock().unwrap(), 80);
        assert_eq!(keeper.saved_volume(), None);
    }

    #[tokio::test]
    async fn apply_is_only_done_once_until_restored() {
        let fake = FakeVolume::new(80);
        let sets = fake.sets.clone();
        let keeper = VolumeKeeper::new(fake, 40);

        keeper.apply_requested().await.unwrap();
        keeper.apply_requested().await.unwrap();
        assert_eq!(*sets.lock().unwrap(), vec![40]);
        assert_eq!(keeper.saved_volume(), Some(80));
    }

    #[tokio::test]
    async fn restore_without_apply_does_nothing() {
        let fake = FakeVolume::new(80);
        let sets = fake.sets.clone();
        let keeper = VolumeKeeper::new(fake, 40);

        keeper.restore_saved().await.unwrap();
        assert!(sets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unapplied_volume_is_reported() {
        let mut fake = FakeVolume::new(80);
        fake.sticky = true;
        let keeper = VolumeKeeper::new(fake, 40);

        let err = keeper.apply_requested().await.unwrap_err();
        assert!(matches!(
            err,
            VolumeError::NotApplied {
                requested: 40,
                actual: 80
            }
        ));
        assert_eq!(keeper.saved_volume(), None);
    }

    #[test]
    fn parse_volume_reply_reads_result() {
        let reply = json!({"id": 1, "jsonrpc": "2.0", "result": {"muted": false, "volume": 63}});
        assert_eq!(parse_volume_reply(&reply).unwrap(), 63);

        let bad = json!({"id": 1, "jsonrpc": "2.0", "error": {"code": -32601}});
        assert!(parse_volume_reply(&bad).is_err());
    }
}
