use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::decoder::{Credentials, DecoderConfig, DEFAULT_AP_PORT, DEFAULT_PLAYER_NAME};
use crate::hooks::{JsonRpcVolume, PlaybackHooks, ProxyHooks, VolumeControl, VolumeKeeper};
use crate::session::DEFAULT_TRACK_URI_PREFIX;

/// pcm-proxy: serves decoder output to a local media player as WAV over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "pcm-proxy")]
pub struct Args {
    /// Path to the decoder executable.
    #[arg(long, env = "PCM_PROXY_DECODER")]
    pub decoder_path: PathBuf,

    /// Cache directory passed to the decoder.
    #[arg(long, env = "PCM_PROXY_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Access point port passed to the decoder.
    #[arg(long, default_value_t = DEFAULT_AP_PORT, env = "PCM_PROXY_AP_PORT")]
    pub ap_port: u16,

    /// Device name the decoder announces.
    #[arg(long, default_value = DEFAULT_PLAYER_NAME, env = "PCM_PROXY_PLAYER_NAME")]
    pub player_name: String,

    /// Account username for the decoder.
    #[arg(long, env = "PCM_PROXY_USERNAME")]
    pub username: Option<String>,

    /// Account password for the decoder.
    #[arg(long, env = "PCM_PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Port to listen on. 0 picks a free port.
    #[arg(long, default_value = "52308", env = "PCM_PROXY_PORT")]
    pub port: u16,

    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1", env = "PCM_PROXY_BIND")]
    pub bind: String,

    /// Seconds to wait before starting each track.
    #[arg(long, default_value = "0", env = "PCM_PROXY_INTER_TRACK_DELAY")]
    pub inter_track_delay: f64,

    /// Player volume (percent) to use while streaming. Unset leaves it alone.
    #[arg(long, env = "PCM_PROXY_INITIAL_VOLUME", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub initial_volume: Option<u8>,

    /// JSON-RPC endpoint of the media player, used for volume changes.
    #[arg(long, env = "PCM_PROXY_VOLUME_RPC_URL")]
    pub volume_rpc_url: Option<String>,

    /// Milliseconds to wait for a decoder to exit before killing it.
    #[arg(long, default_value = "2000", env = "PCM_PROXY_TERMINATE_GRACE_MS")]
    pub terminate_grace_ms: u64,

    /// Prefix turning a track id into the decoder's track URI.
    #[arg(long, default_value = DEFAULT_TRACK_URI_PREFIX, env = "PCM_PROXY_TRACK_URI_PREFIX")]
    pub track_uri_prefix: String,
}

impl Args {
    pub fn decoder_config(&self) -> DecoderConfig {
        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        DecoderConfig {
            binary: self.decoder_path.clone(),
            cache_dir: self.cache_dir.clone(),
            ap_port: self.ap_port,
            player_name: self.player_name.clone(),
            credentials,
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
        }
    }

    pub fn inter_track_delay(&self) -> Duration {
        if self.inter_track_delay.is_finite() && self.inter_track_delay > 0.0 {
            Duration::from_secs_f64(self.inter_track_delay)
        } else {
            Duration::ZERO
        }
    }

    /// Volume handling needs both a target volume and a way to reach the
    /// player.
    pub fn volume_keeper(&self) -> Option<VolumeKeeper<Box<dyn VolumeControl>>> {
        let requested = self.initial_volume?;
        let url = self.volume_rpc_url.as_ref()?;
        let control: Box<dyn VolumeControl> = Box::new(JsonRpcVolume::new(url.clone()));
        Some(VolumeKeeper::new(control, requested))
    }

    pub fn hooks(&self) -> Arc<dyn PlaybackHooks> {
        Arc::new(ProxyHooks::new(self.volume_keeper()))
    }
}
