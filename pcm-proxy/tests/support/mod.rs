#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use pcm_proxy::decoder::{DecoderConfig, DecoderSupervisor};
use pcm_proxy::hooks::PlaybackHooks;
use tempfile::TempDir;

/// Behaves like the decoder for a handful of well-known track ids, picked
/// from the `--single-track` argument.
const FAKE_DECODER: &str = r#"#!/bin/sh
track=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--single-track" ]; then
        track="$2"
    fi
    shift
done
case "$track" in
    *:full) exec head -c 1764000 /dev/zero ;;
    *:short) exec head -c 5000 /dev/zero ;;
    *:endless) exec cat /dev/zero ;;
    *:sleepy) exec sleep 30 ;;
    *:stubborn)
        trap '' TERM
        printf x
        while :; do sleep 1; done
        ;;
    *) exit 0 ;;
esac
"#;

pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Path of the fake decoder. Written once per test binary, before any test
/// spawns a process, so exec never races an open write handle.
pub fn fake_decoder() -> PathBuf {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    let dir = DIR.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake-decoder");
        std::fs::write(&path, FAKE_DECODER).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        dir
    });
    dir.path().join("fake-decoder")
}

pub fn supervisor() -> DecoderSupervisor {
    supervisor_with_grace(Duration::from_secs(2))
}

pub fn supervisor_with_grace(grace: Duration) -> DecoderSupervisor {
    let mut config = DecoderConfig::new(fake_decoder());
    config.terminate_grace = grace;
    DecoderSupervisor::new(config)
}

pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the pid exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub before_stream: AtomicUsize,
    pub full_requests: AtomicUsize,
    pub finished: Mutex<Vec<String>>,
    /// Stalls the next full-resource request, like a slow volume restore.
    pub full_request_delay: Mutex<Option<Duration>>,
}

impl RecordingHooks {
    pub fn finished_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }

    /// Poll until `n` tracks have finished, or panic after a few seconds.
    pub async fn wait_finished(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.finished_count() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} of {} tracks finished",
                self.finished_count(),
                n
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl PlaybackHooks for RecordingHooks {
    async fn before_stream(&self) {
        self.before_stream.fetch_add(1, Ordering::SeqCst);
    }

    async fn full_resource_requested(&self) {
        self.full_requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.full_request_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn track_finished(&self, track_id: &str) {
        self.finished.lock().unwrap().push(track_id.to_string());
    }
}
