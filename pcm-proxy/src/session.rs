//! The long-lived streaming session.
//!
//! One session serves every track request. It holds the current track and its
//! synthesized header, and owns at most one running decoder. Any new stream,
//! track change or stop first cancels the running producer and waits until it
//! has terminated and reaped its decoder, so two decoders never run at once.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decoder::{DecoderError, DecoderHandle, DecoderSupervisor};
use crate::hooks::PlaybackHooks;
use crate::wav_header::ContainerHeader;

/// Largest chunk read from the decoder and handed to the HTTP body.
pub const CHUNK_SIZE: usize = 512 * 1024;
pub const DEFAULT_TRACK_URI_PREFIX: &str = "spotify:track:";

const STREAMING_ARGS: &[&str] = &[
    "--bitrate",
    "320",
    "--enable-volume-normalisation",
    "--normalisation-gain-type",
    "track",
    "--initial-volume",
    "50",
];

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no track has been set on the session")]
    NoTrack,
    #[error("track '{0}' was replaced by a newer request before streaming started")]
    Superseded(String),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HeaderSet,
    Streaming,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackRequest {
    pub track_id: String,
    pub duration_seconds: f64,
}

/// The accepted track and the header computed for it.
#[derive(Debug, Clone)]
pub struct CurrentTrack {
    pub request: TrackRequest,
    pub header: ContainerHeader,
}

impl CurrentTrack {
    pub fn total_length(&self) -> u64 {
        self.header.total_length()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Completed,
    DecoderExhausted,
    ConsumerGone,
    Preempted,
}

struct ActiveStream {
    generation: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    track: Option<Arc<CurrentTrack>>,
    active: Option<ActiveStream>,
}

struct Shared {
    supervisor: DecoderSupervisor,
    hooks: Arc<dyn PlaybackHooks>,
    track_uri_prefix: String,
    slot: tokio::sync::Mutex<Slot>,
    state: Mutex<SessionState>,
    generation: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Record how a stream ended, unless a newer stream has started since.
    fn finish(&self, generation: u64, state: SessionState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(state);
        }
    }

    /// Cancel the running producer, if any, and wait until its decoder has
    /// been reaped.
    async fn stop_active(&self, slot: &mut Slot) -> bool {
        let Some(active) = slot.active.take() else {
            return false;
        };
        debug!(
            "Stopping stream {} (decoder pid {:?})",
            active.generation, active.pid
        );
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            error!("Stream task {} failed: {}", active.generation, e);
            self.finish(active.generation, SessionState::Error);
        }
        true
    }
}

#[derive(Clone)]
pub struct AudioStreamSession {
    shared: Arc<Shared>,
}

impl AudioStreamSession {
    pub fn new(supervisor: DecoderSupervisor, hooks: Arc<dyn PlaybackHooks>) -> Self {
        Self::with_track_uri_prefix(supervisor, hooks, DEFAULT_TRACK_URI_PREFIX)
    }

    pub fn with_track_uri_prefix(
        supervisor: DecoderSupervisor,
        hooks: Arc<dyn PlaybackHooks>,
        track_uri_prefix: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                supervisor,
                hooks,
                track_uri_prefix: track_uri_prefix.into(),
                slot: tokio::sync::Mutex::new(Slot::default()),
                state: Mutex::new(SessionState::Idle),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn supervisor(&self) -> &DecoderSupervisor {
        &self.shared.supervisor
    }

    pub fn hooks(&self) -> &Arc<dyn PlaybackHooks> {
        &self.shared.hooks
    }

    pub async fn current_track(&self) -> Option<Arc<CurrentTrack>> {
        self.shared.slot.lock().await.track.clone()
    }

    /// Pid of the decoder attached to a stream that is still running.
    pub async fn decoder_pid(&self) -> Option<u32> {
        let slot = self.shared.slot.lock().await;
        slot.active
            .as_ref()
            .filter(|a| !a.task.is_finished())
            .and_then(|a| a.pid)
    }

    /// Stop whatever is streaming, wait for its decoder to be reaped, then
    /// accept the new track.
    pub async fn preempt_and_set_track(
        &self,
        track_id: &str,
        duration_seconds: f64,
    ) -> Arc<CurrentTrack> {
        let mut slot = self.shared.slot.lock().await;
        if self.shared.stop_active(&mut slot).await {
            info!("Preempted running stream for track '{}'", track_id);
        }

        let header = ContainerHeader::synthesize(duration_seconds);
        debug!(
            "Track '{}' set: duration {}s, length {} ({})",
            track_id,
            duration_seconds,
            header.total_length(),
            megabytes(header.total_length())
        );
        let track = Arc::new(CurrentTrack {
            request: TrackRequest {
                track_id: track_id.to_string(),
                duration_seconds,
            },
            header,
        });
        slot.track = Some(track.clone());
        self.shared.set_state(SessionState::HeaderSet);
        track
    }

    pub async fn set_track(&self, track_id: &str, duration_seconds: f64) -> Arc<CurrentTrack> {
        self.preempt_and_set_track(track_id, duration_seconds).await
    }

    /// Tear down any running decoder. Safe to call at any time.
    pub async fn stop(&self) {
        let mut slot = self.shared.slot.lock().await;
        if self.shared.stop_active(&mut slot).await {
            info!("Session stopped");
        }
    }

    /// Start streaming `range_len` bytes of the current track beginning at
    /// `range_start`.
    ///
    /// The decoder is launched before this returns, so a spawn failure is
    /// reported here rather than as an empty body. The returned stream ends
    /// early if the decoder runs dry or fails; it never yields an error.
    pub async fn send_range(
        &self,
        range_len: u64,
        range_start: u64,
    ) -> Result<AudioChunkStream, SessionError> {
        let mut slot = self.shared.slot.lock().await;
        let track = slot.track.clone().ok_or(SessionError::NoTrack)?;
        self.start_stream(&mut slot, track, range_len, range_start).await
    }

    /// Like [`Self::send_range`], but only if `track` is still the session's
    /// current track. A request whose track was replaced by a newer one while
    /// it was being prepared gets [`SessionError::Superseded`] and leaves the
    /// newer stream running.
    pub async fn send_track_range(
        &self,
        track: &Arc<CurrentTrack>,
        range_len: u64,
        range_start: u64,
    ) -> Result<AudioChunkStream, SessionError> {
        let mut slot = self.shared.slot.lock().await;
        match &slot.track {
            Some(current) if Arc::ptr_eq(current, track) => {}
            _ => {
                info!(
                    "Track '{}' superseded before streaming started",
                    track.request.track_id
                );
                return Err(SessionError::Superseded(
                    track.request.track_id.clone(),
                ));
            }
        }
        self.start_stream(&mut slot, track.clone(), range_len, range_start).await
    }

    async fn start_stream(
        &self,
        slot: &mut Slot,
        track: Arc<CurrentTrack>,
        range_len: u64,
        range_start: u64,
    ) -> Result<AudioChunkStream, SessionError> {
        self.shared.stop_active(slot).await;

        let track_id = &track.request.track_id;
        debug!(
            "Start transfer for track '{}' - range start: {}",
            track_id, range_start
        );

        self.shared.hooks.before_stream().await;

        let track_uri = format!("{}{}", self.shared.track_uri_prefix, track_id);
        let extra_args: Vec<String> = STREAMING_ARGS.iter().map(|s| s.to_string()).collect();
        let handle = match self.shared.supervisor.launch(&track_uri, &extra_args, true) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Could not start decoder for track '{}': {}", track_id, e);
                self.shared.set_state(SessionState::Error);
                return Err(e.into());
            }
        };
        debug!(
            "Reading audio for '{}', length = {} ({})",
            track_uri,
            track.total_length(),
            megabytes(track.total_length())
        );

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = handle.pid();
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let producer = Producer {
            shared: self.shared.clone(),
            handle,
            track,
            range_len,
            range_start,
            tx,
            cancel: cancel.clone(),
            generation,
        };

        self.shared.set_state(SessionState::Streaming);
        let task = tokio::spawn(producer.run());
        slot.active = Some(ActiveStream {
            generation,
            pid,
            cancel,
            task,
        });

        Ok(AudioChunkStream {
            inner: ReceiverStream::new(rx),
        })
    }
}

/// Body chunks for one range request, in order.
pub struct AudioChunkStream {
    inner: ReceiverStream<Bytes>,
}

impl Stream for AudioChunkStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|c| c.map(Ok))
    }
}

/// Owns the decoder for one stream and always tears it down, whichever way
/// the stream ends.
struct Producer {
    shared: Arc<Shared>,
    handle: DecoderHandle,
    track: Arc<CurrentTrack>,
    range_len: u64,
    range_start: u64,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    generation: u64,
}

impl Producer {
    async fn run(self) {
        let Producer {
            shared,
            mut handle,
            track,
            range_len,
            range_start,
            tx,
            cancel,
            generation,
        } = self;
        let track_id = track.request.track_id.as_str();
        let total = track.total_length();
        let mut sent: u64 = 0;

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(StreamEnd::Preempted),
            _ = tx.closed() => Ok(StreamEnd::ConsumerGone),
            r = pump(&mut handle, &tx, &track, range_len, range_start, &mut sent) => r,
        };

        let outcome = handle.terminate().await;
        debug!("Decoder for track '{}' terminated: {:?}", track_id, outcome);

        match &end {
            Ok(StreamEnd::Completed) => info!(
                "Finished sending track '{}' - range start {} - sent {} ({})",
                track_id,
                range_start,
                sent,
                megabytes(sent)
            ),
            Ok(StreamEnd::DecoderExhausted) => warn!(
                "Decoder for track '{}' ran dry - range start {} - sent {} of {} ({})",
                track_id,
                range_start,
                sent,
                range_len,
                progress(sent, total)
            ),
            Ok(StreamEnd::ConsumerGone) => info!(
                "Client stopped reading track '{}' - range start {} - sent {}",
                track_id, range_start, sent
            ),
            Ok(StreamEnd::Preempted) => info!(
                "Stream for track '{}' preempted - range start {} - sent {}",
                track_id, range_start, sent
            ),
            Err(e) => error!(
                "Error sending track '{}' - range start {} - sent {} ({}): {}",
                track_id,
                range_start,
                sent,
                megabytes(sent),
                e
            ),
        }

        shared.hooks.track_finished(track_id).await;
        let state = if end.is_ok() {
            SessionState::Done
        } else {
            SessionState::Error
        };
        shared.finish(generation, state);
        drop(tx);
    }
}

async fn pump(
    handle: &mut DecoderHandle,
    tx: &mpsc::Sender<Bytes>,
    track: &CurrentTrack,
    range_len: u64,
    range_start: u64,
    sent: &mut u64,
) -> Result<StreamEnd, DecoderError> {
    if range_start == 0 {
        let header = track.header.bytes();
        let n = (header.len() as u64).min(range_len) as usize;
        if n > 0 {
            debug!("Sending wav header for track '{}'", track.request.track_id);
            if tx.send(Bytes::copy_from_slice(&header[..n])).await.is_err() {
                return Ok(StreamEnd::ConsumerGone);
            }
            *sent += n as u64;
        }
    } else {
        // The decoder cannot seek, so skip ahead by reading.
        let dropped = handle.discard(range_start).await?;
        if dropped < range_start {
            return Ok(StreamEnd::DecoderExhausted);
        }
    }

    while *sent < range_len {
        let want = (range_len - *sent).min(CHUNK_SIZE as u64) as usize;
        let chunk = handle.read(want).await?;
        if chunk.is_empty() {
            return Ok(StreamEnd::DecoderExhausted);
        }
        let n = chunk.len() as u64;
        if tx.send(chunk).await.is_err() {
            return Ok(StreamEnd::ConsumerGone);
        }
        *sent += n;
        debug!(
            "Continue sending track '{}' - {}",
            track.request.track_id,
            progress(*sent, track.total_length())
        );
    }
    Ok(StreamEnd::Completed)
}

fn megabytes(bytes: u64) -> String {
    format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
}

fn progress(sent: u64, total: u64) -> String {
    let percent = if total == 0 {
        100
    } else {
        sent.saturating_mul(100) / total
    };
    format!("sent so far: {:>5} ({:>3}%)", megabytes(sent), percent)
}
