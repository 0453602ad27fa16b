use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, warn};

pub const DEFAULT_AP_PORT: u16 = 54443;
pub const DEFAULT_PLAYER_NAME: &str = "temp-spotty";
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

const REDACTED: &str = "****";

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("failed to spawn decoder {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("decoder stdout was not captured")]
    NoStdout,
    #[error("decoder read failed: {0}")]
    Read(#[from] std::io::Error),
}

/// Account the decoder logs in with.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

/// Everything needed to invoke the external decoder binary.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub binary: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub ap_port: u16,
    pub player_name: String,
    pub credentials: Option<Credentials>,
    /// How long to wait after a graceful terminate before killing by pid.
    pub terminate_grace: Duration,
}

impl DecoderConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cache_dir: None,
            ap_port: DEFAULT_AP_PORT,
            player_name: DEFAULT_PLAYER_NAME.to_string(),
            credentials: None,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

/// Argument vector for one decoder run, plus a copy safe to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderArgs {
    pub args: Vec<String>,
    pub loggable: Vec<String>,
}

impl DecoderArgs {
    fn push(&mut self, arg: impl Into<String>) {
        let arg = arg.into();
        self.loggable.push(arg.clone());
        self.args.push(arg);
    }

    fn push_secret(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
        self.loggable.push(REDACTED.to_string());
    }
}

impl DecoderConfig {
    pub fn build_args(
        &self,
        track_uri: &str,
        extra_args: &[String],
        use_credentials: bool,
    ) -> DecoderArgs {
        let mut out = DecoderArgs {
            args: Vec::new(),
            loggable: Vec::new(),
        };

        if let Some(cache_dir) = &self.cache_dir {
            out.push("--cache");
            out.push(cache_dir.to_string_lossy());
        }
        out.push("--ap-port");
        out.push(self.ap_port.to_string());
        out.push("--enable-audio-cache");
        out.push("--name");
        out.push(self.player_name.as_str());

        for arg in extra_args {
            out.push(arg.as_str());
        }
        out.push("--single-track");
        out.push(track_uri);

        if use_credentials {
            match &self.credentials {
                Some(creds) => {
                    out.push("-u");
                    out.push(creds.username.as_str());
                    out.push("-p");
                    out.push_secret(creds.password.as_str());
                }
                None => warn!("Decoder credentials requested but none are configured"),
            }
        }

        out
    }
}

/// How a call to [`DecoderHandle::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited on its own and was reaped.
    AlreadyExited,
    /// The process exited after the graceful terminate request.
    TerminatedGracefully,
    /// The graceful request did not work; the process was killed by pid.
    ForceKilled,
    /// Even the kill by pid could not be confirmed. The process may leak.
    KillFailed,
    /// `terminate` had already run for this handle.
    AlreadyTerminated,
}

/// Launches decoder processes. Does not serialize launches itself; callers
/// must terminate the previous handle before asking for a new one.
#[derive(Clone)]
pub struct DecoderSupervisor {
    config: Arc<DecoderConfig>,
    live: Arc<AtomicUsize>,
}

impl DecoderSupervisor {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config: Arc::new(config),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of handles launched and not yet terminated.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn launch(
        &self,
        track_uri: &str,
        extra_args: &[String],
        use_credentials: bool,
    ) -> Result<DecoderHandle, DecoderError> {
        let args = self
            .config
            .build_args(track_uri, extra_args, use_credentials);
        let path = self.config.binary.display().to_string();
        debug!("Decoder args: {} {}", path, args.loggable.join(" "));

        let mut child = Command::new(&self.config.binary)
            .args(&args.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DecoderError::Spawn {
                path: path.clone(),
                source,
            })?;

        let pid = child.id();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(DecoderError::NoStdout);
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("decoder[{}]: {}", pid.unwrap_or_default(), line);
                }
            });
        }

        let previously_live = self.live.fetch_add(1, Ordering::SeqCst);
        if previously_live > 0 {
            warn!(
                "Launched decoder while {} other handle(s) are still live",
                previously_live
            );
        }
        info!("Started decoder pid {:?} for {}", pid, track_uri);

        Ok(DecoderHandle {
            child,
            pid,
            stdout,
            terminated: false,
            grace: self.config.terminate_grace,
            live: self.live.clone(),
        })
    }
}

/// One running decoder process and its stdout pipe.
pub struct DecoderHandle {
    child: Child,
    pid: Option<u32>,
    stdout: ChildStdout,
    terminated: bool,
    grace: Duration,
    live: Arc<AtomicUsize>,
}

impl DecoderHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Read up to `n` bytes. Returns fewer only when the decoder hit EOF, and
    /// an empty buffer once it has nothing left.
    pub async fn read(&mut self, n: usize) -> Result<Bytes, DecoderError> {
        if self.terminated || n == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = Vec::with_capacity(n);
        (&mut self.stdout)
            .take(n as u64)
            .read_to_end(&mut buf)
            .await?;
        Ok(Bytes::from(buf))
    }

    /// Read and drop `n` bytes. Returns how many were actually dropped.
    pub async fn discard(&mut self, n: u64) -> Result<u64, DecoderError> {
        if self.terminated || n == 0 {
            return Ok(0);
        }
        let mut limited = (&mut self.stdout).take(n);
        let dropped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        Ok(dropped)
    }

    /// Stop the process and reap it. Safe to call repeatedly.
    pub async fn terminate(&mut self) -> TerminateOutcome {
        if self.terminated {
            return TerminateOutcome::AlreadyTerminated;
        }
        let outcome = self.shut_down().await;
        self.terminated = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!("Decoder pid {:?} terminate outcome: {:?}", self.pid, outcome);
        outcome
    }

    async fn shut_down(&mut self) -> TerminateOutcome {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Decoder pid {:?} already exited: {}", self.pid, status);
                return TerminateOutcome::AlreadyExited;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not poll decoder pid {:?}: {}", self.pid, e),
        }

        if let Err(e) = self.request_exit() {
            warn!("Graceful terminate of decoder pid {:?} failed: {}", self.pid, e);
        }
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(_)) => return TerminateOutcome::TerminatedGracefully,
            Ok(Err(e)) => warn!("Waiting for decoder pid {:?} failed: {}", self.pid, e),
            Err(_) => warn!(
                "Decoder pid {:?} still running {:?} after terminate, killing it",
                self.pid, self.grace
            ),
        }

        if let Err(e) = self.force_kill() {
            warn!("Kill of decoder pid {:?} failed: {}", self.pid, e);
        }
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(_)) => TerminateOutcome::ForceKilled,
            Ok(Err(e)) => {
                error!("Decoder pid {:?} could not be reaped: {}", self.pid, e);
                TerminateOutcome::KillFailed
            }
            Err(_) => {
                error!("Decoder pid {:?} survived a kill", self.pid);
                TerminateOutcome::KillFailed
            }
        }
    }

    // The child has not been reaped while these run, so the pid still refers
    // to our process.
    #[cfg(unix)]
    fn request_exit(&mut self) -> std::io::Result<()> {
        match self.pid {
            Some(pid) => signal_pid(pid, libc::SIGTERM),
            None => self.child.start_kill(),
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    #[cfg(unix)]
    fn force_kill(&mut self) -> std::io::Result<()> {
        match self.pid {
            Some(pid) => signal_pid(pid, libc::SIGKILL),
            None => self.child.start_kill(),
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        if !self.terminated {
            // kill_on_drop takes care of the process itself.
            warn!("Decoder pid {:?} dropped without terminate", self.pid);
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}
