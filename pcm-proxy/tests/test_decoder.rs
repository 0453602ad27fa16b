#![cfg(unix)]
mod support;

use std::time::Duration;

use pcm_proxy::decoder::TerminateOutcome;
use support::{pid_alive, supervisor, supervisor_with_grace, tracing_init};

#[tokio::test]
async fn reads_until_the_decoder_runs_dry() {
    tracing_init();
    let supervisor = supervisor();
    let mut handle = supervisor.launch("spotify:track:short", &[], false).unwrap();

    let first = handle.read(3000).await.unwrap();
    assert_eq!(first.len(), 3000);
    let rest = handle.read(3000).await.unwrap();
    assert_eq!(rest.len(), 2000);
    assert!(handle.read(3000).await.unwrap().is_empty());

    handle.terminate().await;
    assert_eq!(supervisor.live_handles(), 0);
}

#[tokio::test]
async fn discard_reports_how_much_was_dropped() {
    tracing_init();
    let supervisor = supervisor();
    let mut handle = supervisor.launch("spotify:track:short", &[], false).unwrap();

    assert_eq!(handle.discard(1000).await.unwrap(), 1000);
    assert_eq!(handle.discard(10_000).await.unwrap(), 4000);
    handle.terminate().await;
}

#[tokio::test]
async fn running_decoder_terminates_gracefully() {
    tracing_init();
    let supervisor = supervisor();
    let mut handle = supervisor.launch("spotify:track:sleepy", &[], false).unwrap();
    let pid = handle.pid().unwrap();
    assert!(pid_alive(pid));
    assert_eq!(supervisor.live_handles(), 1);

    assert_eq!(
        handle.terminate().await,
        TerminateOutcome::TerminatedGracefully
    );
    assert!(!pid_alive(pid));
    assert_eq!(supervisor.live_handles(), 0);
}

#[tokio::test]
async fn decoder_ignoring_terminate_is_killed() {
    tracing_init();
    let supervisor = supervisor_with_grace(Duration::from_millis(300));
    let mut handle = supervisor
        .launch("spotify:track:stubborn", &[], false)
        .unwrap();
    let pid = handle.pid().unwrap();

    // The script prints once its TERM trap is in place.
    assert_eq!(&handle.read(1).await.unwrap()[..], b"x");

    assert_eq!(handle.terminate().await, TerminateOutcome::ForceKilled);
    assert!(!pid_alive(pid));
    assert_eq!(supervisor.live_handles(), 0);
}

#[tokio::test]
async fn exited_decoder_is_only_reaped() {
    tracing_init();
    let supervisor = supervisor();
    let mut handle = supervisor.launch("spotify:track:quick", &[], false).unwrap();

    assert!(handle.read(16).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(handle.terminate().await, TerminateOutcome::AlreadyExited);
    assert!(handle.is_terminated());
}

#[tokio::test]
async fn terminate_twice_is_harmless() {
    tracing_init();
    let supervisor = supervisor();
    let mut handle = supervisor.launch("spotify:track:sleepy", &[], false).unwrap();

    handle.terminate().await;
    assert_eq!(
        handle.terminate().await,
        TerminateOutcome::AlreadyTerminated
    );
    assert!(handle.read(10).await.unwrap().is_empty());
    assert_eq!(supervisor.live_handles(), 0);
}

#[tokio::test]
async fn live_handles_counts_unterminated_decoders() {
    tracing_init();
    let supervisor = supervisor();
    let mut a = supervisor.launch("spotify:track:sleepy", &[], false).unwrap();
    let mut b = supervisor.launch("spotify:track:sleepy", &[], false).unwrap();
    assert_eq!(supervisor.live_handles(), 2);

    a.terminate().await;
    assert_eq!(supervisor.live_handles(), 1);
    b.terminate().await;
    assert_eq!(supervisor.live_handles(), 0);
}

#[tokio::test]
async fn dropped_handle_is_no_longer_counted() {
    tracing_init();
    let supervisor = supervisor();
    let handle = supervisor.launch("spotify:track:sleepy", &[], false).unwrap();
    assert_eq!(supervisor.live_handles(), 1);
    drop(handle);
    assert_eq!(supervisor.live_handles(), 0);
}
