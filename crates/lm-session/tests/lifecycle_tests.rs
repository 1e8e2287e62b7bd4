//! Session creation paths: availability resolution, download-gated
//! readiness, failure and retry, and aborted creation.

mod support;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lm_core::config::{SamplingParams, SessionConfig};
use lm_core::events::SessionEvent;
use lm_core::types::{InputKind, TurnSpec};
use lm_session::{
    Availability, CreateOptions, DownloadProgress, ModelRuntime, SessionError, SessionState,
};

use support::{runtime_with, StubDownloader, StubEngine};

#[tokio::test]
async fn available_model_creates_a_ready_session() {
    let runtime = runtime_with(StubEngine::replying("hello"));
    let session = runtime
        .create_session(SessionConfig::new().with_system_prompt("You are terse"))
        .await
        .expect("create");

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(runtime.active_sessions(), 1);
    assert!(session.tokens_so_far() > 0, "system turn is charged");
}

#[tokio::test]
async fn downloadable_model_reports_progress_then_ready() {
    let engine = StubEngine::replying("hi");
    let downloader = StubDownloader::downloadable(vec![
        DownloadProgress {
            received: 512,
            total: Some(2048),
        },
        DownloadProgress {
            received: 2048,
            total: Some(2048),
        },
    ]);
    let runtime = ModelRuntime::new(engine, downloader);

    let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
    let session = runtime
        .create_session_with(SessionConfig::new(), CreateOptions::with_monitor(monitor_tx))
        .await
        .expect("create");

    assert_eq!(session.state(), SessionState::Ready);

    let mut updates = Vec::new();
    while let Ok(event) = monitor_rx.try_recv() {
        updates.push(event);
    }
    assert_eq!(
        updates,
        vec![
            SessionEvent::DownloadProgress {
                received: 512,
                total: Some(2048),
            },
            SessionEvent::DownloadProgress {
                received: 2048,
                total: Some(2048),
            },
        ]
    );
}

#[tokio::test]
async fn download_failure_is_retryable() {
    let engine = StubEngine::replying("hi");
    let downloader = StubDownloader::flaky("connection reset");
    let runtime = ModelRuntime::new(engine, downloader.clone());

    let err = runtime
        .create_session(SessionConfig::new())
        .await
        .expect_err("first create fails");
    assert!(matches!(err, SessionError::NetworkFailure(_)));
    assert_eq!(downloader.attempts(), 1);

    // Availability did not latch to unavailable; the next attempt
    // downloads again and succeeds.
    assert_eq!(
        runtime.availability(&SessionConfig::new()).await,
        Availability::Downloadable
    );
    let session = runtime
        .create_session(SessionConfig::new())
        .await
        .expect("retry succeeds");
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(downloader.attempts(), 2);
}

#[tokio::test]
async fn unavailable_model_rejects_creation() {
    let runtime = ModelRuntime::new(StubEngine::replying("hi"), StubDownloader::unavailable());
    let err = runtime
        .create_session(SessionConfig::new())
        .await
        .expect_err("create fails");
    assert!(matches!(err, SessionError::Unsupported(_)));
}

#[tokio::test]
async fn cancelled_creation_is_rejected_with_aborted() {
    let runtime = runtime_with(StubEngine::replying("hi"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runtime
        .create_session_with(SessionConfig::new(), CreateOptions::with_cancel(cancel))
        .await
        .expect_err("create fails");
    assert!(matches!(err, SessionError::Aborted));
    assert_eq!(runtime.active_sessions(), 0);
}

#[tokio::test]
async fn invalid_configuration_fails_before_any_download() {
    let engine = StubEngine::replying("hi");
    let downloader = StubDownloader::downloadable(Vec::new());
    let runtime = ModelRuntime::new(engine, downloader.clone());

    let misplaced = SessionConfig::new()
        .with_initial_turns(vec![TurnSpec::user("hi"), TurnSpec::system("late")]);
    assert!(matches!(
        runtime.create_session(misplaced).await,
        Err(SessionError::InvalidConfiguration(_))
    ));

    let partial_sampling = SessionConfig {
        sampling: SamplingParams {
            temperature: Some(0.5),
            top_k: None,
        },
        ..SessionConfig::default()
    };
    assert!(matches!(
        runtime.create_session(partial_sampling).await,
        Err(SessionError::InvalidConfiguration(_))
    ));

    assert_eq!(downloader.attempts(), 0, "validation precedes downloads");
}

#[tokio::test]
async fn unsupported_expectations_fail_before_any_download() {
    let engine = StubEngine::replying("hi"); // text-only, English-only
    let downloader = StubDownloader::downloadable(Vec::new());
    let runtime = ModelRuntime::new(engine, downloader.clone());

    let wants_audio =
        SessionConfig::new().with_expected_inputs(vec![InputKind::Text, InputKind::Audio]);
    assert!(matches!(
        runtime.create_session(wants_audio).await,
        Err(SessionError::Unsupported(_))
    ));

    let wants_french =
        SessionConfig::new().with_expected_languages(vec!["fr-FR".to_string()]);
    assert!(matches!(
        runtime.create_session(wants_french).await,
        Err(SessionError::Unsupported(_))
    ));

    assert_eq!(downloader.attempts(), 0);
}

#[tokio::test]
async fn destroy_is_idempotent_and_rejects_later_operations() {
    let runtime = runtime_with(StubEngine::replying("hi"));
    let session = runtime
        .create_session(SessionConfig::new())
        .await
        .expect("create");

    let mut events = session.subscribe();
    session.destroy();
    session.destroy();

    assert_eq!(session.state(), SessionState::Destroyed);
    assert_eq!(events.recv().await, Some(SessionEvent::Destroyed));
    // Exactly one destroyed event despite the repeated call.
    assert!(events.try_recv().is_none());

    let err = session
        .prompt(vec![TurnSpec::user("anyone there?")])
        .await
        .expect_err("prompt after destroy");
    assert!(matches!(err, SessionError::Destroyed));

    assert!(matches!(
        session.count_prompt_tokens(&[TurnSpec::user("hm")]),
        Err(SessionError::Destroyed)
    ));
    assert_eq!(runtime.active_sessions(), 0);
}

#[tokio::test]
async fn session_states_serialize_with_snake_case_tags() {
    let ready = serde_json::to_string(&SessionState::Ready).expect("serialize");
    assert_eq!(ready, r#"{"state":"ready"}"#);

    let downloading = serde_json::to_string(&SessionState::Downloading {
        received: 512,
        total: Some(2048),
    })
    .expect("serialize");
    assert!(downloading.contains(r#""state":"downloading""#));
}

#[tokio::test]
async fn runtime_shutdown_destroys_created_sessions() {
    let runtime = runtime_with(StubEngine::replying("hi"));
    let session = runtime
        .create_session(SessionConfig::new())
        .await
        .expect("create");
    assert_eq!(runtime.active_sessions(), 1);

    runtime.shutdown();
    assert_eq!(runtime.active_sessions(), 0);

    let err = session
        .prompt(vec![TurnSpec::user("still there?")])
        .await
        .expect_err("prompt after shutdown");
    assert!(matches!(err, SessionError::Destroyed));
}
