//! Session cloning: snapshot-copy semantics, divergence, and abort.

mod support;

use tokio_util::sync::CancellationToken;

use lm_core::config::SessionConfig;
use lm_session::{SessionError, SessionState};

use support::{runtime_with, StubEngine};

#[tokio::test]
async fn clone_copies_committed_history_at_clone_time() {
    let engine = StubEngine::replying("fallback");
    engine.script(&["r1"]);
    let runtime = runtime_with(engine);
    let session = runtime
        .create_session(SessionConfig::new().with_system_prompt("You are terse"))
        .await
        .expect("create");
    session.prompt_text("one").await.expect("prompt");

    let clone = session.try_clone().await.expect("clone");

    assert_eq!(clone.state(), SessionState::Ready);
    assert_ne!(clone.id(), session.id());
    assert_eq!(clone.max_tokens(), session.max_tokens());
    assert_eq!(clone.tokens_so_far(), session.tokens_so_far());
    assert_eq!(clone.sampling(), session.sampling());

    // Same turns by identity: the data is shared, the ownership is new.
    assert_eq!(
        clone.history().await.turn_ids(),
        session.history().await.turn_ids()
    );
}

#[tokio::test]
async fn clones_diverge_after_the_copy() {
    let engine = StubEngine::replying("fallback");
    engine.script(&["r1", "source reply", "clone reply"]);
    let runtime = runtime_with(engine);
    let session = runtime
        .create_session(SessionConfig::new().with_system_prompt("You are terse"))
        .await
        .expect("create");
    session.prompt_text("one").await.expect("prompt");

    let clone = session.try_clone().await.expect("clone");

    session.prompt_text("for source").await.expect("source prompt");
    clone.prompt_text("for clone").await.expect("clone prompt");

    let source_texts: Vec<String> =
        session.history().await.iter().map(|t| t.text()).collect();
    let clone_texts: Vec<String> =
        clone.history().await.iter().map(|t| t.text()).collect();

    assert_eq!(source_texts.len(), 5);
    assert_eq!(clone_texts.len(), 5);
    assert_eq!(source_texts[3], "for source");
    assert_eq!(clone_texts[3], "for clone");
    // The shared prefix is identical by identity.
    assert_eq!(
        session.history().await.turn_ids()[..3],
        clone.history().await.turn_ids()[..3]
    );
}

#[tokio::test]
async fn aborted_clone_leaves_both_sessions_untouched() {
    let runtime = runtime_with(StubEngine::replying("hi"));
    let session = runtime
        .create_session(SessionConfig::new().with_system_prompt("You are terse"))
        .await
        .expect("create");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = session
        .try_clone_with_signal(cancel)
        .await
        .expect_err("aborted clone");
    assert!(matches!(err, SessionError::Aborted));

    // The source is unaffected and still prompts normally.
    assert_eq!(session.state(), SessionState::Ready);
    session.prompt_text("still fine").await.expect("prompt");
}

#[tokio::test]
async fn destroyed_session_cannot_be_cloned() {
    let runtime = runtime_with(StubEngine::replying("hi"));
    let session = runtime
        .create_session(SessionConfig::new())
        .await
        .expect("create");

    session.destroy();
    let err = session.try_clone().await.expect_err("clone after destroy");
    assert!(matches!(err, SessionError::Destroyed));
}

#[tokio::test]
async fn destroying_the_source_does_not_destroy_the_clone() {
    let engine = StubEngine::replying("fallback");
    engine.script(&["r1", "clone survives"]);
    let runtime = runtime_with(engine);
    let session = runtime
        .create_session(SessionConfig::new().with_system_prompt("You are terse"))
        .await
        .expect("create");
    session.prompt_text("one").await.expect("prompt");

    let clone = session.try_clone().await.expect("clone");
    session.destroy();

    assert_eq!(clone.state(), SessionState::Ready);
    let reply = clone.prompt_text("hello?").await.expect("clone prompt");
    assert_eq!(reply.text(), "clone survives");
}
