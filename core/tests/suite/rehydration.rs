use gateway_core::AdapterKind;
use gateway_core::NullSink;
use gateway_core::Session;
use gateway_core::SessionStore;
use gateway_protocol::ContentBlock;
use gateway_protocol::Exchange;
use gateway_protocol::PromptParams;
use gateway_protocol::Role;
use gateway_protocol::SessionMode;
use gateway_protocol::SessionOptions;
use gateway_protocol::StopReason;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::common::Script;
use crate::common::ScriptedAdapter;
use crate::common::orchestrator_with;

fn prompt_params(session_id: &str, text: &str) -> PromptParams {
    PromptParams {
        session_id: session_id.to_string(),
        content: vec![ContentBlock::text(text)],
        context_files: None,
        agent_context: None,
    }
}

/// Persist a session with a scripted history so `run_prompt` has to load it
/// from the store, exactly like a resumed session.
async fn seed_session(state_dir: &std::path::Path, history: Vec<Exchange>) -> String {
    let mut session = Session::new(SessionMode::Conversation, SessionOptions::default(), None);
    session.message_history = history;
    let store = SessionStore::new(state_dir.join("sessions"));
    store.save(&session).await.unwrap();
    session.id
}

#[tokio::test]
async fn tail_of_long_history_is_replayed_before_the_prompt() {
    let dir = TempDir::new().unwrap();
    let history: Vec<Exchange> = (0..40)
        .map(|i| Exchange {
            role: if i % 2 == 0 { Role::User } else { Role::Assistant },
            content: vec![ContentBlock::text(format!("Message {i}"))],
        })
        .collect();
    let session_id = seed_session(dir.path(), history).await;

    let adapter = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec!["ok".to_string()],
        },
    );
    let orchestrator = orchestrator_with(dir.path().to_path_buf(), vec![adapter.clone()]);

    let result = orchestrator
        .run_prompt(prompt_params(&session_id, "continue"), &NullSink)
        .await
        .unwrap();
    assert_eq!(result.stop_reason, StopReason::Completed);

    let seen = adapter.seen_input();
    assert_eq!(seen.len(), 1);
    let input = &seen[0];
    assert_eq!(input.len(), 31);
    assert_eq!(input[0].text(), "Message 10");
    assert_eq!(input[0].role, Role::User);
    assert_eq!(input[29].text(), "Message 39");
    assert_eq!(input[30].text(), "continue");
    assert_eq!(input[30].role, Role::User);
}

#[tokio::test]
async fn non_input_blocks_are_stripped_from_replayed_exchanges() {
    let dir = TempDir::new().unwrap();
    let history = vec![Exchange {
        role: Role::Assistant,
        content: vec![
            ContentBlock::text("Thinking about tools..."),
            ContentBlock::Thought {
                thought: "tool invocation bookkeeping".to_string(),
            },
        ],
    }];
    let session_id = seed_session(dir.path(), history).await;

    let adapter = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec!["ok".to_string()],
        },
    );
    let orchestrator = orchestrator_with(dir.path().to_path_buf(), vec![adapter.clone()]);

    orchestrator
        .run_prompt(prompt_params(&session_id, "go on"), &NullSink)
        .await
        .unwrap();

    let input = &adapter.seen_input()[0];
    assert_eq!(input.len(), 2);
    assert_eq!(input[0].role, Role::Assistant);
    assert_eq!(
        input[0].content,
        vec![ContentBlock::text("Thinking about tools...")]
    );
    assert_eq!(input[1].text(), "go on");
}

#[tokio::test]
async fn history_is_replayed_only_once_per_loaded_session() {
    let dir = TempDir::new().unwrap();
    let history = vec![Exchange {
        role: Role::User,
        content: vec![ContentBlock::text("stored exchange")],
    }];
    let session_id = seed_session(dir.path(), history).await;

    let adapter = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec!["reply".to_string()],
        },
    );
    let orchestrator = orchestrator_with(dir.path().to_path_buf(), vec![adapter.clone()]);

    orchestrator
        .run_prompt(prompt_params(&session_id, "first"), &NullSink)
        .await
        .unwrap();
    orchestrator
        .run_prompt(prompt_params(&session_id, "second"), &NullSink)
        .await
        .unwrap();

    let seen = adapter.seen_input();
    assert_eq!(seen.len(), 2);
    // First prompt replays the stored exchange; the second carries only the
    // new prompt because the session's history has already been replayed.
    assert_eq!(seen[0].len(), 2);
    assert_eq!(seen[0][0].text(), "stored exchange");
    assert_eq!(seen[1].len(), 1);
    assert_eq!(seen[1][0].text(), "second");
}
