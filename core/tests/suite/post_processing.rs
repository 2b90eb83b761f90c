use std::path::Path;

use gateway_core::AdapterKind;
use gateway_core::NullSink;
use gateway_protocol::ContentBlock;
use gateway_protocol::NewSessionParams;
use gateway_protocol::PromptParams;
use gateway_protocol::StopReason;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::common::Script;
use crate::common::ScriptedAdapter;
use crate::common::orchestrator_with;

fn prompt(session_id: &str, text: &str) -> PromptParams {
    PromptParams {
        session_id: session_id.to_string(),
        content: vec![ContentBlock::text(text)],
        context_files: None,
        agent_context: None,
    }
}

fn files_under(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

#[tokio::test]
async fn conversational_response_mutates_no_files() {
    let dir = TempDir::new().unwrap();
    // The response mentions no fenced code block, so even with a filename in
    // the prompt nothing may be written.
    let adapter = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec![
                "Sure, set the background property of the body selector to red.".to_string(),
            ],
        },
    );
    let orchestrator = orchestrator_with(dir.path().to_path_buf(), vec![adapter]);

    let created = orchestrator
        .new_session(NewSessionParams::default())
        .await
        .unwrap();
    let workspace_root = std::path::PathBuf::from(created.workspace_info.root_path.clone());

    let before = files_under(&workspace_root);
    let result = orchestrator
        .run_prompt(
            prompt(&created.session_id, "Make background red in styles.css"),
            &NullSink,
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert!(result.summary.is_none());
    assert_eq!(files_under(&workspace_root), before);
}

#[tokio::test]
async fn fenced_block_with_inferred_filename_writes_the_file() {
    let dir = TempDir::new().unwrap();
    let adapter = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec!["```css\nbody { background: red; }\n```\n".to_string()],
        },
    );
    let orchestrator = orchestrator_with(dir.path().to_path_buf(), vec![adapter]);

    let created = orchestrator
        .new_session(NewSessionParams::default())
        .await
        .unwrap();
    let workspace_root = std::path::PathBuf::from(created.workspace_info.root_path.clone());

    let result = orchestrator
        .run_prompt(
            prompt(&created.session_id, "Make background red in styles.css"),
            &NullSink,
        )
        .await
        .unwrap();

    assert_eq!(result.summary.as_deref(), Some("wrote styles.css"));
    let written = tokio::fs::read_to_string(workspace_root.join("styles.css"))
        .await
        .unwrap();
    assert_eq!(written, "body { background: red; }\n");
}

#[tokio::test]
async fn session_history_records_both_sides_of_the_exchange() {
    let dir = TempDir::new().unwrap();
    let adapter = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec!["the answer".to_string()],
        },
    );
    let orchestrator = orchestrator_with(dir.path().to_path_buf(), vec![adapter]);

    let created = orchestrator
        .new_session(NewSessionParams::default())
        .await
        .unwrap();
    orchestrator
        .run_prompt(prompt(&created.session_id, "the question"), &NullSink)
        .await
        .unwrap();

    let loaded = orchestrator
        .load_session(gateway_protocol::LoadSessionParams {
            session_id: created.session_id.clone(),
        })
        .await
        .unwrap();
    assert!(loaded.history_available);
    let history = loaded.history.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, vec![ContentBlock::text("the question")]);
    assert_eq!(history[1].content, vec![ContentBlock::text("the answer")]);
}
