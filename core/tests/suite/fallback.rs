use std::sync::Arc;

use gateway_core::AdapterKind;
use gateway_core::ChannelSink;
use gateway_core::ClassifiedError;
use gateway_core::ErrorCode;
use gateway_core::ModelAdapter;
use gateway_protocol::ContentBlock;
use gateway_protocol::NewSessionParams;
use gateway_protocol::PromptParams;
use gateway_protocol::SessionUpdateParams;
use gateway_protocol::StopReason;
use gateway_protocol::UpdateStatus;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::common::Script;
use crate::common::ScriptedAdapter;
use crate::common::orchestrator_with;

#[tokio::test]
async fn second_adapter_serves_the_prompt_when_the_first_raises() {
    let dir = TempDir::new().unwrap();
    let failing = ScriptedAdapter::new(
        AdapterKind::Sdk,
        Script::Fail(ClassifiedError::new(ErrorCode::Unknown, "backend exploded")),
    );
    let succeeding = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Stream {
            deltas: vec!["hel".to_string(), "lo".to_string()],
        },
    );
    let orchestrator = orchestrator_with(
        dir.path().to_path_buf(),
        vec![
            failing.clone() as Arc<dyn ModelAdapter>,
            succeeding.clone() as Arc<dyn ModelAdapter>,
        ],
    );

    let created = orchestrator
        .new_session(NewSessionParams::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel::<SessionUpdateParams>(64);
    let result = orchestrator
        .run_prompt(
            PromptParams {
                session_id: created.session_id.clone(),
                content: vec![ContentBlock::text("say hello")],
                context_files: None,
                agent_context: None,
            },
            &ChannelSink(tx),
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert!(result.usage.output_tokens >= 1);
    assert_eq!(failing.seen_input().len(), 1);
    assert_eq!(succeeding.seen_input().len(), 1);

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }

    // Two working chunks in delta order, then exactly one completed update,
    // which is the last notification before the response.
    let working_texts: Vec<String> = updates
        .iter()
        .filter(|u| u.status == UpdateStatus::Working)
        .filter_map(|u| u.content.as_ref())
        .filter_map(|blocks| blocks.first())
        .filter_map(|block| block.as_text().map(str::to_string))
        .collect();
    assert_eq!(working_texts, vec!["hel".to_string(), "lo".to_string()]);

    let completed: Vec<_> = updates
        .iter()
        .filter(|u| u.status == UpdateStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(updates.last().unwrap().status, UpdateStatus::Completed);
    assert!(
        updates
            .iter()
            .any(|u| matches!(u.status, UpdateStatus::Thinking | UpdateStatus::Working))
    );
}

#[tokio::test]
async fn all_adapters_failing_surfaces_an_error_stop_reason() {
    let dir = TempDir::new().unwrap();
    let first = ScriptedAdapter::new(
        AdapterKind::Sdk,
        Script::Fail(ClassifiedError::new(ErrorCode::Unknown, "first down")),
    );
    let second = ScriptedAdapter::new(
        AdapterKind::HttpApi,
        Script::Fail(ClassifiedError::new(
            ErrorCode::InternalCliFailure,
            "second down",
        )),
    );
    let orchestrator = orchestrator_with(
        dir.path().to_path_buf(),
        vec![
            first as Arc<dyn ModelAdapter>,
            second as Arc<dyn ModelAdapter>,
        ],
    );

    let created = orchestrator
        .new_session(NewSessionParams::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel::<SessionUpdateParams>(64);
    let result = orchestrator
        .run_prompt(
            PromptParams {
                session_id: created.session_id,
                content: vec![ContentBlock::text("anything")],
                context_files: None,
                agent_context: None,
            },
            &ChannelSink(tx),
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Error);
    assert_eq!(result.summary.as_deref(), Some("second down"));

    let mut last = None;
    while let Ok(update) = rx.try_recv() {
        last = Some(update);
    }
    assert_eq!(last.unwrap().status, UpdateStatus::Error);
}
