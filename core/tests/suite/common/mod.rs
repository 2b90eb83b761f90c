//! Shared fixtures: a scripted adapter and a services record rooted in a
//! temporary directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use gateway_core::AdapterContext;
use gateway_core::AdapterEvent;
use gateway_core::AdapterKind;
use gateway_core::AdapterMessage;
use gateway_core::AdapterResult;
use gateway_core::ClassifiedError;
use gateway_core::ComposedPrompt;
use gateway_core::Config;
use gateway_core::InFlightRegistry;
use gateway_core::ModelAdapter;
use gateway_core::NoopGithubAutomation;
use gateway_core::PromptOrchestrator;
use gateway_core::RuntimeSelector;
use gateway_core::Services;
use gateway_core::SessionStore;
use gateway_core::WorkspaceManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Script {
    Stream { deltas: Vec<String> },
    Fail(ClassifiedError),
    HangUntilCancelled,
}

/// Adapter that records every input queue it is handed and then plays back
/// its script.
pub struct ScriptedAdapter {
    kind: AdapterKind,
    script: Script,
    seen: Mutex<Vec<Vec<AdapterMessage>>>,
}

impl ScriptedAdapter {
    pub fn new(kind: AdapterKind, script: Script) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen_input(&self) -> Vec<Vec<AdapterMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn can_handle(&self, _ctx: &AdapterContext) -> bool {
        true
    }

    async fn run(
        &self,
        _prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        _ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError> {
        self.seen.lock().unwrap().push(input.to_vec());
        match &self.script {
            Script::Fail(err) => Err(err.clone()),
            Script::HangUntilCancelled => {
                cancel.cancelled().await;
                Err(ClassifiedError::cancelled())
            }
            Script::Stream { deltas } => {
                let _ = events.send(AdapterEvent::Started).await;
                let mut full_text = String::new();
                for delta in deltas {
                    full_text.push_str(delta);
                    let _ = events
                        .send(AdapterEvent::Delta {
                            text: delta.clone(),
                        })
                        .await;
                }
                let _ = events
                    .send(AdapterEvent::Completed {
                        full_text: full_text.clone(),
                        duration_ms: 1,
                    })
                    .await;
                Ok(AdapterResult {
                    full_text,
                    ..AdapterResult::default()
                })
            }
        }
    }
}

pub fn test_config(state_dir: PathBuf) -> Config {
    Config {
        state_dir,
        persistent_workspace_id: None,
        workspace_root: None,
        disable_streaming_sdk: false,
        force_http_api: false,
        skip_cli_check: true,
        max_patch_bytes: 200 * 1024,
        development_mode: false,
        running_as_root: false,
        api_key: None,
        github_token: None,
        http_port: None,
    }
}

/// An orchestrator whose selector holds exactly the given adapters.
pub fn orchestrator_with(
    state_dir: PathBuf,
    adapters: Vec<Arc<dyn ModelAdapter>>,
) -> PromptOrchestrator {
    let config = test_config(state_dir);
    let store = Arc::new(SessionStore::new(config.sessions_dir()));
    let workspaces = Arc::new(WorkspaceManager::new(&config));
    let services = Arc::new(Services {
        config: Arc::new(config),
        store,
        workspaces,
        selector: Arc::new(RuntimeSelector::with_adapters(adapters)),
        inflight: Arc::new(InFlightRegistry::new()),
        github: Arc::new(NoopGithubAutomation),
    });
    PromptOrchestrator::new(services)
}
