//! Core engine of the agent execution gateway: session and prompt
//! orchestration, workspace/git plumbing, the model adapter cascade, and the
//! confined tool sandbox. Transports live in `gateway-server`; wire types in
//! `gateway-protocol`.

mod adapters;
mod classifier;
mod config;
mod error;
mod exec;
mod extract;
mod flags;
mod github;
mod history;
mod inflight;
mod models;
mod orchestrator;
mod prompt;
mod sandbox;
mod session;
mod store;
mod util;
mod workspace;

pub use adapters::AdapterKind;
pub use adapters::ModelAdapter;
pub use adapters::RuntimeSelector;
pub use adapters::http_api::HttpApiAdapter;
pub use adapters::remote::RemoteConversationAdapter;
pub use adapters::sdk::SdkAdapter;
pub use classifier::ClassifiedError;
pub use classifier::ErrorCode;
pub use classifier::classify;
pub use config::AGENT_NAME;
pub use config::AGENT_VERSION;
pub use config::Config;
pub use error::GatewayErr;
pub use error::Result;
pub use exec::ShellOutput;
pub use extract::extract_patches;
pub use extract::propose_file_write;
pub use github::GithubAutomation;
pub use github::IssueCommentSpec;
pub use github::NoopGithubAutomation;
pub use github::PullRequestSpec;
pub use history::DEFAULT_REPLAY_WINDOW;
pub use history::build_adapter_input;
pub use history::sanitize_exchange;
pub use inflight::InFlightRegistry;
pub use models::AdapterContext;
pub use models::AdapterEvent;
pub use models::AdapterMessage;
pub use models::AdapterResult;
pub use models::CostUsd;
pub use models::TokenUsage;
pub use models::resolve_model;
pub use orchestrator::ChannelSink;
pub use orchestrator::NullSink;
pub use orchestrator::OrchestratorError;
pub use orchestrator::PromptOrchestrator;
pub use orchestrator::Services;
pub use orchestrator::UpdateSink;
pub use prompt::ComposedPrompt;
pub use prompt::ContextFile;
pub use prompt::compose;
pub use sandbox::SandboxLimits;
pub use sandbox::ToolSandbox;
pub use session::AgentRole;
pub use session::Session;
pub use store::SessionStore;
pub use util::estimate_tokens;
pub use workspace::DiffStatus;
pub use workspace::GitInfo;
pub use workspace::PrepareOptions;
pub use workspace::Workspace;
pub use workspace::WorkspaceManager;
pub use workspace::collect_git_info;

#[cfg(feature = "test-support")]
pub use adapters::fake::FakeAdapter;
#[cfg(feature = "test-support")]
pub use adapters::fake::FakeBehavior;
