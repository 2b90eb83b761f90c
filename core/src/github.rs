//! GitHub automation capability.
//!
//! The REST client itself is an external collaborator; the orchestrator only
//! sees this trait. Deployments inject an implementation at startup, and the
//! default is a no-op that reports the capability as disabled.

use async_trait::async_trait;
use gateway_protocol::GithubOperation;

use crate::classifier::ClassifiedError;

#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub repository: String,
    pub base_branch: String,
    pub head_branch: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct IssueCommentSpec {
    pub repository: String,
    pub issue_number: u64,
    pub body: String,
}

#[async_trait]
pub trait GithubAutomation: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn create_or_update_pull_request(
        &self,
        spec: PullRequestSpec,
    ) -> Result<GithubOperation, ClassifiedError>;

    async fn comment_on_issue(
        &self,
        spec: IssueCommentSpec,
    ) -> Result<GithubOperation, ClassifiedError>;
}

pub struct NoopGithubAutomation;

#[async_trait]
impl GithubAutomation for NoopGithubAutomation {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_or_update_pull_request(
        &self,
        _spec: PullRequestSpec,
    ) -> Result<GithubOperation, ClassifiedError> {
        Ok(GithubOperation {
            operation: "create_pull_request".to_string(),
            success: false,
            detail: Some("github automation is not configured".to_string()),
        })
    }

    async fn comment_on_issue(
        &self,
        _spec: IssueCommentSpec,
    ) -> Result<GithubOperation, ClassifiedError> {
        Ok(GithubOperation {
            operation: "issue_comment".to_string(),
            success: false,
            detail: Some("github automation is not configured".to_string()),
        })
    }
}
