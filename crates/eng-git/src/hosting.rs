use eng_core::types::CommentType;
use octocrab::Octocrab;

use crate::error::{HostingError, HostingResult};
use crate::retry::retry_with_backoff;

/// One comment tracked for the PR-Review sub-loop, pre-mapping into a
/// `PrReviewFix` row. Review-level comments (`comment_type = Review`) carry
/// no file/line; inline comments carry both; conversation comments carry
/// neither.
#[derive(Debug, Clone)]
pub struct PrComment {
    pub comment_id: i64,
    pub comment_type: CommentType,
    pub author: String,
    pub body: String,
    pub file_path: Option<String>,
    pub line: Option<i64>,
    pub diff_hunk: Option<String>,
    pub state: Option<String>,
}

/// Thin, typed wrapper over the git-hosting API, grounded on the teacher's
/// `octocrab`-based GitHub integration rather than shelling out to the `gh`
/// binary the spec names as an example (see DESIGN.md / SPEC_FULL.md §6.1).
#[derive(Clone)]
pub struct HostingClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    max_retries: u32,
}

impl HostingClient {
    pub fn new(token: String, owner: String, repo: String, max_retries: u32) -> HostingResult<Self> {
        let octocrab = Octocrab::builder().personal_token(token).build()?;
        Ok(Self { octocrab, owner, repo, max_retries })
    }

    pub fn from_env(token_env: &str, owner_env: &str, repo_env: &str, max_retries: u32) -> HostingResult<Self> {
        let token = std::env::var(token_env).map_err(|_| HostingError::MissingToken)?;
        let owner = std::env::var(owner_env)?;
        let repo = std::env::var(repo_env)?;
        Self::new(token, owner, repo, max_retries)
    }

    /// Create a PR (title, body, base) from the task's pushed branch head.
    /// Retried: PR creation can race a not-yet-visible push.
    pub async fn create_pr(&self, title: &str, body: &str, head: &str, base: &str) -> HostingResult<String> {
        retry_with_backoff(self.max_retries, || async {
            let pr = self
                .octocrab
                .pulls(&self.owner, &self.repo)
                .create(title, head, base)
                .body(body)
                .send()
                .await?;
            Ok(pr.html_url.map(|u| u.to_string()).unwrap_or_default())
        })
        .await
    }

    /// Top-level PR reviews (approve/request-changes/comment), mapped to
    /// `CommentType::Review`.
    pub async fn list_reviews(&self, pr_number: u64) -> HostingResult<Vec<PrComment>> {
        retry_with_backoff(self.max_retries, || async {
            let reviews = self
                .octocrab
                .pulls(&self.owner, &self.repo)
                .list_reviews(pr_number)
                .await?;
            Ok(reviews
                .into_iter()
                .filter(|r| r.body.as_deref().is_some_and(|b| !b.trim().is_empty()))
                .map(|r| PrComment {
                    comment_id: r.id.0 as i64,
                    comment_type: CommentType::Review,
                    author: r.user.map(|u| u.login).unwrap_or_default(),
                    body: r.body.unwrap_or_default(),
                    file_path: None,
                    line: None,
                    diff_hunk: None,
                    state: r.state.map(|s| format!("{s:?}")),
                })
                .collect())
        })
        .await
    }

    /// Inline review comments anchored to a file/line, mapped to
    /// `CommentType::Inline`.
    pub async fn list_inline_comments(&self, pr_number: u64) -> HostingResult<Vec<PrComment>> {
        retry_with_backoff(self.max_retries, || async {
            let comments = self
                .octocrab
                .pulls(&self.owner, &self.repo)
                .list_comments(Some(pr_number))
                .send()
                .await?;
            Ok(comments
                .items
                .into_iter()
                .map(|c| PrComment {
                    comment_id: c.id.0 as i64,
                    comment_type: CommentType::Inline,
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                    file_path: Some(c.path),
                    line: c.line.map(|l| l as i64),
                    diff_hunk: Some(c.diff_hunk),
                    state: None,
                })
                .collect())
        })
        .await
    }

    /// General conversation comments on the PR's issue thread, mapped to
    /// `CommentType::Conversation`. Bot-authored comments are skipped per
    /// §4.7.
    pub async fn list_conversation_comments(&self, pr_number: u64) -> HostingResult<Vec<PrComment>> {
        retry_with_backoff(self.max_retries, || async {
            let comments = self
                .octocrab
                .issues(&self.owner, &self.repo)
                .list_comments(pr_number)
                .send()
                .await?;
            Ok(comments
                .items
                .into_iter()
                .filter(|c| c.user.r#type != octocrab::models::UserType::Bot)
                .map(|c| PrComment {
                    comment_id: c.id.0 as i64,
                    comment_type: CommentType::Conversation,
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                    file_path: None,
                    line: None,
                    diff_hunk: None,
                    state: None,
                })
                .collect())
        })
        .await
    }

    /// Post a summary/finalisation comment on the PR's issue thread.
    pub async fn add_comment(&self, pr_number: u64, body: &str) -> HostingResult<()> {
        retry_with_backoff(self.max_retries, || async {
            self.octocrab
                .issues(&self.owner, &self.repo)
                .create_comment(pr_number, body)
                .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_token_gracefully() {
        let client = HostingClient::new(String::new(), "owner".into(), "repo".into(), 3);
        assert!(client.is_ok());
    }
}
