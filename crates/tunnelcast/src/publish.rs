//! Publication of the tunnel address into the static site repository.
//!
//! The asset's assignment line is rewritten, committed and pushed. A run whose
//! address matches what is already committed creates no commit; a local
//! commit left behind by an earlier failed push is pushed again.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use tunnelcast_core::address::TunnelAddress;
use tunnelcast_core::asset::{AssetPattern, Rewrite};
use tunnelcast_core::config::PublishConfig;

use crate::cmd::{CmdOutput, run_cmd, try_cmd};
use crate::ssh::GitAuth;

/// How the publication step ended. None of these abort the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// No address, or no site repository configured.
    Skipped,
    /// The committed asset already embeds the address and nothing is waiting
    /// to be pushed.
    Unchanged,
    /// A new commit was created and pushed.
    Pushed,
    /// An earlier unpushed commit was pushed.
    RetriedPush,
    /// The commit exists locally but every push round was rejected.
    PushFailed,
    /// The asset could not be rewritten or committed.
    Failed(String),
}

/// Errors that stop publication before anything is pushed.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Asset(#[from] tunnelcast_core::Error),

    #[error("git {command} failed: {reason}")]
    Git { command: String, reason: String },
}

/// Git invocations inside the site checkout.
struct Git<'a> {
    repo: &'a Path,
    envs: Vec<(String, String)>,
}

impl<'a> Git<'a> {
    fn new(repo: &'a Path, auth: &GitAuth) -> Self {
        let mut envs = auth.envs().to_vec();
        envs.push(("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()));
        Self { repo, envs }
    }

    /// Run git and return its output whatever the exit status.
    async fn try_run(&self, args: &[&str]) -> Result<CmdOutput, PublishError> {
        try_cmd("git", args, Some(self.repo), &self.envs)
            .await
            .map_err(|e| PublishError::Git {
                command: args.join(" "),
                reason: e.to_string(),
            })
    }

    /// Run git, failing on a non-zero exit.
    async fn run(&self, description: &str, args: &[&str]) -> Result<String, PublishError> {
        run_cmd(description, "git", args, Some(self.repo), &self.envs)
            .await
            .map_err(|e| PublishError::Git {
                command: args.join(" "),
                reason: e.to_string(),
            })
    }
}

/// Publish `address` to the configured site repository.
pub async fn publish(
    address: Option<&TunnelAddress>,
    config: &PublishConfig,
    auth: &GitAuth,
) -> PublishOutcome {
    let Some(address) = address else {
        info!("no tunnel address; skipping publication");
        return PublishOutcome::Skipped;
    };
    let Some(repo) = config.repo.as_deref() else {
        info!("no site repository configured; skipping publication");
        return PublishOutcome::Skipped;
    };

    match publish_to(repo, address, config, auth).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(repo = %repo.display(), error = %e, "publication failed");
            PublishOutcome::Failed(e.to_string())
        }
    }
}

async fn publish_to(
    repo: &Path,
    address: &TunnelAddress,
    config: &PublishConfig,
    auth: &GitAuth,
) -> Result<PublishOutcome, PublishError> {
    let asset_path = repo.join(&config.asset);
    let asset_arg = config.asset.display().to_string();
    let git = Git::new(repo, auth);

    let content = std::fs::read_to_string(&asset_path).map_err(|source| PublishError::Io {
        path: asset_path.clone(),
        source,
    })?;
    let pattern = AssetPattern::new(&config.identifier)?;
    match pattern.rewrite(&content, address)? {
        Rewrite::Unchanged => {
            debug!(asset = %asset_path.display(), "asset already embeds the address");
        }
        Rewrite::Updated {
            content,
            previous,
            lines,
        } => {
            std::fs::write(&asset_path, content).map_err(|source| PublishError::Io {
                path: asset_path.clone(),
                source,
            })?;
            info!(
                asset = %asset_path.display(),
                identifier = pattern.identifier(),
                previous = %previous,
                address = %address,
                lines,
                "asset rewritten"
            );
        }
    }

    // Exit status 1 means the working copy differs from HEAD.
    let diff = git
        .try_run(&["diff", "--quiet", "HEAD", "--", &asset_arg])
        .await?;
    if diff.success {
        return retry_pending_push(&git, config).await;
    }

    let message = format!("Update dashboard URL to {address}");
    git.run("Staging site asset", &["add", "--", &asset_arg]).await?;
    git.run(
        "Committing site asset",
        &["commit", "-m", &message, "--", &asset_arg],
    )
    .await?;
    info!(address = %address, "committed new dashboard address");

    if push_with_rebase(&git, config).await {
        Ok(PublishOutcome::Pushed)
    } else {
        Ok(PublishOutcome::PushFailed)
    }
}

/// The asset matches HEAD; push anyway if HEAD is ahead of the remote branch.
async fn retry_pending_push(
    git: &Git<'_>,
    config: &PublishConfig,
) -> Result<PublishOutcome, PublishError> {
    let fetch = git.try_run(&["fetch", &config.remote, &config.branch]).await?;
    if !fetch.success {
        debug!(remote = %config.remote, stderr = %fetch.stderr, "fetch failed; comparing against last known remote state");
    }

    let range = format!("{}/{}..HEAD", config.remote, config.branch);
    let count = git.try_run(&["rev-list", "--count", &range]).await?;
    let ahead: u32 = if count.success {
        count.stdout.trim().parse().unwrap_or(0)
    } else {
        debug!(range = %range, stderr = %count.stderr, "cannot compare with remote branch");
        0
    };

    if ahead == 0 {
        info!("published address is already up to date");
        return Ok(PublishOutcome::Unchanged);
    }

    info!(ahead, "local commits were never pushed; retrying push");
    if push_with_rebase(git, config).await {
        Ok(PublishOutcome::RetriedPush)
    } else {
        Ok(PublishOutcome::PushFailed)
    }
}

/// Rebase onto the remote branch and push, for up to `push_attempts` rounds.
async fn push_with_rebase(git: &Git<'_>, config: &PublishConfig) -> bool {
    let refspec = format!("HEAD:{}", config.branch);
    let rounds = config.push_attempts.max(1);

    for round in 1..=rounds {
        match git
            .try_run(&["pull", "--rebase", "--autostash", &config.remote, &config.branch])
            .await
        {
            Ok(out) if out.success => debug!(round, "rebased onto remote branch"),
            Ok(out) => {
                warn!(round, stderr = %out.stderr, "pull --rebase failed; pushing without it");
                match git.try_run(&["rebase", "--abort"]).await {
                    Ok(abort) if abort.success => debug!(round, "aborted interrupted rebase"),
                    Ok(abort) => debug!(round, stderr = %abort.stderr, "no rebase to abort"),
                    Err(e) => debug!(round, error = %e, "rebase --abort failed"),
                }
            }
            Err(e) => warn!(round, error = %e, "pull --rebase failed; pushing without it"),
        }

        match git.try_run(&["push", &config.remote, &refspec]).await {
            Ok(out) if out.success => {
                info!(remote = %config.remote, branch = %config.branch, "pushed dashboard address");
                return true;
            }
            Ok(out) => warn!(round, rounds, stderr = %out.stderr, "push rejected"),
            Err(e) => warn!(round, rounds, error = %e, "push failed"),
        }
    }

    warn!(
        remote = %config.remote,
        branch = %config.branch,
        "giving up on push; the commit stays local and is retried next run"
    );
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_address_is_skipped() {
        let config = PublishConfig {
            repo: Some(PathBuf::from("/nonexistent/site")),
            ..PublishConfig::default()
        };
        assert_eq!(
            publish(None, &config, &GitAuth::ambient()).await,
            PublishOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn missing_repo_is_skipped() {
        let address = TunnelAddress::configured("https://abc-123.trycloudflare.com").unwrap();
        assert_eq!(
            publish(Some(&address), &PublishConfig::default(), &GitAuth::ambient()).await,
            PublishOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn unreadable_asset_fails_without_panicking() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = PublishConfig {
            repo: Some(dir.path().to_path_buf()),
            ..PublishConfig::default()
        };
        let address = TunnelAddress::configured("https://abc-123.trycloudflare.com").unwrap();
        let outcome = publish(Some(&address), &config, &GitAuth::ambient()).await;
        assert!(matches!(outcome, PublishOutcome::Failed(msg) if msg.contains("index.html")));
    }

    #[tokio::test]
    async fn asset_without_assignment_is_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>static</p>\n").unwrap();
        let config = PublishConfig {
            repo: Some(dir.path().to_path_buf()),
            ..PublishConfig::default()
        };
        let address = TunnelAddress::configured("https://abc-123.trycloudflare.com").unwrap();
        let outcome = publish(Some(&address), &config, &GitAuth::ambient()).await;
        assert!(matches!(outcome, PublishOutcome::Failed(_)));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.html")).unwrap(),
            "<p>static</p>\n"
        );
    }

    #[test]
    fn git_env_disables_prompts() {
        let git = Git::new(Path::new("/tmp"), &GitAuth::ambient());
        assert!(
            git.envs
                .contains(&("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()))
        );
    }
}
