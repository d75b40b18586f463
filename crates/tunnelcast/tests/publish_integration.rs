#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Publication against a real git checkout pushing to a local bare remote.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use tunnelcast::publish::{PublishOutcome, publish};
use tunnelcast::ssh::GitAuth;
use tunnelcast_core::address::TunnelAddress;
use tunnelcast_core::config::PublishConfig;

const PLACEHOLDER: &str = "https://placeholder.trycloudflare.com";

fn page(url: &str) -> String {
    format!(
        "<html>\n<script>\n  const DASHBOARD_URL = \"{url}\";\n  window.location = DASHBOARD_URL;\n</script>\n</html>\n"
    )
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn configure_identity(dir: &Path) {
    git(dir, &["config", "user.name", "Site Bot"]);
    git(dir, &["config", "user.email", "site-bot@example.org"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

/// A bare remote plus a checkout whose `main` holds the placeholder page.
struct Site {
    root: TempDir,
    remote: PathBuf,
    checkout: PathBuf,
}

impl Site {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let remote = root.path().join("remote.git");
        let checkout = root.path().join("site");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&checkout).unwrap();

        git(&remote, &["init", "--bare", "--quiet"]);
        git(&checkout, &["init", "--quiet"]);
        git(&checkout, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        configure_identity(&checkout);
        std::fs::write(checkout.join("index.html"), page(PLACEHOLDER)).unwrap();
        git(&checkout, &["add", "index.html"]);
        git(&checkout, &["commit", "-q", "-m", "Initial page"]);
        git(
            &checkout,
            &["remote", "add", "origin", remote.to_str().unwrap()],
        );
        git(&checkout, &["push", "-q", "origin", "HEAD:main"]);
        git(&checkout, &["fetch", "-q", "origin"]);

        Self {
            root,
            remote,
            checkout,
        }
    }

    fn config(&self) -> PublishConfig {
        PublishConfig {
            repo: Some(self.checkout.clone()),
            ..PublishConfig::default()
        }
    }

    fn asset(&self) -> String {
        std::fs::read_to_string(self.checkout.join("index.html")).unwrap()
    }

    fn local_commits(&self) -> usize {
        git(&self.checkout, &["rev-list", "--count", "HEAD"])
            .parse()
            .unwrap()
    }

    fn remote_subject(&self) -> String {
        git(&self.remote, &["log", "-1", "--format=%s", "main"])
    }

    fn remote_asset(&self) -> String {
        git(&self.remote, &["show", "main:index.html"])
    }
}

fn address(url: &str) -> TunnelAddress {
    TunnelAddress::configured(url).unwrap()
}

#[tokio::test]
async fn new_address_is_committed_and_pushed() {
    let site = Site::new();
    let url = "https://abc-123.trycloudflare.com";

    let outcome = publish(Some(&address(url)), &site.config(), &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::Pushed);
    assert_eq!(site.asset(), page(url));
    assert_eq!(site.local_commits(), 2);
    assert_eq!(site.remote_subject(), format!("Update dashboard URL to {url}"));
    assert_eq!(site.remote_asset().trim_end(), page(url).trim_end());
}

#[tokio::test]
async fn republishing_same_address_creates_no_commit() {
    let site = Site::new();
    let url = "https://abc-123.trycloudflare.com";
    let config = site.config();

    assert_eq!(
        publish(Some(&address(url)), &config, &GitAuth::ambient()).await,
        PublishOutcome::Pushed
    );
    let outcome = publish(Some(&address(url)), &config, &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::Unchanged);
    assert_eq!(site.local_commits(), 2);
}

#[tokio::test]
async fn missing_address_touches_nothing() {
    let site = Site::new();

    let outcome = publish(None, &site.config(), &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::Skipped);
    assert_eq!(site.asset(), page(PLACEHOLDER));
    assert_eq!(site.local_commits(), 1);
}

#[tokio::test]
async fn unpushed_commit_is_pushed_on_next_run() {
    let site = Site::new();
    let url = "https://left-behind.trycloudflare.com";

    // An earlier run committed but never managed to push.
    std::fs::write(site.checkout.join("index.html"), page(url)).unwrap();
    git(&site.checkout, &["commit", "-q", "-am", "Update dashboard URL"]);

    let outcome = publish(Some(&address(url)), &site.config(), &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::RetriedPush);
    assert_eq!(site.local_commits(), 2);
    assert_eq!(site.remote_asset().trim_end(), page(url).trim_end());
}

#[tokio::test]
async fn concurrent_remote_history_is_rebased() {
    let site = Site::new();

    // Someone else pushes an unrelated change first.
    let other = site.root.path().join("other");
    git(
        site.root.path(),
        &["clone", "-q", site.remote.to_str().unwrap(), "other"],
    );
    configure_identity(&other);
    git(&other, &["checkout", "-q", "main"]);
    std::fs::write(other.join("README.md"), "site\n").unwrap();
    git(&other, &["add", "README.md"]);
    git(&other, &["commit", "-q", "-m", "Add readme"]);
    git(&other, &["push", "-q", "origin", "HEAD:main"]);

    let url = "https://after-rebase.trycloudflare.com";
    let outcome = publish(Some(&address(url)), &site.config(), &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::Pushed);
    assert_eq!(site.remote_subject(), format!("Update dashboard URL to {url}"));
    assert_eq!(git(&site.remote, &["show", "main:README.md"]), "site");
}

#[tokio::test]
async fn unreachable_remote_keeps_local_commit() {
    let site = Site::new();
    git(
        &site.checkout,
        &["remote", "set-url", "origin", "/nonexistent/tunnelcast/remote.git"],
    );
    let url = "https://offline-1.trycloudflare.com";

    let outcome = publish(Some(&address(url)), &site.config(), &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::PushFailed);
    assert_eq!(site.asset(), page(url));
    assert_eq!(site.local_commits(), 2);
    assert_eq!(site.remote_asset().trim_end(), page(PLACEHOLDER).trim_end());
}

#[tokio::test]
async fn conflicting_rebase_is_aborted_and_commit_kept() {
    let site = Site::new();

    // Someone else rewrites the same line first.
    let other = site.root.path().join("other");
    git(
        site.root.path(),
        &["clone", "-q", site.remote.to_str().unwrap(), "other"],
    );
    configure_identity(&other);
    git(&other, &["checkout", "-q", "main"]);
    std::fs::write(
        other.join("index.html"),
        page("https://someone-else.trycloudflare.com"),
    )
    .unwrap();
    git(&other, &["commit", "-q", "-am", "Competing address"]);
    git(&other, &["push", "-q", "origin", "HEAD:main"]);

    let url = "https://conflicted-1.trycloudflare.com";
    let outcome = publish(Some(&address(url)), &site.config(), &GitAuth::ambient()).await;

    assert_eq!(outcome, PublishOutcome::PushFailed);
    assert!(!site.checkout.join(".git").join("rebase-merge").exists());
    assert!(!site.checkout.join(".git").join("rebase-apply").exists());
    assert_eq!(site.asset(), page(url));
    assert_eq!(site.local_commits(), 2);
    assert_eq!(site.remote_subject(), "Competing address");
}
