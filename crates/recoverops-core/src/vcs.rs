use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    channel::{ChannelOutcome, RemediationChannel},
    types::{FixSpec, FixType, Incident, RollbackData},
};

const USER_AGENT: &str = "recoverops";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── File rewriting ────────────────────────────────────────────────────────

fn requirement_name(line: &str) -> String {
    line.split(|c: char| "=<>~!;[ ".contains(c))
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn merge_requirement_lines(original: &str, additions: &str) -> String {
    let present: HashSet<String> = original
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(requirement_name)
        .collect();

    let mut out = original.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for line in additions.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || present.contains(&requirement_name(line)) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn merge_package_json(original: Option<&str>, additions: &str) -> Result<String> {
    let mut doc: Value = match original {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str(text).context("existing package.json is not valid JSON")?
        }
        _ => json!({}),
    };
    let patch: Value = serde_json::from_str(additions).context("fix content is not valid JSON")?;
    let Some(root) = doc.as_object_mut() else {
        bail!("package.json root is not an object");
    };
    if let Some(add) = patch.get("dependencies").and_then(Value::as_object) {
        let deps = root
            .entry("dependencies")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| anyhow!("package.json dependencies is not an object"))?;
        for (name, version) in add {
            deps.entry(name.clone()).or_insert_with(|| version.clone());
        }
    }
    let mut text = serde_json::to_string_pretty(&doc)?;
    text.push('\n');
    Ok(text)
}

/// New file contents after applying `content` to `original` (`None` = file absent).
///
/// Dependency updates add what is missing and keep everything else; all other
/// fix types replace the file wholesale.
pub fn apply_fix_to_content(
    fix_type: FixType,
    path: &str,
    original: Option<&str>,
    content: &str,
) -> Result<String> {
    match fix_type {
        FixType::DependencyUpdate if path.ends_with(".json") => {
            merge_package_json(original, content)
        }
        FixType::DependencyUpdate => Ok(merge_requirement_lines(original.unwrap_or(""), content)),
        _ if content.trim().is_empty() => {
            bail!("empty fix content for {path}")
        }
        _ => Ok(content.to_string()),
    }
}

fn is_glob(path: &str) -> bool {
    path.contains('*') || path.contains('?')
}

pub fn pr_body(incident: &Incident, fix: &FixSpec, files: &[String]) -> String {
    let mut body = format!(
        "## Automated remediation for incident #{}\n\n**Incident:** {}\n**Failure type:** {}\n**Root cause:** {}\n\n### Fix\n{}\n\nConfidence: {:.2}\n\n### Files changed\n",
        incident.id,
        incident.title,
        incident.failure_type.label(),
        incident.root_cause.as_deref().unwrap_or("unknown"),
        fix.description,
        fix.confidence,
    );
    for f in files {
        body.push_str(&format!("- `{f}`\n"));
    }
    body.push_str("\n### Validation\nReview the change and let CI confirm the fix before merging.\n");
    body
}

// ── GitHub channel ────────────────────────────────────────────────────────

/// Applies code and config fixes as a branch plus pull request on GitHub.
pub struct GitHubChannel {
    client: reqwest::Client,
    api_url: String,
    token: String,
    branch_prefix: String,
    auto_merge_confidence: f64,
    auto_enabled: Arc<AtomicBool>,
}

impl GitHubChannel {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        branch_prefix: impl Into<String>,
        auto_merge_confidence: f64,
        auto_enabled: Arc<AtomicBool>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            branch_prefix: branch_prefix.into(),
            auto_merge_confidence,
            auto_enabled,
        })
    }

    fn req(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Value> {
        let resp = req.send().await.with_context(|| format!("github {what}"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("github {what} failed: {status} {text}");
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    async fn default_branch(&self, repo: &str) -> Result<String> {
        let v = self
            .send(self.req(reqwest::Method::GET, &format!("/repos/{repo}")), "get repository")
            .await?;
        Ok(v["default_branch"].as_str().unwrap_or("main").to_string())
    }

    async fn head_sha(&self, repo: &str, branch: &str) -> Result<String> {
        let v = self
            .send(
                self.req(
                    reqwest::Method::GET,
                    &format!("/repos/{repo}/git/ref/heads/{branch}"),
                ),
                "get ref",
            )
            .await?;
        v["object"]["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ref heads/{branch} has no sha"))
    }

    /// Creates `name` at `sha`; `false` when the branch already exists.
    async fn create_branch(&self, repo: &str, name: &str, sha: &str) -> Result<bool> {
        let resp = self
            .req(reqwest::Method::POST, &format!("/repos/{repo}/git/refs"))
            .json(&json!({ "ref": format!("refs/heads/{name}"), "sha": sha }))
            .send()
            .await
            .context("github create ref")?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNPROCESSABLE_ENTITY => Ok(false),
            s => {
                let text = resp.text().await.unwrap_or_default();
                bail!("github create ref failed: {s} {text}")
            }
        }
    }

    /// Current contents and blob sha of `path` on `branch`, `None` if absent.
    async fn get_file(&self, repo: &str, path: &str, branch: &str) -> Result<Option<(String, String)>> {
        let resp = self
            .req(reqwest::Method::GET, &format!("/repos/{repo}/contents/{path}"))
            .query(&[("ref", branch)])
            .send()
            .await
            .context("github get contents")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("github get contents {path} failed: {status} {text}");
        }
        let v: Value = resp.json().await?;
        let encoded: String = v["content"]
            .as_str()
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(encoded)
            .with_context(|| format!("decode {path}"))?;
        let text = String::from_utf8(bytes).with_context(|| format!("{path} is not utf-8"))?;
        let sha = v["sha"].as_str().unwrap_or_default().to_string();
        Ok(Some((text, sha)))
    }

    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
        contents: &str,
        sha: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let mut body = json!({
            "message": message,
            "content": STANDARD.encode(contents),
            "branch": branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }
        self.send(
            self.req(reqwest::Method::PUT, &format!("/repos/{repo}/contents/{path}"))
                .json(&body),
            "put contents",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RemediationChannel for GitHubChannel {
    fn name(&self) -> &str {
        "github"
    }

    async fn apply(&self, incident: &Incident, fix: &FixSpec) -> Result<ChannelOutcome> {
        if self.token.is_empty() {
            bail!("GITHUB_TOKEN not configured");
        }
        let repo = incident.repository.as_str();
        if !repo.contains('/') {
            bail!("incident has no owner/repo repository: '{repo}'");
        }
        let files: Vec<String> = fix
            .target_files
            .iter()
            .filter(|f| !is_glob(f))
            .cloned()
            .collect();
        if files.is_empty() {
            bail!("fix has no concrete target files");
        }

        let base = if incident.branch.is_empty() {
            self.default_branch(repo).await?
        } else {
            incident.branch.clone()
        };
        let sha = self.head_sha(repo, &base).await?;

        let mut branch = format!("{}-{}", self.branch_prefix, incident.id);
        if !self.create_branch(repo, &branch, &sha).await? {
            branch = format!("{branch}-{}", fix.remediation_id);
            if !self.create_branch(repo, &branch, &sha).await? {
                bail!("branch {branch} already exists");
            }
        }

        let commit_msg = format!("fix: {} (incident #{})", fix.description, incident.id);
        for path in &files {
            let existing = self.get_file(repo, path, &branch).await?;
            let original = existing.as_ref().map(|(text, _)| text.as_str());
            let updated = apply_fix_to_content(fix.fix_type, path, original, &fix.content)?;
            if original == Some(updated.as_str()) {
                info!(incident_id = incident.id, path = %path, "file already up to date");
                continue;
            }
            let blob = existing.as_ref().map(|(_, sha)| sha.as_str());
            self.put_file(repo, path, &branch, &updated, blob, &commit_msg)
                .await?;
        }

        let pr = self
            .send(
                self.req(reqwest::Method::POST, &format!("/repos/{repo}/pulls")).json(&json!({
                    "title": format!("AI-RecoverOps: Fix for {}", incident.title),
                    "head": branch,
                    "base": base,
                    "body": pr_body(incident, fix, &files),
                })),
                "create pull request",
            )
            .await?;
        let pr_number = pr["number"]
            .as_i64()
            .ok_or_else(|| anyhow!("pull request response has no number"))?;
        let pr_url = pr["html_url"].as_str().unwrap_or_default().to_string();
        info!(incident_id = incident.id, pr_number, branch = %branch, "opened pull request");

        let mut merged = false;
        if self.auto_enabled.load(Ordering::SeqCst) && fix.confidence > self.auto_merge_confidence {
            let res = self
                .send(
                    self.req(
                        reqwest::Method::PUT,
                        &format!("/repos/{repo}/pulls/{pr_number}/merge"),
                    )
                    .json(&json!({ "merge_method": "squash" })),
                    "merge pull request",
                )
                .await;
            match res {
                Ok(_) => merged = true,
                Err(e) => warn!(incident_id = incident.id, pr_number, "auto-merge failed: {e}"),
            }
        }

        Ok(ChannelOutcome {
            message: format!("Created PR #{pr_number}"),
            details: json!({
                "pr_number": pr_number,
                "pr_url": pr_url,
                "branch": branch,
                "base": base,
                "files": files,
                "merged": merged,
            }),
            rollback: RollbackData::GitPr {
                repository: repo.to_string(),
                pr_number,
                branch,
            },
        })
    }

    async fn rollback(&self, data: &RollbackData) -> Result<()> {
        let RollbackData::GitPr {
            repository,
            pr_number,
            branch,
        } = data
        else {
            bail!("github channel cannot roll back {data:?}");
        };

        let pr = self
            .send(
                self.req(
                    reqwest::Method::GET,
                    &format!("/repos/{repository}/pulls/{pr_number}"),
                ),
                "get pull request",
            )
            .await?;
        if pr["state"].as_str() == Some("open") {
            self.send(
                self.req(
                    reqwest::Method::PATCH,
                    &format!("/repos/{repository}/pulls/{pr_number}"),
                )
                .json(&json!({ "state": "closed" })),
                "close pull request",
            )
            .await?;
            info!(pr_number, "closed pull request");
        }

        let resp = self
            .req(
                reqwest::Method::DELETE,
                &format!("/repos/{repository}/git/refs/heads/{branch}"),
            )
            .send()
            .await
            .context("github delete ref")?;
        match resp.status() {
            s if s.is_success() => info!(branch = %branch, "deleted branch"),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                info!(branch = %branch, "branch already gone")
            }
            s => {
                let text = resp.text().await.unwrap_or_default();
                bail!("github delete ref failed: {s} {text}");
            }
        }
        Ok(())
    }

    async fn verify(&self, data: &RollbackData) -> Result<bool> {
        let RollbackData::GitPr {
            repository,
            pr_number,
            ..
        } = data
        else {
            return Ok(false);
        };
        let pr = self
            .send(
                self.req(
                    reqwest::Method::GET,
                    &format!("/repos/{repository}/pulls/{pr_number}"),
                ),
                "get pull request",
            )
            .await?;
        Ok(pr["state"].as_str() == Some("open") || pr["merged"].as_bool() == Some(true))
    }
}
