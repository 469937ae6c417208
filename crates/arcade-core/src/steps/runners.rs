//! Builtin step runners: shell scripts/commands, artifact and report
//! transfers, and a stdout notification sink.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use uuid::Uuid;

use super::trait_def::StepRunner;
use super::types::{StepContext, StepOutcome};

/// Substrings that are refused in shell script/command bodies unless the
/// caller explicitly opts in with `allow_dangerous`.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=",
    "> /dev/",
];

fn check_dangerous(body: &str, allow_dangerous: bool) -> Result<()> {
    if allow_dangerous {
        return Ok(());
    }
    for pattern in DANGEROUS_PATTERNS {
        if body.contains(pattern) {
            bail!("script contains disallowed pattern: {pattern:?}");
        }
    }
    Ok(())
}

fn merge_env(
    ctx_env: &std::collections::HashMap<String, String>,
    params_env: &std::collections::HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut merged = ctx_env.clone();
    merged.extend(params_env.clone());
    merged.into_iter().collect()
}

#[derive(Debug, Deserialize)]
struct ShellConfig {
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    allow_dangerous: bool,
}

#[derive(Debug, Deserialize)]
struct ShellScriptParams {
    script: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    #[serde(default)]
    config: ShellConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: None,
            timeout: None,
            allow_dangerous: false,
        }
    }
}

async fn run_command_capturing(
    mut command: Command,
    timeout: Option<Duration>,
) -> StepOutcome {
    let start = Instant::now();
    let spawned = command.output();

    let result = match timeout {
        Some(d) => tokio::time::timeout(d, spawned).await,
        None => Ok(spawned.await),
    };

    let elapsed = start.elapsed().as_millis() as u64;

    match result {
        Err(_) => StepOutcome::error("command timed out", elapsed),
        Ok(Err(e)) => StepOutcome::error(format!("failed to spawn command: {e}"), elapsed),
        Ok(Ok(output)) => StepOutcome::ok(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed,
            output.status.code().unwrap_or(-1),
        ),
    }
}

/// Executes a script body via a temp file: `shell tmpfile args...`.
pub struct ShellScriptRunner;

#[async_trait]
impl StepRunner for ShellScriptRunner {
    fn kind(&self) -> &str {
        "shell_script"
    }

    async fn run(&self, ctx: &StepContext, params: &Value) -> Result<StepOutcome> {
        let params: ShellScriptParams =
            serde_json::from_value(params.clone()).context("invalid shell_script params")?;

        check_dangerous(&params.script, params.config.allow_dangerous)?;

        let shell = params.config.shell.unwrap_or_else(|| "/bin/sh".to_string());
        if which(&shell).is_none() {
            bail!("shell {shell:?} not found");
        }

        let tmp_path = std::env::temp_dir().join(format!("arcade-step-{}.sh", Uuid::new_v4()));
        std::fs::write(&tmp_path, &params.script)
            .with_context(|| format!("failed to write script to {tmp_path:?}"))?;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to chmod {tmp_path:?}"))?;

        let outcome = {
            let mut command = Command::new(&shell);
            command.arg(&tmp_path).args(&params.args).current_dir(&ctx.workspace);
            for (key, value) in merge_env(&ctx.env, &params.env) {
                command.env(key, value);
            }

            let timeout = params.config.timeout.filter(|t| *t > 0).map(Duration::from_secs);
            run_command_capturing(command, timeout).await
        };

        let _ = std::fs::remove_file(&tmp_path);
        Ok(outcome)
    }
}

#[derive(Debug, Deserialize)]
struct ShellCommandParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    #[serde(default)]
    config: ShellConfig,
}

/// Executes a command string via `shell -c command args...`.
pub struct ShellCommandRunner;

#[async_trait]
impl StepRunner for ShellCommandRunner {
    fn kind(&self) -> &str {
        "shell_command"
    }

    async fn run(&self, ctx: &StepContext, params: &Value) -> Result<StepOutcome> {
        let params: ShellCommandParams =
            serde_json::from_value(params.clone()).context("invalid shell_command params")?;

        check_dangerous(&params.command, params.config.allow_dangerous)?;

        let shell = params.config.shell.unwrap_or_else(|| "/bin/sh".to_string());
        if which(&shell).is_none() {
            bail!("shell {shell:?} not found");
        }

        let mut command = Command::new(&shell);
        command
            .arg("-c")
            .arg(&params.command)
            .args(&params.args)
            .current_dir(&ctx.workspace);
        for (key, value) in merge_env(&ctx.env, &params.env) {
            command.env(key, value);
        }

        let timeout = params.config.timeout.filter(|t| *t > 0).map(Duration::from_secs);
        Ok(run_command_capturing(command, timeout).await)
    }
}

fn which(program: &str) -> Option<std::path::PathBuf> {
    let path = Path::new(program);
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.exists())
    })
}

fn copy_preserving_structure(paths: &[String], from: &Path, to: &Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(to).with_context(|| format!("failed to create {to:?}"))?;
    let mut copied = Vec::with_capacity(paths.len());
    for rel in paths {
        let src = from.join(rel);
        let dst = to.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dst).with_context(|| format!("failed to copy {src:?} to {dst:?}"))?;
        copied.push(rel.clone());
    }
    Ok(copied)
}

#[derive(Debug, Deserialize)]
struct ArtifactsParams {
    paths: Vec<String>,
}

/// Copies listed paths from the workspace into the run's artifacts directory.
pub struct ArtifactsUploadRunner;

#[async_trait]
impl StepRunner for ArtifactsUploadRunner {
    fn kind(&self) -> &str {
        "artifacts_upload"
    }

    async fn run(&self, ctx: &StepContext, params: &Value) -> Result<StepOutcome> {
        let start = Instant::now();
        let params: ArtifactsParams =
            serde_json::from_value(params.clone()).context("invalid artifacts_upload params")?;

        let artifacts_dir = ctx.artifacts_dir();
        match copy_preserving_structure(&params.paths, &ctx.workspace, &artifacts_dir) {
            Ok(uploaded) => {
                let body = serde_json::json!({
                    "success": true,
                    "uploaded_files": uploaded,
                    "artifacts_dir": artifacts_dir.display().to_string(),
                });
                Ok(StepOutcome::ok(
                    body.to_string(),
                    String::new(),
                    start.elapsed().as_millis() as u64,
                    0,
                ))
            }
            Err(e) => Ok(StepOutcome::error(e.to_string(), start.elapsed().as_millis() as u64)),
        }
    }
}

/// Copies listed paths from the run's artifacts directory back into the
/// workspace.
pub struct ArtifactsDownloadRunner;

#[async_trait]
impl StepRunner for ArtifactsDownloadRunner {
    fn kind(&self) -> &str {
        "artifacts_download"
    }

    async fn run(&self, ctx: &StepContext, params: &Value) -> Result<StepOutcome> {
        let start = Instant::now();
        let params: ArtifactsParams =
            serde_json::from_value(params.clone()).context("invalid artifacts_download params")?;

        let artifacts_dir = ctx.artifacts_dir();
        match copy_preserving_structure(&params.paths, &artifacts_dir, &ctx.workspace) {
            Ok(downloaded) => {
                let body = serde_json::json!({
                    "success": true,
                    "downloaded_files": downloaded,
                    "artifacts_dir": artifacts_dir.display().to_string(),
                });
                Ok(StepOutcome::ok(
                    body.to_string(),
                    String::new(),
                    start.elapsed().as_millis() as u64,
                    0,
                ))
            }
            Err(e) => Ok(StepOutcome::error(e.to_string(), start.elapsed().as_millis() as u64)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReportsDotenvParams {
    files: Vec<String>,
}

/// Copies listed dotenv files into the run's reports directory.
pub struct ReportsDotenvRunner;

#[async_trait]
impl StepRunner for ReportsDotenvRunner {
    fn kind(&self) -> &str {
        "reports_dotenv"
    }

    async fn run(&self, ctx: &StepContext, params: &Value) -> Result<StepOutcome> {
        let start = Instant::now();
        let params: ReportsDotenvParams =
            serde_json::from_value(params.clone()).context("invalid reports_dotenv params")?;

        let reports_dir = ctx.reports_dir();
        match copy_preserving_structure(&params.files, &ctx.workspace, &reports_dir) {
            Ok(copied) => {
                let body = serde_json::json!({
                    "success": true,
                    "copied_files": copied,
                    "reports_dir": reports_dir.display().to_string(),
                });
                Ok(StepOutcome::ok(
                    body.to_string(),
                    String::new(),
                    start.elapsed().as_millis() as u64,
                    0,
                ))
            }
            Err(e) => Ok(StepOutcome::error(e.to_string(), start.elapsed().as_millis() as u64)),
        }
    }
}

// Variant order matters: untagged deserialization tries each in turn and
// takes the first that fits, so the more specific shapes must come before
// the catch-all `Json(Value)`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NotifyPayload {
    Template { template: String, data: Value },
    Plain(String),
    Json(Value),
}

#[derive(Debug, Deserialize)]
struct StdoutNotifyParams {
    #[serde(default)]
    prefix: Option<String>,
    payload: NotifyPayload,
}

/// Writes a formatted notification line to stdout:
/// `[prefix ]timestamp_RFC3339 | payload`.
pub struct StdoutNotifyRunner;

#[async_trait]
impl StepRunner for StdoutNotifyRunner {
    fn kind(&self) -> &str {
        "stdout_notify"
    }

    async fn run(&self, _ctx: &StepContext, params: &Value) -> Result<StepOutcome> {
        let start = Instant::now();
        let params: StdoutNotifyParams =
            serde_json::from_value(params.clone()).context("invalid stdout_notify params")?;

        let rendered = match &params.payload {
            NotifyPayload::Json(value) => value.to_string(),
            NotifyPayload::Plain(s) => s.clone(),
            NotifyPayload::Template { template, data } => render_template(template, data),
        };

        let prefix = params
            .prefix
            .map(|p| format!("{p} "))
            .unwrap_or_default();
        let line = format!("{prefix}{} | {rendered}", Utc::now().to_rfc3339());
        println!("{line}");

        Ok(StepOutcome::ok(line, String::new(), start.elapsed().as_millis() as u64, 0))
    }
}

/// Replaces `{{key}}` placeholders in `template` with string values from
/// `data`'s top-level object fields.
fn render_template(template: &str, data: &Value) -> String {
    let mut rendered = template.to_string();
    if let Some(obj) = data.as_object() {
        for (key, value) in obj {
            let placeholder = format!("{{{{{key}}}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &replacement);
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> StepContext {
        StepContext {
            workspace: std::env::temp_dir(),
            env: HashMap::new(),
            pipeline_namespace: "ns".to_string(),
            build_id: "build-1".to_string(),
            workspace_root: std::env::temp_dir().join("arcade-step-tests"),
        }
    }

    #[test]
    fn dangerous_pattern_is_rejected() {
        assert!(check_dangerous("rm -rf /", false).is_err());
        assert!(check_dangerous("echo hi", false).is_ok());
        assert!(check_dangerous("rm -rf /", true).is_ok());
    }

    #[test]
    fn merge_env_prefers_params_over_ctx() {
        let mut ctx_env = HashMap::new();
        ctx_env.insert("FOO".to_string(), "ctx".to_string());
        let mut params_env = HashMap::new();
        params_env.insert("FOO".to_string(), "params".to_string());

        let merged: HashMap<_, _> = merge_env(&ctx_env, &params_env).into_iter().collect();
        assert_eq!(merged.get("FOO"), Some(&"params".to_string()));
    }

    #[tokio::test]
    async fn shell_command_runner_captures_stdout() {
        let runner = ShellCommandRunner;
        let params = serde_json::json!({"command": "echo hello"});
        let outcome = runner.run(&ctx(), &params).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.stdout.contains("hello"));
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn shell_command_runner_rejects_dangerous_commands() {
        let runner = ShellCommandRunner;
        let params = serde_json::json!({"command": "rm -rf /"});
        let result = runner.run(&ctx(), &params).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shell_script_runner_executes_and_cleans_up_tempfile() {
        let runner = ShellScriptRunner;
        let params = serde_json::json!({"script": "echo from-script"});
        let outcome = runner.run(&ctx(), &params).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.stdout.contains("from-script"));
    }

    #[tokio::test]
    async fn stdout_notify_renders_template() {
        let runner = StdoutNotifyRunner;
        let params = serde_json::json!({
            "payload": {"template": "hello {{name}}", "data": {"name": "world"}}
        });
        let outcome = runner.run(&ctx(), &params).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.stdout.contains("hello world"));
    }

    #[test]
    fn render_template_substitutes_fields() {
        let data = serde_json::json!({"name": "arcade", "count": 3});
        let rendered = render_template("{{name}} ran {{count}} times", &data);
        assert_eq!(rendered, "arcade ran 3 times");
    }
}
