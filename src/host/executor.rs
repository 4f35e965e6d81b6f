//! Job payload execution: subprocesses with timeouts and output caps

use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use crate::common::HostConfig;
use crate::coordinator::model::JobPayload;

/// Fallback when a payload carries no timeout
const DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// What the host reports back through `complete`
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn refused(error: String) -> Self {
        Self {
            success: false,
            duration_ms: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
        }
    }
}

/// Truncate to at most `cap` bytes on a char boundary
fn cap_output(mut text: String, cap: usize) -> String {
    if text.len() > cap {
        let mut boundary = cap;
        while boundary > 0 && !text.is_char_boundary(boundary) {
            boundary -= 1;
        }
        text.truncate(boundary);
    }
    text
}

/// Run a job payload to completion, enforcing the allowlist, timeout and
/// output caps from the host configuration
pub async fn execute(payload: &JobPayload, config: &HostConfig) -> ExecutionOutcome {
    let (program, args, cwd, env, timeout_ms) = match payload {
        JobPayload::Shell {
            command,
            args,
            cwd,
            env,
            timeout_ms,
        } => {
            if !config.shell_allowlist.iter().any(|c| c == command) {
                return ExecutionOutcome::refused(format!(
                    "command not in shell allowlist: {}",
                    command
                ));
            }
            (command.clone(), args.clone(), cwd.clone(), env.clone(), *timeout_ms)
        }
        JobPayload::OpenclawRun {
            args,
            openclaw_dir,
            env,
            timeout_ms,
        } => (
            config.openclaw_bin.clone(),
            args.clone(),
            openclaw_dir.clone(),
            env.clone(),
            *timeout_ms,
        ),
    };

    let mut command = Command::new(&program);
    command
        .args(&args)
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &cwd {
        command.current_dir(cwd);
    }

    let started = Instant::now();
    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionOutcome::refused(format!("failed to spawn {}: {}", program, e))
        }
    };

    let timeout = std::time::Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ExecutionOutcome {
            success: output.status.success(),
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: output.status.code(),
            stdout: cap_output(
                String::from_utf8_lossy(&output.stdout).into_owned(),
                config.output_cap_bytes,
            ),
            stderr: cap_output(
                String::from_utf8_lossy(&output.stderr).into_owned(),
                config.output_cap_bytes,
            ),
            error: None,
        },
        Ok(Err(e)) => ExecutionOutcome {
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("failed to run {}: {}", program, e)),
        },
        // dropping the wait future kills the child (kill_on_drop)
        Err(_) => ExecutionOutcome {
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("timed out after {} ms", timeout.as_millis())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allowlist: &[&str]) -> HostConfig {
        HostConfig {
            coordinators: vec![],
            name: "test-host".into(),
            host_id: None,
            capabilities: vec!["shell".into()],
            max_parallel: 1,
            auth_token: None,
            heartbeat_interval_secs: 5,
            poll_interval_secs: 2,
            shell_allowlist: allowlist.iter().map(|c| c.to_string()).collect(),
            output_cap_bytes: 64,
            openclaw_bin: "openclaw".into(),
            advertise_host: "127.0.0.1".into(),
            service_port_base: 9000,
        }
    }

    fn shell(command: &str, args: &[&str], timeout_ms: Option<u64>) -> JobPayload {
        JobPayload::Shell {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: Default::default(),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_allowlisted_command_runs() {
        let outcome = execute(&shell("echo", &["hello"], None), &config(&["echo"])).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "hello\n");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_disallowed_command_is_refused() {
        let outcome = execute(&shell("rm", &["-rf", "/tmp/x"], None), &config(&["echo"])).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("allowlist"));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_job() {
        let outcome = execute(&shell("sleep", &["5"], Some(50)), &config(&["sleep"])).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        // 64-byte cap in the test config
        let long = "x".repeat(500);
        let outcome = execute(&shell("echo", &[&long], None), &config(&["echo"])).await;
        assert!(outcome.success);
        assert_eq!(outcome.stdout.len(), 64);
    }

    #[test]
    fn test_cap_output_respects_char_boundaries() {
        let capped = cap_output("héllo".to_string(), 2);
        // the two-byte é cannot be split
        assert_eq!(capped, "h");
    }
}
