//! User-defined pre/post failover hooks.
//!
//! Hooks run as child processes with a fixed set of
//! `SOLANA_VALIDATOR_FAILOVER_*` environment variables describing both nodes.
//! Stdout and stderr are streamed line by line into the structured log while
//! the hook runs. A `must_succeed` hook that fails aborts the failover; any
//! other failure is logged and skipped.

use {
    crate::error::{Error, Result},
    log::{debug, error, info},
    serde::Deserialize,
    std::{collections::BTreeMap, process::Stdio},
    tokio::io::{AsyncBufReadExt, AsyncRead, BufReader},
};

/// Prefix applied to every hook environment variable.
pub const HOOK_ENV_PREFIX: &str = "SOLANA_VALIDATOR_FAILOVER_";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Hook {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub must_succeed: bool,
}

pub type Hooks = Vec<Hook>;

/// Hook environment map. A `BTreeMap` so keys are applied to the child in
/// sorted order, which keeps hook behavior reproducible across runs.
pub type HookEnv = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StageHooks {
    #[serde(default)]
    pub when_active: Hooks,
    #[serde(default)]
    pub when_passive: Hooks,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FailoverHooks {
    #[serde(default)]
    pub pre: StageHooks,
    #[serde(default)]
    pub post: StageHooks,
}

impl Hook {
    /// Run the hook to completion, streaming its output into the log.
    ///
    /// Values are whitespace-trimmed before being applied to the child
    /// environment. The call returns only after the child has exited and
    /// both output streams have drained.
    pub async fn run(&self, env: &HookEnv) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.command);
        command.args(&self.args);
        for (key, value) in env {
            command.env(format!("{HOOK_ENV_PREFIX}{key}"), value.trim());
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(
            "hook {}: running {} [{}]",
            self.name,
            self.command,
            self.args.join(", ")
        );

        info!("🪝  running hook {}", self.name);
        let mut child = command
            .spawn()
            .map_err(|err| Error::Hook(self.name.clone(), format!("failed to start: {err}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(stream_output(self.name.clone(), stdout, false));
        let stderr_task = tokio::spawn(stream_output(self.name.clone(), stderr, true));

        let status = child
            .wait()
            .await
            .map_err(|err| Error::Hook(self.name.clone(), err.to_string()))?;

        // both readers must drain before we return
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(Error::Hook(self.name.clone(), status.to_string()));
        }

        info!("🪝  hook {} completed successfully", self.name);
        Ok(())
    }
}

async fn stream_output<R>(hook_name: String, pipe: Option<R>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_stderr {
            error!("🪝  {hook_name}: {line}");
        } else {
            info!("🪝  {hook_name}: {line}");
        }
    }
}

async fn run_pre(hooks: &Hooks, env: &HookEnv) -> Result<()> {
    for hook in hooks {
        match hook.run(env).await {
            Ok(()) => {}
            Err(err) if hook.must_succeed => return Err(err),
            Err(err) => {
                error!("pre hook {} failed - must_succeed is false, continuing: {err}", hook.name);
            }
        }
    }
    Ok(())
}

async fn run_post(hooks: &Hooks, env: &HookEnv) {
    for hook in hooks {
        if let Err(err) = hook.run(env).await {
            error!("post hook {} failed: {err}", hook.name);
        }
    }
}

impl FailoverHooks {
    pub async fn run_pre_when_active(&self, env: &HookEnv) -> Result<()> {
        run_pre(&self.pre.when_active, env).await
    }

    pub async fn run_pre_when_passive(&self, env: &HookEnv) -> Result<()> {
        run_pre(&self.pre.when_passive, env).await
    }

    pub async fn run_post_when_active(&self, env: &HookEnv) {
        run_post(&self.post.when_active, env).await
    }

    pub async fn run_post_when_passive(&self, env: &HookEnv) {
        run_post(&self.post.when_passive, env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(command: &str, must_succeed: bool) -> Hook {
        Hook {
            name: "test-hook".to_string(),
            command: command.to_string(),
            args: vec![],
            must_succeed,
        }
    }

    #[tokio::test]
    async fn test_hook_success() {
        hook("/bin/true", true).run(&HookEnv::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_hook_failure_is_hook_error() {
        let err = hook("/bin/false", true).run(&HookEnv::new()).await.unwrap_err();
        assert!(matches!(err, Error::Hook(_, _)));
    }

    #[tokio::test]
    async fn test_hook_missing_binary() {
        let err = hook("/nonexistent/hook-bin", true)
            .run(&HookEnv::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_pre_hooks_abort_on_must_succeed_failure() {
        let hooks = FailoverHooks {
            pre: StageHooks {
                when_passive: vec![hook("/bin/false", true), hook("/bin/true", true)],
                ..StageHooks::default()
            },
            ..FailoverHooks::default()
        };
        assert!(hooks.run_pre_when_passive(&HookEnv::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_pre_hooks_continue_past_optional_failure() {
        let hooks = FailoverHooks {
            pre: StageHooks {
                when_active: vec![hook("/bin/false", false), hook("/bin/true", true)],
                ..StageHooks::default()
            },
            ..FailoverHooks::default()
        };
        hooks.run_pre_when_active(&HookEnv::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_hooks_never_error() {
        let hooks = FailoverHooks {
            post: StageHooks {
                when_active: vec![hook("/bin/false", true)],
                ..StageHooks::default()
            },
            ..FailoverHooks::default()
        };
        // post hooks log failures and swallow them, even with must_succeed set
        hooks.run_post_when_active(&HookEnv::new()).await;
    }

    #[tokio::test]
    async fn test_hook_env_keys_are_sorted() {
        let mut env = HookEnv::new();
        env.insert("ZULU".to_string(), "1".to_string());
        env.insert("ALPHA".to_string(), "2".to_string());
        env.insert("MIKE".to_string(), "3".to_string());

        let keys: Vec<&String> = env.keys().collect();
        assert_eq!(keys, ["ALPHA", "MIKE", "ZULU"]);

        // a hook that checks the env sees trimmed values
        let mut env = HookEnv::new();
        env.insert("TRIMMED".to_string(), "value with newline\n".to_string());
        let check = Hook {
            name: "env-check".to_string(),
            command: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("[ \"${HOOK_ENV_PREFIX}TRIMMED\" = \"value with newline\" ]"),
            ],
            must_succeed: true,
        };
        check.run(&env).await.unwrap();
    }
}
