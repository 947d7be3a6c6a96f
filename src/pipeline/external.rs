//! External phase invocation.

use crate::models::{CommandSpec, PoisonsetError, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

/// Run one external phase to completion.
///
/// The command inherits stdout/stderr. A nonzero exit is an
/// [`PoisonsetError::ExternalPhase`]; past `timeout` the child is killed and
/// [`PoisonsetError::PhaseTimeout`] returned.
pub async fn run_external<K, V>(
    phase: &str,
    spec: &CommandSpec,
    args: &[String],
    env: &[(K, V)],
    timeout: Option<Duration>,
) -> Result<()>
where
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let start = Instant::now();
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    debug!(phase, program = %spec.program, args = ?args, "Launching phase");

    let status = match timeout {
        Some(after) => match tokio::time::timeout(after, cmd.status()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(PoisonsetError::PhaseTimeout {
                    phase: phase.to_string(),
                    after,
                })
            }
        },
        None => cmd.status().await,
    }
    .map_err(|source| PoisonsetError::PhaseSpawn {
        phase: phase.to_string(),
        source,
    })?;

    if !status.success() {
        return Err(PoisonsetError::ExternalPhase {
            phase: phase.to_string(),
            code: status.code(),
        });
    }

    info!(
        phase,
        elapsed = format!("{:.1}s", start.elapsed().as_secs_f64()),
        "Phase finished"
    );
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const NO_ENV: &[(&str, &str)] = &[];

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn test_success() {
        run_external("train", &sh("exit 0"), &[], NO_ENV, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code() {
        let err = run_external("train", &sh("exit 3"), &[], NO_ENV, None)
            .await
            .unwrap_err();
        match err {
            PoisonsetError::ExternalPhase { phase, code } => {
                assert_eq!(phase, "train");
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_hung_phase() {
        let err = run_external(
            "train",
            &sh("sleep 5"),
            &[],
            NO_ENV,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoisonsetError::PhaseTimeout { .. }));
    }

    #[tokio::test]
    async fn test_env_and_args_are_passed() {
        // extra args land in $0, $1, ... of the inline script
        let spec = sh(r#"test "$POISON_SET_DIR" = /tmp/set && test "$1" = -seed"#);
        let args = vec!["cmd".to_string(), "-seed".to_string()];
        run_external("train", &spec, &args, &[("POISON_SET_DIR", "/tmp/set")], None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec {
            program: "/nonexistent/poisonset-trainer".to_string(),
            args: vec![],
        };
        let err = run_external("train", &spec, &[], NO_ENV, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoisonsetError::PhaseSpawn { .. }));
    }
}
