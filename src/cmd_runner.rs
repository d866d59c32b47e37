use anyhow::{Context, bail};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::process::ExitStatus;
use tokio::process::Command;

/// Runs a shell command with environment variables.
///
/// # Arguments
/// * `command` - The command to execute.
/// * `env_vars` - A map of environment variables to set.
///
/// # Returns
/// `ExitStatus` of the executed command.
///
/// # Errors
/// When the command cannot launch, or the command's status cannot be determined.
pub async fn run_shell_command<S: std::hash::BuildHasher>(
    command: &OsStr,
    env_vars: HashMap<OsString, OsString, S>,
) -> io::Result<ExitStatus> {
    let shell = if cfg!(target_os = "windows") {
        "cmd.exe"
    } else {
        "/bin/sh"
    };
    let shell_arg = if cfg!(target_os = "windows") {
        "/C"
    } else {
        "-c"
    };

    let mut cmd = Command::new(shell);
    cmd.arg(shell_arg).arg(command);

    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());

    for (key, value) in env_vars {
        cmd.env(key, value);
    }

    cmd.status().await
}

/// Like [`run_shell_command`], but a non-zero exit status is an error.
pub async fn run_shell_command_checked<S: std::hash::BuildHasher>(
    command: &OsStr,
    env_vars: HashMap<OsString, OsString, S>,
) -> anyhow::Result<()> {
    let status = run_shell_command(command, env_vars)
        .await
        .context(format!(
            "Failed to launch command {}",
            command.to_string_lossy()
        ))?;
    if !status.success() {
        bail!(
            "Command {} exited with status {status}",
            command.to_string_lossy()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_shell_command() {
        let status = run_shell_command("echo Hello, World!".as_ref(), HashMap::new())
            .await
            .expect("Failed to execute command");
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_run_shell_command_checked_surfaces_exit_status() {
        let result = run_shell_command_checked("exit 3".as_ref(), HashMap::new()).await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("exited with status"), "{message}");
    }

    #[tokio::test]
    async fn test_run_shell_command_passes_environment() {
        let mut env = HashMap::new();
        env.insert(
            OsString::from("CHALLENGE_TEST_VALUE"),
            OsString::from("propagated"),
        );
        let status = run_shell_command(r#"test "$CHALLENGE_TEST_VALUE" = propagated"#.as_ref(), env)
            .await
            .expect("Failed to execute command");
        assert!(status.success());
    }
}
