use crate::error::{Result, ZfsError};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

fn render(program: &str, args: &[&str]) -> String {
    format!("{} {}", program, args.join(" "))
}

/// Execute a command and fail on non-zero exit code
pub fn exec(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = exec_unchecked(program, args)?;

    if output.exit_code != 0 {
        return Err(ZfsError::command_failed(
            render(program, args),
            output.exit_code,
            output.stderr.trim(),
        ));
    }

    Ok(output)
}

/// Execute a command and return output regardless of exit code
pub fn exec_unchecked(program: &str, args: &[&str]) -> Result<CommandOutput> {
    debug!("Executing: {}", render(program, args));

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ZfsError::command_failed(render(program, args), -1, e.to_string()))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    debug!(
        "Command exited with code {}: {}",
        result.exit_code,
        render(program, args)
    );

    Ok(result)
}

/// Execute a command feeding `input` on stdin; used for key material so it
/// never appears in the argument list
pub fn exec_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<CommandOutput> {
    debug!("Executing with stdin <redacted>: {}", render(program, args));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ZfsError::command_failed(render(program, args), -1, e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input)?;
    }

    let output = child.wait_with_output()?;
    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    debug!(
        "Command exited with code {}: {}",
        result.exit_code,
        render(program, args)
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_captures_stdout() {
        let out = exec("echo", &["hello"]).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_exec_fails_on_nonzero_exit() {
        let err = exec("false", &[]).unwrap_err();
        assert!(matches!(err, ZfsError::CommandFailed { .. }));

        let out = exec_unchecked("false", &[]).unwrap();
        assert_ne!(out.exit_code, 0);
    }

    #[test]
    fn test_exec_with_stdin_pipes_input() {
        let out = exec_with_stdin("cat", &[], b"secret").unwrap();
        assert_eq!(out.stdout, "secret");
    }

    #[test]
    fn test_missing_program() {
        let err = exec_unchecked("definitely-not-a-real-binary-tankd", &[]).unwrap_err();
        assert!(matches!(err, ZfsError::CommandFailed { exit_code: -1, .. }));
    }
}
