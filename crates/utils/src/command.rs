//! Helpers intended for [`std::process::Command`].

use std::io::Read;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full command we will execute.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, discarding stdout. The error message
    /// will include the final lines of stderr.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process with stdio inherited from this process.
    /// Intended for long-running commands whose output the operator
    /// should see live.
    fn run_inherited(&mut self) -> Result<()>;

    /// Execute the child process, capturing stdout as a UTF-8 string
    /// with trailing whitespace trimmed.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// Render the command in a way that can be pasted into a POSIX shell.
    fn to_string_pretty(&self) -> String;
}

/// Keep the last lines of stderr for error messages; a full dd or
/// mkfs transcript would drown the actual failure.
const MAX_STDERR_LINES: usize = 10;

fn stderr_tail(stderr: &[u8]) -> String {
    let s = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(MAX_STDERR_LINES);
    lines[start..].join("\n")
}

fn command_name(c: &Command) -> String {
    c.get_program().to_string_lossy().into_owned()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run(&mut self) -> Result<()> {
        let name = command_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {name}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{name} failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        Ok(())
    }

    fn run_inherited(&mut self) -> Result<()> {
        let name = command_name(self);
        let status = self
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Spawning {name}"))?;
        if !status.success() {
            anyhow::bail!("{name} failed: {status}");
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let name = command_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {name}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{name} failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        let mut s = String::from_utf8(output.stdout)
            .with_context(|| format!("Parsing output of {name} as UTF-8"))?;
        s.truncate(s.trim_end().len());
        Ok(s)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = command_name(self);
        let mut child = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {name}"))?;
        // SAFETY: we requested a piped stdout above
        let stdout = child.stdout.take().expect("piped stdout");
        let r: std::result::Result<T, _> = serde_json::from_reader(stdout);
        let mut stderr = Vec::new();
        if let Some(mut f) = child.stderr.take() {
            let _ = f.read_to_end(&mut stderr);
        }
        let status = child.wait().with_context(|| format!("Waiting for {name}"))?;
        if !status.success() {
            anyhow::bail!("{name} failed ({status}): {}", stderr_tail(&stderr));
        }
        r.with_context(|| format!("Parsing JSON from {name}"))
    }

    fn to_string_pretty(&self) -> String {
        let args = std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        shlex::try_join(args.iter().map(|a| a.as_str())).unwrap_or_else(|_| args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run() -> Result<()> {
        Command::new("true").run()?;
        assert!(Command::new("false").run().is_err());
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .unwrap_err();
        assert!(e.to_string().contains("oops"), "{e}");
        Ok(())
    }

    #[test]
    fn test_run_get_string() -> Result<()> {
        let s = Command::new("echo").args(["-n", "hello"]).run_get_string()?;
        assert_eq!(s, "hello");
        // Trailing newline is trimmed
        let s = Command::new("echo").arg("hello").run_get_string()?;
        assert_eq!(s, "hello");
        Ok(())
    }

    #[test]
    fn test_run_and_parse_json() -> Result<()> {
        #[derive(serde::Deserialize)]
        struct Foo {
            a: u32,
        }
        let v: Foo = Command::new("echo")
            .arg(r#"{"a": 42}"#)
            .run_and_parse_json()?;
        assert_eq!(v.a, 42);
        // A failing process is an error even if it printed valid JSON
        assert!(Command::new("sh")
            .args(["-c", "echo '{}'; exit 1"])
            .run_and_parse_json::<serde_json::Value>()
            .is_err());
        Ok(())
    }

    #[test]
    fn test_to_string_pretty() {
        let mut c = Command::new("dd");
        c.args(["if=/dev/zero", "of=a b"]);
        similar_asserts::assert_eq!(c.to_string_pretty(), "dd if=/dev/zero 'of=a b'");
    }
}
