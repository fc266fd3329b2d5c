//! Execution wrapper for invoking `age-keygen`.
//!
//! Shell integration stays isolated here so the generator logic can be tested
//! against fake binaries with deterministic output.

use sopskey_core::error::{SopskeyError, SopskeyResult};
use sopskey_core::keyfile::{extract_secret_key_line, SECRET_KEY_MARKER};
use sopskey_core::keygen::GeneratedIdentity;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const PUBLIC_KEY_COMMENT: &str = "# public key:";
const STDERR_PUBLIC_KEY_PREFIX: &str = "Public key:";

#[derive(Debug, Clone)]
pub(crate) struct AgeKeygenCommand {
    binary: PathBuf,
    timeout: Duration,
}

struct Output {
    stdout: Zeroizing<String>,
    stderr: String,
    status: i32,
}

impl AgeKeygenCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Run `age-keygen` with no arguments and parse the identity it prints.
    pub(crate) fn generate(&self) -> SopskeyResult<GeneratedIdentity> {
        let out = self.run(&[], None)?;
        if out.status != 0 {
            return Err(SopskeyError::Generation(format!(
                "{} exited with code {}: {}",
                self.binary.display(),
                out.status,
                diagnostic(&out)
            )));
        }
        parse_generated(&out.stdout, &out.stderr)
    }

    /// Run `age-keygen -y`, feeding the secret on stdin so it never touches disk.
    pub(crate) fn derive_public(&self, secret: &str) -> SopskeyResult<String> {
        let mut payload = Zeroizing::new(secret.trim().to_string());
        payload.push('\n');
        let out = self.run(&["-y"], Some(payload.as_bytes()))?;
        if out.status != 0 {
            return Err(SopskeyError::Generation(format!(
                "{} -y exited with code {}: {}",
                self.binary.display(),
                out.status,
                diagnostic(&out)
            )));
        }

        out.stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                SopskeyError::Generation(format!(
                    "{} -y printed no public key",
                    self.binary.display()
                ))
            })
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> SopskeyResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => SopskeyError::KeygenUnavailable(format!(
                "{} does not exist",
                self.binary.display()
            )),
            _ => SopskeyError::Generation(format!(
                "failed to start {}: {err}",
                self.binary.display()
            )),
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(payload) {
                    if err.kind() != ErrorKind::BrokenPipe {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(SopskeyError::Io(err));
                    }
                }
                // stdin drops here so the child sees EOF
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> SopskeyResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SopskeyError::Generation(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| SopskeyError::Generation("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SopskeyError::Generation("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr: stderr.as_str().to_string(),
            status: status.code().unwrap_or(-1),
        })
    }
}

/// Pull the secret and recipient out of `age-keygen` output.
///
/// The recipient comes from the `# public key:` comment on stdout, or from the
/// `Public key:` line age-keygen writes to stderr when stdout is not a terminal.
pub(crate) fn parse_generated(stdout: &str, stderr: &str) -> SopskeyResult<GeneratedIdentity> {
    let secret = extract_secret_key_line(stdout).ok_or_else(|| {
        SopskeyError::Generation(format!(
            "output did not contain a `{SECRET_KEY_MARKER}` line"
        ))
    })?;

    let public_key = stdout
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(PUBLIC_KEY_COMMENT))
        .or_else(|| {
            stderr
                .lines()
                .map(str::trim)
                .find_map(|line| line.strip_prefix(STDERR_PUBLIC_KEY_PREFIX))
        })
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SopskeyError::Generation("output did not report a public key".into()))?;

    Ok(GeneratedIdentity {
        secret: Zeroizing::new(secret.to_string()),
        public_key,
    })
}

fn diagnostic(output: &Output) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        "no additional output".to_string()
    } else {
        stderr.to_string()
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<SopskeyResult<Zeroizing<String>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> SopskeyResult<Zeroizing<String>> {
        let mut buf = Zeroizing::new(Vec::new());
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(Zeroizing::new(String::from_utf8_lossy(&buf).into_owned()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "AGE-SECRET-KEY-1XYZQPZRY9X8GF2TVDW0S3JN54KHCE6MUA7L";
    const PUBLIC: &str = "age1xyzqpzry9x8gf2tvdw0s3jn54khce6mua7l";

    #[test]
    fn parses_header_public_key() {
        let stdout = format!("# created: 2024-01-01T00:00:00Z\n# public key: {PUBLIC}\n{SECRET}\n");
        let identity = parse_generated(&stdout, "").unwrap();
        assert_eq!(identity.secret.as_str(), SECRET);
        assert_eq!(identity.public_key, PUBLIC);
    }

    #[test]
    fn falls_back_to_stderr_public_key() {
        let identity = parse_generated(SECRET, &format!("Public key: {PUBLIC}\n")).unwrap();
        assert_eq!(identity.public_key, PUBLIC);
    }

    #[test]
    fn rejects_output_without_secret_or_public_key() {
        assert!(matches!(
            parse_generated("garbage", "").unwrap_err(),
            SopskeyError::Generation(_)
        ));
        assert!(matches!(
            parse_generated(SECRET, "").unwrap_err(),
            SopskeyError::Generation(_)
        ));
    }
}
