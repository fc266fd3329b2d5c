use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::{tempdir, TempDir};

const FIXTURE_SECRET: &str = "AGE-SECRET-KEY-1XYZQPZRY9X8GF2TVDW0S3JN54KHCE6MUA7L";
const FIXTURE_PUBLIC: &str = "age1xyzqpzry9x8gf2tvdw0s3jn54khce6mua7l";

const FAKE_AGE_KEYGEN: &str = r##"#!/bin/sh
if [ "$1" = "-y" ]; then
  while IFS= read -r line; do
    case "$line" in
      AGE-SECRET-KEY-1*)
        payload=${line#AGE-SECRET-KEY-1}
        printf 'age1%s\n' "$(printf '%s' "$payload" | tr 'A-Z' 'a-z')"
        exit 0
        ;;
    esac
  done
  exit 1
fi
payload=$(od -An -N20 -tx1 /dev/urandom | tr -d ' \n' | tr '0-9a-f' 'QPZRY9X8GF2TVDW0')
echo "# created: 2024-01-01T00:00:00Z"
echo "# public key: age1$(printf '%s' "$payload" | tr 'A-Z' 'a-z')"
echo "AGE-SECRET-KEY-1$payload"
"##;

struct Sandbox {
    dir: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        Self::with_binary(None)
    }

    fn with_binary(binary: Option<&Path>) -> Self {
        let dir = tempdir().unwrap();
        let binary = match binary {
            Some(path) => path.to_path_buf(),
            None => {
                let path = dir.path().join("age-keygen");
                fs::write(&path, FAKE_AGE_KEYGEN).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
                path
            }
        };
        let config = dir.path().join("sopskey.toml");
        fs::write(
            &config,
            format!("[keygen]\nbinary = \"{}\"\ntimeout_secs = 5\n", binary.display()),
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("repo")).unwrap();
        Self { dir, config }
    }

    fn key_path(&self) -> PathBuf {
        self.dir.path().join("xdg").join("sops").join("age").join("keys.txt")
    }

    fn policy_path(&self) -> PathBuf {
        self.dir.path().join("repo").join(".sops.yaml")
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Output {
        let mut command = Command::new(env!("CARGO_BIN_EXE_sopskey"));
        command
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .current_dir(self.dir.path().join("repo"))
            .env("XDG_CONFIG_HOME", self.dir.path().join("xdg"))
            .env("HOME", self.dir.path())
            .env_remove("SOPS_AGE_KEY_FILE")
            .env_remove("SOPSKEY_CONFIG")
            .env_remove("SOPSKEY_LOG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().unwrap();
        {
            let mut pipe = child.stdin.take().unwrap();
            if let Some(input) = stdin {
                pipe.write_all(input.as_bytes()).unwrap();
            }
        }
        child.wait_with_output().unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn generate_quiet_prints_only_the_public_key() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["generate", "--quiet"], None);
    assert!(output.status.success(), "{output:?}");

    let printed = stdout(&output);
    let lines: Vec<&str> = printed.lines().collect();
    assert_eq!(lines.len(), 1, "{printed}");
    assert!(lines[0].starts_with("age1"));

    let mode = fs::metadata(sandbox.key_path()).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);

    let policy = fs::read_to_string(sandbox.policy_path()).unwrap();
    assert!(policy.contains(lines[0]));
    assert!(policy.contains("creation_rules"));
}

#[test]
fn second_generate_exits_with_conflict_and_keeps_the_file() {
    let sandbox = Sandbox::new();
    assert!(sandbox.run(&["generate", "--no-policy"], None).status.success());
    let before = fs::read(sandbox.key_path()).unwrap();

    let output = sandbox.run(&["generate", "--no-policy"], None);
    assert_eq!(output.status.code(), Some(4), "{output:?}");
    assert_eq!(fs::read(sandbox.key_path()).unwrap(), before);
}

#[test]
fn import_from_stdin_reports_the_derived_key() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(
        &["import", "--no-policy"],
        Some(&format!("{FIXTURE_SECRET}\n")),
    );
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output)
        .lines()
        .any(|line| line == format!("Age public key: {FIXTURE_PUBLIC}")));
    assert!(!sandbox.policy_path().exists());

    let contents = fs::read_to_string(sandbox.key_path()).unwrap();
    assert!(contents.lines().any(|line| line == FIXTURE_SECRET));
}

#[test]
fn invalid_import_exits_with_validation_status() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["import"], Some("not a key\n"));
    assert_eq!(output.status.code(), Some(2), "{output:?}");
    assert!(!sandbox.key_path().exists());
    assert!(!sandbox.policy_path().exists());
}

#[test]
fn path_prints_the_resolved_location() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["path"], None);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output).trim(), sandbox.key_path().display().to_string());
}

#[test]
fn missing_keygen_exits_127() {
    let sandbox = Sandbox::with_binary(Some(Path::new("/nonexistent/age-keygen")));
    let output = sandbox.run(&["generate"], None);
    assert_eq!(output.status.code(), Some(127), "{output:?}");
    assert!(!sandbox.key_path().exists());
}

#[test]
fn status_lists_the_imported_identity() {
    let sandbox = Sandbox::new();
    let import = sandbox.run(
        &["import", "--no-policy"],
        Some(&format!("{FIXTURE_SECRET}\n")),
    );
    assert!(import.status.success(), "{import:?}");

    let output = sandbox.run(&["status"], None);
    assert!(output.status.success(), "{output:?}");
    let printed = stdout(&output);
    assert!(printed.contains("mode 0600"), "{printed}");
    assert!(printed.contains(&format!("Identity 1: {FIXTURE_PUBLIC}")), "{printed}");
}

#[test]
fn invalid_policy_regex_is_rejected_before_any_key_is_written() {
    let sandbox = Sandbox::new();
    let mut config = fs::OpenOptions::new()
        .append(true)
        .open(&sandbox.config)
        .unwrap();
    config
        .write_all(b"[policy]\npath_regex = '(unclosed'\n")
        .unwrap();

    let output = sandbox.run(&["generate"], None);
    assert_eq!(output.status.code(), Some(6), "{output:?}");
    assert!(!sandbox.key_path().exists());

    let retry = sandbox.run(&["generate", "--no-policy"], None);
    assert!(retry.status.success(), "{retry:?}");
}

#[test]
fn policy_write_failure_still_reports_the_public_key() {
    let sandbox = Sandbox::new();
    let blocker = sandbox.dir.path().join("not-a-dir");
    fs::write(&blocker, "").unwrap();
    let policy = blocker.join(".sops.yaml");

    let output = sandbox.run(
        &[
            "import",
            "--policy-file",
            policy.to_str().unwrap(),
        ],
        Some(&format!("{FIXTURE_SECRET}\n")),
    );
    assert_eq!(output.status.code(), Some(5), "{output:?}");
    assert!(stdout(&output)
        .lines()
        .any(|line| line == format!("Age public key: {FIXTURE_PUBLIC}")));
    assert!(sandbox.key_path().exists());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("policy file was not written"), "{stderr}");
}
