//! sopskey command-line interface: provision the age identity SOPS decrypts with.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, warn};
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use sopskey_age::SystemAgeKeygen;
use sopskey_core::{
    config::{bootstrap_template, CONFIG_ENV},
    ensure_key, ensure_policy_file, inspect_keystore, logging,
    workflow::{check_path_regex, WorkflowLevel, WorkflowReport},
    Environment, ProvisionRequest, SopskeyConfig, SopskeyError, WriteMode,
};
use std::env;
use std::fs;
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "sopskey",
    version,
    about = "Generate or import the age key SOPS uses and bootstrap a minimal .sops.yaml."
)]
struct Cli {
    /// Path to the sopskey configuration file (defaults to $SOPSKEY_CONFIG, then the per-user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. `debug`); overrides SOPSKEY_LOG.
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a fresh age key pair with age-keygen and store it.
    Generate {
        #[command(flatten)]
        write: WriteArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Import an existing AGE-SECRET-KEY from stdin (hidden prompt on a terminal).
    Import {
        #[command(flatten)]
        write: WriteArgs,

        /// Read the key (or a whole identity file) from this path instead of stdin.
        #[arg(long)]
        from_file: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Report on the key file: permissions, digest, and the identities it holds.
    Status,

    /// Print the resolved key file path.
    Path,

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },

    /// Emit a commented configuration template.
    Template,
}

#[derive(Args, Debug, Clone, Copy)]
struct WriteArgs {
    /// Replace an existing key file.
    #[arg(long, conflicts_with = "append")]
    force: bool,

    /// Add the identity to an existing key file instead of refusing.
    #[arg(long)]
    append: bool,
}

impl WriteArgs {
    fn mode(self) -> WriteMode {
        if self.force {
            WriteMode::Overwrite
        } else if self.append {
            WriteMode::Append
        } else {
            WriteMode::CreateNew
        }
    }
}

#[derive(Args, Debug, Clone)]
struct OutputArgs {
    /// Skip writing a .sops.yaml policy file.
    #[arg(long)]
    no_policy: bool,

    /// Policy file to create (defaults to policy.path under the current directory).
    #[arg(long)]
    policy_file: Option<PathBuf>,

    /// Print only the public key.
    #[arg(short, long)]
    quiet: bool,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// Dispatch to the requested subcommand.
fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.log_level.as_deref() {
        Some(filter) => logging::init_with_filter(filter),
        None => logging::init("warn"),
    }

    match cli.command {
        Commands::Generate { write, output } => {
            let config = load_cli_config(cli.config.as_deref())?;
            provision(&config, ProvisionRequest::generate(write.mode()), &output)
        }
        Commands::Import {
            write,
            from_file,
            output,
        } => {
            let config = load_cli_config(cli.config.as_deref())?;
            let input = read_import_input(from_file.as_deref())?;
            provision(
                &config,
                ProvisionRequest::import(input.as_str(), write.mode()),
                &output,
            )
        }
        Commands::Status => {
            let config = load_cli_config(cli.config.as_deref())?;
            let location = config.keystore_location(&Environment::capture())?;
            let keygen = match SystemAgeKeygen::from_config(&config) {
                Ok(keygen) => Some(keygen),
                Err(err) => {
                    debug!("skipping public key derivation: {err}");
                    None
                }
            };
            let status = inspect_keystore(&location, keygen.as_ref())?;
            print_report(status.report());
            Ok(())
        }
        Commands::Path => {
            let config = load_cli_config(cli.config.as_deref())?;
            let location = config.keystore_location(&Environment::capture())?;
            println!("{}", location.key_path.display());
            Ok(())
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(SopskeyConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let path = match file.or(cli.config) {
                Some(path) => path,
                None => config_path()?,
            };
            let cfg = SopskeyConfig::load(&path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?;

            let issues = cfg.validate();
            if !issues.is_empty() {
                eprintln!("Configuration validation failed:");
                for issue in &issues {
                    eprintln!("  - {issue}");
                }
                bail!(SopskeyError::InvalidConfig(format!(
                    "{} issue(s) in {}",
                    issues.len(),
                    path.display()
                )));
            }
            println!(
                "Configuration valid ({:?}, key file relative path {}).",
                cfg.format, cfg.keystore.relative_path
            );
            Ok(())
        }
        Commands::Template => {
            print!("{}", bootstrap_template());
            Ok(())
        }
    }
}

/// Ensure the key exists, optionally bootstrap the policy file, and print the recipient.
fn provision(config: &SopskeyConfig, request: ProvisionRequest, output: &OutputArgs) -> Result<()> {
    let location = config.keystore_location(&Environment::capture())?;
    let policy_path = if config.policy.enabled && !output.no_policy {
        check_path_regex(&config.policy.path_regex)?;
        Some(match &output.policy_file {
            Some(path) => path.clone(),
            None => config.policy_path(&env::current_dir()?),
        })
    } else {
        None
    };
    let keygen = SystemAgeKeygen::from_config(config)?;
    let outcome = ensure_key(&location, &keygen, request)?;

    let mut reports = vec![outcome.report];
    let mut policy_error = None;
    if let Some(path) = policy_path {
        match ensure_policy_file(&path, &outcome.public_key, &config.policy.path_regex) {
            Ok((_, report)) => reports.push(report),
            Err(err) => {
                warn!("policy bootstrap failed for {}: {err}", path.display());
                policy_error = Some(err);
            }
        }
    }

    if output.quiet {
        println!("{}", outcome.public_key);
    } else {
        for report in reports {
            print_report(report);
        }
        println!("Age public key: {}", outcome.public_key);
    }

    match policy_error {
        Some(err) => Err(anyhow::Error::new(err).context(format!(
            "key stored at {} but the SOPS policy file was not written",
            outcome.key_path.display()
        ))),
        None => Ok(()),
    }
}

/// Resolve the tool config path: `--config`, then `SOPSKEY_CONFIG`, then the per-user default.
fn config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    SopskeyConfig::default_path().ok_or_else(|| {
        SopskeyError::InvalidConfig(
            "unable to determine a configuration directory; pass --config".into(),
        )
        .into()
    })
}

fn load_cli_config(explicit: Option<&Path>) -> Result<SopskeyConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };
    let config = SopskeyConfig::load_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok(config)
}

/// Collect the key to import: a file, a hidden prompt on a terminal, or one line of piped stdin.
fn read_import_input(from_file: Option<&Path>) -> Result<Zeroizing<String>> {
    if let Some(path) = from_file {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read key from {}", path.display()))?;
        return Ok(Zeroizing::new(contents));
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(Zeroizing::new(prompt_password("AGE-SECRET-KEY: ")?));
    }
    read_first_line(stdin.lock())
}

fn read_first_line<R: BufRead>(mut reader: R) -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line)?;
    Ok(line)
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Security => "SEC",
    }
}

/// Map the underlying failure to the documented exit status.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SopskeyError>())
        .map(|err| err.kind().exit_code())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn exit_code_follows_error_kind_through_context() {
        let err = anyhow::Error::new(SopskeyError::Conflict {
            path: PathBuf::from("/tmp/keys.txt"),
        })
        .context("provisioning failed");
        assert_eq!(exit_code(&err), 4);

        let err: anyhow::Error = SopskeyError::KeygenUnavailable("missing".into()).into();
        assert_eq!(exit_code(&err), 127);

        assert_eq!(exit_code(&anyhow::anyhow!("something else")), 1);
    }

    #[test]
    fn piped_input_reads_only_the_first_line() {
        let input = Cursor::new("AGE-SECRET-KEY-1ABC\nsecond line\n");
        let line = read_first_line(input).unwrap();
        assert_eq!(line.as_str(), "AGE-SECRET-KEY-1ABC\n");
    }

    #[test]
    fn write_flags_map_to_modes() {
        let flags = |force, append| WriteArgs { force, append }.mode();
        assert_eq!(flags(false, false), WriteMode::CreateNew);
        assert_eq!(flags(true, false), WriteMode::Overwrite);
        assert_eq!(flags(false, true), WriteMode::Append);
    }

    #[test]
    fn force_and_append_conflict() {
        let parsed = Cli::try_parse_from(["sopskey", "generate", "--force", "--append"]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from(["sopskey", "import", "--append", "--quiet"]).unwrap();
        match cli.command {
            Commands::Import { write, output, .. } => {
                assert_eq!(write.mode(), WriteMode::Append);
                assert!(output.quiet);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn import_from_file_keeps_whole_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        fs::write(&path, "# created: x\nAGE-SECRET-KEY-1ABC\n").unwrap();
        let input = read_import_input(Some(&path)).unwrap();
        assert!(input.contains("AGE-SECRET-KEY-1ABC"));
    }
}
