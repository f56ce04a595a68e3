use crate::config::policy::whitelist::Whitelist;
use crate::config::settings::GraderConfig;
use crate::config::types::{ExecutionRequest, Outcome, SandboxConfig, Value};
use crate::config::validator::validate_config;
use crate::core::sandbox::{Executor, Sandbox};
use crate::core::supervisor::ForkedSandbox;
use crate::core::types::ForkHostLaunch;
use crate::exec::pool::WorkerPool;
use crate::loader::CodePath;
use crate::verdict::repetition::repeat;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used when re-executed as a forked host)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// Restricted code locations for the internal fork-host role
    #[arg(long = "restricted", hide = true)]
    role_restricted: Vec<PathBuf>,
    /// Support code locations for the internal fork-host role
    #[arg(long = "support", hide = true)]
    role_support: Vec<PathBuf>,
    /// Serialised sandbox configuration for the internal fork-host role
    #[arg(long, hide = true)]
    sandbox_config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Invocation {
    /// Restricted code location (file or directory), repeatable
    #[arg(long)]
    restricted: Vec<PathBuf>,
    /// Support code location (file or directory), repeatable
    #[arg(long)]
    support: Vec<PathBuf>,
    /// Parameter type of the next argument (i32, i64, f32, f64, bool, string)
    #[arg(long = "param-type", value_name = "TYPE")]
    param_types: Vec<String>,
    /// Argument value: JSON (`{"I32": 3}`) or a literal of the matching parameter type
    #[arg(long = "arg", value_name = "VALUE", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run in a forked child process
    #[arg(long)]
    forked: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke one entry point once and print its result
    Run {
        /// Entry point as Type.member
        #[arg(long)]
        entry: String,
        #[command(flatten)]
        invocation: Invocation,
    },
    /// Invoke entry points repeatedly and print the folded outcomes
    Repeat {
        /// Entry point as Type.member, repeatable
        #[arg(long, required = true)]
        entry: Vec<String>,
        /// Repetitions per entry point
        #[arg(long)]
        repetitions: Option<u32>,
        #[command(flatten)]
        invocation: Invocation,
    },
    /// Validate a whitelist definition and print its entries
    CheckWhitelist {
        /// Whitelist definition file
        file: PathBuf,
    },
}

pub fn run() -> Result<()> {
    // Initialize structured logging
    env_logger::init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        if role == "fork-host" {
            return run_fork_host(cli.role_restricted, cli.role_support, cli.sandbox_config);
        }
        return Err(anyhow!("unsupported internal role: {}", role));
    }

    let command = cli.command.ok_or_else(|| anyhow!("missing command"))?;
    match command {
        Commands::Run { entry, invocation } => {
            let (grader, executor) = prepare(&invocation)?;
            let request = build_request(&entry, &invocation)?;
            log::debug!("Running {} (forked: {})", request.entry_name(), grader.forked);

            let result = executor.execute(&request)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !matches!(result.outcome, Outcome::Success(_)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Repeat {
            entry,
            repetitions,
            invocation,
        } => {
            let (grader, executor) = prepare(&invocation)?;
            let mut config = grader.repetition_config();
            if let Some(repetitions) = repetitions {
                config.repetitions = repetitions;
            }
            let requests = entry
                .iter()
                .map(|e| build_request(e, &invocation))
                .collect::<Result<Vec<_>>>()?;

            let outcomes = if requests.len() == 1 {
                vec![repeat(executor.as_ref(), &requests[0], &config)]
            } else {
                WorkerPool::new(grader.parallelism).repeat_all(executor.as_ref(), &requests, &config)
            };

            let mut report = Vec::with_capacity(outcomes.len());
            let mut all_passed = true;
            for (request, outcome) in requests.iter().zip(outcomes) {
                let outcome = outcome?;
                all_passed &= outcome.passed;
                report.push(serde_json::json!({
                    "entry": request.entry_name(),
                    "outcome": outcome,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !all_passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::CheckWhitelist { file } => {
            let whitelist = Whitelist::load(&file)?;
            for entry in whitelist.entries() {
                println!("{}", entry);
            }
            eprintln!("{}: {} entries", file.display(), whitelist.len());
            Ok(())
        }
    }
}

fn run_fork_host(
    restricted: Vec<PathBuf>,
    support: Vec<PathBuf>,
    sandbox_config: Option<String>,
) -> Result<()> {
    let config_json = sandbox_config
        .ok_or_else(|| anyhow!("--sandbox-config is required for --internal-role=fork-host"))?;
    let config: SandboxConfig =
        serde_json::from_str(&config_json).context("invalid --sandbox-config")?;
    if let Err(e) = crate::observability::audit::init_security_logger(None) {
        log::warn!("Fork host continuing without audit file: {}", e);
    }
    crate::core::proxy::run_fork_host_role(ForkHostLaunch {
        restricted,
        support,
        config,
    })
    .map_err(Into::into)
}

/// Load and validate configuration, start the audit trail and build the
/// executor for this invocation.
fn prepare(invocation: &Invocation) -> Result<(GraderConfig, Box<dyn Executor>)> {
    let mut grader = match &invocation.config {
        Some(path) => GraderConfig::load_from_file(path)?,
        None => GraderConfig::default(),
    };
    if invocation.forked {
        grader.forked = true;
    }
    // warnings are logged by the validator
    validate_config(&grader)?;

    // Initialize security logger for audit trail
    crate::observability::audit::init_security_logger(grader.audit_log.clone())?;

    let restricted = code_path(&invocation.restricted);
    let support = code_path(&invocation.support);
    let sandbox_config = grader.sandbox_config()?;

    let executor: Box<dyn Executor> = if grader.forked {
        Box::new(ForkedSandbox::new(
            &restricted,
            &support,
            sandbox_config,
            grader.fork_options(),
        )?)
    } else {
        Box::new(Sandbox::new(&restricted, &support, sandbox_config)?)
    };
    Ok((grader, executor))
}

fn code_path(locations: &[PathBuf]) -> CodePath {
    locations
        .iter()
        .fold(CodePath::new(), |path, location| path.with_location(location.clone()))
}

fn build_request(entry: &str, invocation: &Invocation) -> Result<ExecutionRequest> {
    if invocation.param_types.len() != invocation.args.len() {
        return Err(anyhow!(
            "{} --param-type values but {} --arg values",
            invocation.param_types.len(),
            invocation.args.len()
        ));
    }
    let mut request = ExecutionRequest::parse_entry(entry)?;
    for (param_type, text) in invocation.param_types.iter().zip(&invocation.args) {
        request = request.with_arg(param_type.clone(), parse_arg(param_type, text)?);
    }
    Ok(request)
}

/// Accept either a tagged JSON value or a bare literal of the parameter type.
fn parse_arg(param_type: &str, text: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }
    let value = match param_type {
        "i32" => Value::I32(text.parse()?),
        "i64" => Value::I64(text.parse()?),
        "f32" => Value::F32(text.parse()?),
        "f64" => Value::F64(text.parse()?),
        "bool" => Value::Bool(text.parse()?),
        "string" => Value::Str(text.to_string()),
        other => return Err(anyhow!("cannot parse argument {:?} as {}", text, other)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_arguments_follow_parameter_type() {
        assert_eq!(parse_arg("i32", "-3").unwrap(), Value::I32(-3));
        assert_eq!(parse_arg("i64", "40").unwrap(), Value::I64(40));
        assert_eq!(parse_arg("bool", "true").unwrap(), Value::Bool(true));
        assert_eq!(parse_arg("string", "hello").unwrap(), Value::Str("hello".into()));
        assert!(parse_arg("i32", "abc").is_err());
    }

    #[test]
    fn tagged_json_arguments_win() {
        assert_eq!(parse_arg("i64", r#"{"I64": 7}"#).unwrap(), Value::I64(7));
        assert_eq!(parse_arg("string", r#"{"Str": "x"}"#).unwrap(), Value::Str("x".into()));
    }

    #[test]
    fn cli_parses_run_and_hidden_role() {
        let cli = Cli::try_parse_from([
            "gradebox",
            "run",
            "--entry",
            "student.Calc.add",
            "--restricted",
            "sub/",
            "--param-type",
            "i32",
            "--arg",
            "-3",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run { entry, invocation }) => {
                assert_eq!(entry, "student.Calc.add");
                let request = build_request(&entry, &invocation).unwrap();
                assert_eq!(request.args, vec![Value::I32(-3)]);
            }
            _ => panic!("expected run"),
        }

        let role = Cli::try_parse_from([
            "gradebox",
            "--internal-role",
            "fork-host",
            "--restricted",
            "/a",
            "--restricted",
            "/b",
            "--sandbox-config",
            "{}",
        ])
        .unwrap();
        assert_eq!(role.internal_role.as_deref(), Some("fork-host"));
        assert_eq!(role.role_restricted.len(), 2);
    }

    #[test]
    fn mismatched_argument_counts_are_rejected() {
        let invocation = Invocation {
            restricted: vec![],
            support: vec![],
            param_types: vec!["i32".into()],
            args: vec![],
            config: None,
            forked: false,
        };
        assert!(build_request("a.B.c", &invocation).is_err());
    }
}
