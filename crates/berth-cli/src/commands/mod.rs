//! CLI command definitions and dispatch.

pub mod create;
pub mod delete;
pub mod exec;
pub mod init;
pub mod kill;
pub mod list;
pub mod pause;
pub mod ps;
pub mod resume;
pub mod run;
pub mod start;
pub mod state;
pub mod update;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use berth_common::config::RuntimeConfig;
use berth_common::types::ContainerId;
use berth_runtime::config::{ContainerConfig, Process, User};
use berth_runtime::factory::Factory;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// berth — container lifecycle manager.
#[derive(Parser, Debug)]
#[command(name = berth_common::constants::BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding container state.
    #[arg(long, global = true, env = "BERTH_ROOT", default_value = berth_common::constants::DEFAULT_ROOT)]
    pub root: PathBuf,

    /// Log filter, used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Format of log lines on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container and stop its init process at the exec gate.
    Create(create::CreateArgs),
    /// Run the user program of a created container.
    Start(start::StartArgs),
    /// Create and start a container in one step.
    Run(run::RunArgs),
    /// Run an additional process inside a running container.
    Exec(exec::ExecArgs),
    /// Send a signal to a container.
    Kill(kill::KillArgs),
    /// Freeze every process of a container.
    Pause(pause::PauseArgs),
    /// Thaw a paused container.
    Resume(resume::ResumeArgs),
    /// Change the resource limits of a container.
    Update(update::UpdateArgs),
    /// Remove a stopped container.
    Delete(delete::DeleteArgs),
    /// Print the state of a container.
    State(state::StateArgs),
    /// List containers.
    List(list::ListArgs),
    /// List the processes of a container.
    Ps(ps::PsArgs),
    /// Companion entry point used by the runtime itself.
    #[command(hide = true)]
    Init(init::InitCommandArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Command::Init(args) = &cli.command {
        return Ok(init::execute(args, &cli.log_level));
    }
    let factory = Factory::new(RuntimeConfig {
        root: cli.root,
        log_level: cli.log_level.clone(),
        ..RuntimeConfig::default()
    })?;
    let done = |result: anyhow::Result<()>| result.map(|()| ExitCode::SUCCESS);
    match cli.command {
        Command::Create(args) => done(create::execute(args, &factory)),
        Command::Start(args) => done(start::execute(&args, &factory)),
        Command::Run(args) => run::execute(args, &factory),
        Command::Exec(args) => exec::execute(args, &factory),
        Command::Kill(args) => done(kill::execute(&args, &factory)),
        Command::Pause(args) => done(pause::execute(&args, &factory)),
        Command::Resume(args) => done(resume::execute(&args, &factory)),
        Command::Update(args) => done(update::execute(&args, &factory)),
        Command::Delete(args) => done(delete::execute(&args, &factory)),
        Command::State(args) => done(state::execute(&args, &factory)),
        Command::List(args) => done(list::execute(&args, &factory)),
        Command::Ps(args) => done(ps::execute(&args, &factory)),
        Command::Init(_) => Ok(ExitCode::SUCCESS),
    }
}

/// Parses a container id argument.
fn parse_id(s: &str) -> Result<ContainerId, String> {
    ContainerId::new(s).map_err(|e| e.to_string())
}

/// Reads a JSON container configuration.
fn load_config(path: &Path) -> anyhow::Result<ContainerConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// The process to start, shared by `create`, `run`, and `exec`.
#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Working directory inside the container.
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,

    /// Extra environment variables (`KEY=value`).
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Credentials as `UID[:GID]`.
    #[arg(short, long, value_parser = parse_user)]
    pub user: Option<User>,

    /// Program and arguments.
    #[arg(last = true, required = true)]
    pub args: Vec<String>,
}

impl ProcessArgs {
    /// Builds the process, `init` for the container's first one.
    fn into_process(self, init: bool) -> Process {
        let mut process = Process::init(self.args);
        process.init = init;
        process.env.extend(self.env);
        process.cwd = self.cwd;
        if let Some(user) = self.user {
            process.user = user;
        }
        process
    }
}

fn parse_user(s: &str) -> Result<User, String> {
    let (uid, gid) = s.split_once(':').unwrap_or((s, s));
    let uid = uid.parse().map_err(|_| format!("invalid uid {uid:?}"))?;
    let gid = gid.parse().map_err(|_| format!("invalid gid {gid:?}"))?;
    Ok(User {
        uid,
        gid,
        additional_gids: Vec::new(),
    })
}
