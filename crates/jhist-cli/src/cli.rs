use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const JHIST_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const JHIST_BEFORE_HELP: &str = concat!(
    "jhist ",
    env!("CARGO_PKG_VERSION"),
    " – Historical Julia builds, on demand\n\n",
    "\x1b[1;36mCore workflow\x1b[0m\n",
    "  build            Compile and pack every commit of a release line.\n",
    "  run              Extract a stored revision and launch its julia.\n",
    "  extract          Extract a stored revision into a directory.\n\n",
    "\x1b[1;36mMaintenance\x1b[0m\n",
    "  status           Built/unbuilt commit counts per database.\n",
    "  verify           Check packs against the plan (--fix deletes offenders).\n",
    "  config           Show or persist the data-root preference.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    disable_help_subcommand = true,
    before_help = JHIST_BEFORE_HELP,
    help_template = JHIST_HELP_TEMPLATE
)]
pub struct JhistCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Build packs for the listed release lines (newest by default).",
        override_usage = "jhist build [VERSION ...]"
    )]
    Build(BuildArgs),
    #[command(
        about = "Extract a stored revision and execute its interpreter.",
        override_usage = "jhist run <REV> [ARG...]"
    )]
    Run(RunArgs),
    #[command(
        about = "Extract a stored revision into a directory.",
        override_usage = "jhist extract <REV> <DIR>"
    )]
    Extract(ExtractArgs),
    #[command(
        about = "Validate each pack's contents against the expected plan.",
        override_usage = "jhist verify [VERSION ...] [--fix]"
    )]
    Verify(VerifyArgs),
    #[command(
        about = "Summarize available and unbuilt commits.",
        override_usage = "jhist status [VERSION]"
    )]
    Status(StatusArgs),
    #[command(about = "Inspect or change jhist settings.")]
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(help = "Version specs: X.Y, X.Y+, or X.Y-A.B")]
    pub versions: Vec<String>,
    #[arg(long, help = "Build the debug-assertion variant (separate database)")]
    pub asserts: bool,
    #[arg(long, value_name = "N", help = "Concurrent commit builds")]
    pub jobs: Option<usize>,
    #[arg(long, value_name = "N", help = "Compiler threads per build")]
    pub threads: Option<usize>,
    #[arg(long, value_name = "SECS", help = "Per-commit build timeout")]
    pub timeout: Option<u64>,
    #[arg(long, value_name = "PATH", help = "Scratch space for source and install trees")]
    pub work_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(help = "Branch, tag, or (short) commit hash")]
    pub rev: String,
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments passed to julia"
    )]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    #[arg(help = "Branch, tag, or (short) commit hash")]
    pub rev: String,
    #[arg(help = "Destination directory")]
    pub dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[arg(help = "Version specs: X.Y, X.Y+, or X.Y-A.B")]
    pub versions: Vec<String>,
    #[arg(long, help = "Delete packs that do not conform to the plan")]
    pub fix: bool,
    #[arg(long, help = "Check the debug-assertion databases instead")]
    pub asserts: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(help = "A single version spec; all known lines when omitted")]
    pub version: Option<String>,
    #[arg(long, help = "Report the debug-assertion databases instead")]
    pub asserts: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    #[command(about = "Show or persist the data root holding pack databases.")]
    DataDir {
        #[arg(help = "New data root; prints the current one when omitted")]
        path: Option<PathBuf>,
    },
}
