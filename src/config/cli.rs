use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the kiln binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Hot-reloading script and template host"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KILN_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve every configured site over HTTP.
    Serve(Box<ServeArgs>),
    /// Compile every unit of a site and report diagnostics.
    Check(CheckArgs),
    /// Print the script generated for a markup template.
    Transpile(TranspileArgs),
    /// Compile a site into a prebuilt bundle.
    Precompile(PrecompileArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    #[command(flatten)]
    pub compiler: CompilerOverrides,

    /// Enable or disable file watching for every site.
    #[arg(
        long = "watch",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub watch: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CompilerOverrides {
    /// Override the per-unit compile timeout.
    #[arg(long = "compiler-timeout-seconds", value_name = "SECONDS")]
    pub compiler_timeout_seconds: Option<u64>,

    /// Add a shared reference source compiled into the foundation tier.
    #[arg(long = "shared-reference", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub shared_references: Vec<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub compiler: CompilerOverrides,

    /// Site to check; every configured site when omitted.
    #[arg(long, value_name = "NAME")]
    pub site: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct TranspileArgs {
    /// Markup file to transpile.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Type name of the template; derived from the file name when omitted.
    #[arg(long = "type-name", value_name = "TYPE")]
    pub type_name: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct PrecompileArgs {
    #[command(flatten)]
    pub compiler: CompilerOverrides,

    /// Site to compile.
    #[arg(long, value_name = "NAME")]
    pub site: String,

    /// Where to write the bundle.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub out: PathBuf,
}
