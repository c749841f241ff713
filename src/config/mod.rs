//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{collections::HashSet, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::locator::NamingConvention;

pub use cli::{
    CheckArgs, CliArgs, Command, CompilerOverrides, PrecompileArgs, ServeArgs, ServeOverrides,
    TranspileArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "kiln";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LEAF_EXTENSION: &str = "ks";
const DEFAULT_MARKUP_SUFFIX: &str = "html";
const DEFAULT_NAMESPACE: &str = "Site";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub compiler: CompilerSettings,
    pub sites: Vec<SiteSettings>,
}

impl Settings {
    pub fn site(&self, name: &str) -> Option<&SiteSettings> {
        self.sites.iter().find(|site| site.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CompilerSettings {
    pub timeout: Duration,
    pub leaf_extension: String,
    pub markup_suffix: String,
    /// Sources compiled into the foundation tier of every site.
    pub shared_references: Vec<PathBuf>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_COMPILE_TIMEOUT_SECS),
            leaf_extension: DEFAULT_LEAF_EXTENSION.to_string(),
            markup_suffix: DEFAULT_MARKUP_SUFFIX.to_string(),
            shared_references: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub name: String,
    pub root: PathBuf,
    /// Lowercased `Host` header values routed to this site.
    pub hosts: Vec<String>,
    pub namespace: String,
    /// Debug override: serve this bundle and never compile or watch.
    pub prebuilt: Option<PathBuf>,
    pub watch: bool,
}

impl SiteSettings {
    pub fn naming(&self, compiler: &CompilerSettings) -> NamingConvention {
        NamingConvention {
            root_namespace: self.namespace.clone(),
            leaf_extension: compiler.leaf_extension.clone(),
            markup_suffix: compiler.markup_suffix.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("KILN").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Check(args)) => raw.apply_compiler_overrides(&args.compiler),
        Some(Command::Precompile(args)) => raw.apply_compiler_overrides(&args.compiler),
        Some(Command::Transpile(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    use clap::Parser;

    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    compiler: RawCompilerSettings,
    sites: Vec<RawSiteSettings>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(watch) = overrides.watch {
            for site in &mut self.sites {
                site.watch = Some(watch);
            }
        }

        self.apply_compiler_overrides(&overrides.compiler);
    }

    fn apply_compiler_overrides(&mut self, overrides: &CompilerOverrides) {
        if let Some(seconds) = overrides.compiler_timeout_seconds {
            self.compiler.timeout_seconds = Some(seconds);
        }
        if !overrides.shared_references.is_empty() {
            self.compiler
                .shared_references
                .get_or_insert_with(Vec::new)
                .extend(overrides.shared_references.iter().cloned());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            compiler,
            sites,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let compiler = build_compiler_settings(compiler)?;
        let sites = build_site_settings(sites)?;

        Ok(Self {
            server,
            logging,
            compiler,
            sites,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    // Port 0 asks the OS for a free port at bind time.
    let port = server.port.unwrap_or(DEFAULT_PORT);

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_compiler_settings(compiler: RawCompilerSettings) -> Result<CompilerSettings, LoadError> {
    let timeout_seconds = compiler
        .timeout_seconds
        .unwrap_or(DEFAULT_COMPILE_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "compiler.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let leaf_extension = file_suffix(
        compiler.leaf_extension,
        DEFAULT_LEAF_EXTENSION,
        "compiler.leaf_extension",
    )?;
    let markup_suffix = file_suffix(
        compiler.markup_suffix,
        DEFAULT_MARKUP_SUFFIX,
        "compiler.markup_suffix",
    )?;
    if leaf_extension.eq_ignore_ascii_case(&markup_suffix) {
        return Err(LoadError::invalid(
            "compiler.markup_suffix",
            "must differ from the leaf extension",
        ));
    }

    let shared_references = compiler.shared_references.unwrap_or_default();
    if shared_references
        .iter()
        .any(|path| path.as_os_str().is_empty())
    {
        return Err(LoadError::invalid(
            "compiler.shared_references",
            "paths must not be empty",
        ));
    }

    Ok(CompilerSettings {
        timeout: Duration::from_secs(timeout_seconds),
        leaf_extension,
        markup_suffix,
        shared_references,
    })
}

fn build_site_settings(sites: Vec<RawSiteSettings>) -> Result<Vec<SiteSettings>, LoadError> {
    let mut names = HashSet::new();
    let mut claimed_hosts = HashSet::new();
    let mut out = Vec::with_capacity(sites.len());

    for site in sites {
        let name = site.name.map(|name| name.trim().to_string()).unwrap_or_default();
        if name.is_empty() {
            return Err(LoadError::invalid("sites.name", "must not be empty"));
        }
        if !names.insert(name.clone()) {
            return Err(LoadError::invalid(
                "sites.name",
                format!("site `{name}` is configured more than once"),
            ));
        }

        let root = site
            .root
            .filter(|root| !root.as_os_str().is_empty())
            .ok_or_else(|| {
                LoadError::invalid("sites.root", format!("site `{name}` needs a root directory"))
            })?;

        let namespace = site
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if !namespace.is_empty() && !is_dotted_identifier(&namespace) {
            return Err(LoadError::invalid(
                "sites.namespace",
                format!("`{namespace}` is not a dotted identifier (site `{name}`)"),
            ));
        }

        let mut hosts = Vec::new();
        for host in site.hosts.unwrap_or_default() {
            let host = host.trim().to_ascii_lowercase();
            if host.is_empty() {
                continue;
            }
            if !claimed_hosts.insert(host.clone()) {
                return Err(LoadError::invalid(
                    "sites.hosts",
                    format!("host `{host}` is claimed by more than one site"),
                ));
            }
            hosts.push(host);
        }

        out.push(SiteSettings {
            name,
            root,
            hosts,
            namespace,
            prebuilt: site.prebuilt.filter(|path| !path.as_os_str().is_empty()),
            watch: site.watch.unwrap_or(true),
        });
    }

    Ok(out)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompilerSettings {
    timeout_seconds: Option<u64>,
    leaf_extension: Option<String>,
    markup_suffix: Option<String>,
    shared_references: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    name: Option<String>,
    root: Option<PathBuf>,
    hosts: Option<Vec<String>>,
    namespace: Option<String>,
    prebuilt: Option<PathBuf>,
    watch: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn file_suffix(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let value = value
        .map(|value| value.trim().trim_start_matches('.').to_string())
        .unwrap_or_else(|| default.to_string());
    if value.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    if value.contains(['.', '/', '\\']) {
        return Err(LoadError::invalid(
            key,
            format!("`{value}` must be a single extension without separators"),
        ));
    }
    Ok(value)
}

fn is_dotted_identifier(value: &str) -> bool {
    value.split('.').all(|part| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_')
    })
}
