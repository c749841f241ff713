use std::{path::Path, process, sync::Arc};

use kiln::{
    application::{
        error::AppError, prebuilt::PrebuiltBundle, site::SiteRuntime, tiers::SiteBuild,
    },
    backend::{CompileBackend, script::ScriptBackend},
    config::{self, SiteSettings},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    template::{self, TemplateUnit},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;
    let backend: Arc<dyn CompileBackend> = Arc::new(ScriptBackend::new());

    match command {
        config::Command::Serve(_) => run_serve(settings, backend).await,
        config::Command::Check(args) => run_check(settings, args, backend).await,
        config::Command::Transpile(args) => run_transpile(settings, args).await,
        config::Command::Precompile(args) => run_precompile(settings, args, backend).await,
    }
}

async fn run_serve(
    settings: config::Settings,
    backend: Arc<dyn CompileBackend>,
) -> Result<(), AppError> {
    let mut sites = Vec::with_capacity(settings.sites.len());
    for site in &settings.sites {
        sites.push(SiteRuntime::start(site, &settings.compiler, Arc::clone(&backend)).await?);
    }
    if sites.is_empty() {
        info!(
            target = "kiln::serve",
            "no sites configured; every request will be answered with 404"
        );
    }

    http::serve(&settings.server, HttpState::new(sites)).await?;
    info!(target = "kiln::serve", "server stopped");
    Ok(())
}

async fn run_check(
    settings: config::Settings,
    args: config::CheckArgs,
    backend: Arc<dyn CompileBackend>,
) -> Result<(), AppError> {
    let selected: Vec<&SiteSettings> = match args.site.as_deref() {
        Some(name) => vec![
            settings
                .site(name)
                .ok_or_else(|| AppError::UnknownSite(name.to_string()))?,
        ],
        None => settings.sites.iter().collect(),
    };

    let mut failed = 0usize;
    for site in selected {
        match build_site(site, &settings.compiler, Arc::clone(&backend)).await {
            Ok(build) => {
                println!(
                    "{}: {} unit(s) compiled, {} failed",
                    site.name,
                    build.leaves.len() + 1 + usize::from(build.global.is_some()),
                    build.failures.len()
                );
                for (identity, error) in &build.failures {
                    println!("  {}\n    {}", identity, error.to_string().replace('\n', "\n    "));
                }
                failed += build.failures.len();
            }
            Err(error) => {
                println!("{}: {error}", site.name);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(AppError::validation(format!(
            "{failed} unit(s) failed to compile"
        )));
    }
    Ok(())
}

async fn run_transpile(
    settings: config::Settings,
    args: config::TranspileArgs,
) -> Result<(), AppError> {
    let markup = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(InfraError::from)?;

    let code_behind = code_behind_path(&args.file, &settings.compiler.markup_suffix);
    let has_code_behind = match &code_behind {
        Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
        None => false,
    };
    let type_name = match args.type_name {
        Some(type_name) => type_name,
        None => derive_type_name(
            &args.file,
            &settings.compiler.leaf_extension,
            &settings.compiler.markup_suffix,
        )?,
    };

    let generated = template::transpile(&TemplateUnit {
        type_name: &type_name,
        markup_path: &args.file,
        markup: &markup,
        has_code_behind,
    })
    .map_err(|diagnostic| AppError::validation(diagnostic.to_string()))?;

    print!("{generated}");
    Ok(())
}

async fn run_precompile(
    settings: config::Settings,
    args: config::PrecompileArgs,
    backend: Arc<dyn CompileBackend>,
) -> Result<(), AppError> {
    let site = settings
        .site(&args.site)
        .ok_or_else(|| AppError::UnknownSite(args.site.clone()))?;

    let build = build_site(site, &settings.compiler, Arc::clone(&backend)).await?;
    for (identity, error) in &build.failures {
        error!(
            target = "kiln::precompile",
            unit = %identity,
            error = %error,
            "unit failed to compile"
        );
    }
    let bundle = PrebuiltBundle::from_build(&site.name, backend.as_ref(), &build)?;
    bundle.write(&args.out).await?;

    info!(
        target = "kiln::precompile",
        site = %site.name,
        out = %args.out.display(),
        parts = bundle.parts.len(),
        "bundle written"
    );
    Ok(())
}

/// Compile every unit of `site` from source, ignoring its prebuilt override
/// and without watching.
async fn build_site(
    site: &SiteSettings,
    compiler: &config::CompilerSettings,
    backend: Arc<dyn CompileBackend>,
) -> Result<SiteBuild, AppError> {
    let mut site = site.clone();
    site.prebuilt = None;
    site.watch = false;

    let runtime = SiteRuntime::start(&site, compiler, backend).await?;
    let graph = runtime
        .graph()
        .ok_or_else(|| AppError::unexpected("site started without a tier graph"))?;
    Ok(graph.build_all().await?)
}

fn code_behind_path(markup: &Path, markup_suffix: &str) -> Option<std::path::PathBuf> {
    let file_name = markup.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(markup_suffix)?.strip_suffix('.')?;
    Some(markup.with_file_name(stem))
}

fn derive_type_name(
    markup: &Path,
    leaf_extension: &str,
    markup_suffix: &str,
) -> Result<String, AppError> {
    let file_name = markup
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AppError::validation("markup path has no file name"))?;
    let stem = file_name
        .strip_suffix(markup_suffix)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(file_name);
    let stem = stem
        .strip_suffix(leaf_extension)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(stem);
    Ok(stem.replace('-', "_"))
}
