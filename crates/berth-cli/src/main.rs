//! berth - release-and-orchestration controller CLI
//!
//! ## Commands
//!
//! - `resolve-tag`: Print the release tag a ref maps to
//! - `build`: Run a build graph descriptor through the fingerprint cache
//! - `release`: Build a ref and push its terminal artifacts
//! - `deploy`: Start a deployment descriptor in dependency order
//! - `validate`: Check a descriptor without running anything
//!
//! Exit codes: 0 success, 1 build or push failure, 2 deployment failure,
//! 3 invalid descriptor.

use anyhow::{Context, Result};
use berth_backends::{
    CommandBuildBackend, CompositeHealthProber, FsRegistry, ProcessRuntime, StaticCredentials,
};
use berth_core::descriptor::descriptor_dir;
use berth_core::metrics::METRICS;
use berth_core::obs::{self, RunSpan};
use berth_core::{
    cancel_pair, BerthConfig, BerthError, BuildCache, BuildGraphDescriptor, BuildGraphExecutor,
    BuildReport, DeploymentDescriptor, DeploymentReport, Descriptor, FsCacheStorage, HealthGate,
    RefTagResolver, ReleasePipeline, ReleaseReport, ServiceOrchestrator, ServiceState,
    StageStatus, StartOptions,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};

const EXIT_BUILD_FAILURE: u8 = 1;
const EXIT_DEPLOY_FAILURE: u8 = 2;
const EXIT_INVALID_DESCRIPTOR: u8 = 3;

/// Credential name used when a token is given but the config names none.
const DEFAULT_CREDENTIAL_NAME: &str = "registry";

#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(author = "Berth Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Release-and-orchestration controller", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Format of command results on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Config file (default: ./berth.toml when present)
    #[arg(short, long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Branch that resolves to `latest`
    #[arg(long, global = true, env = "BERTH_PRIMARY_BRANCH")]
    primary_branch: Option<String>,

    /// Feature branch prefix, including its separator
    #[arg(long, global = true, env = "BERTH_FEATURE_PREFIX")]
    feature_prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Args, Debug, Default)]
struct BuildArgs {
    /// Cache directory (default: .berth/cache)
    #[arg(long, env = "BERTH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Rebuild every stage, ignoring cached artifacts
    #[arg(long)]
    no_cache: bool,

    /// Maximum number of stages building at once
    #[arg(long)]
    max_concurrent: Option<usize>,
}

impl BuildArgs {
    fn apply(&self, config: &mut BerthConfig) {
        if let Some(dir) = &self.cache_dir {
            config.build.cache_dir = dir.clone();
        }
        if let Some(n) = self.max_concurrent {
            config.build.max_concurrent = n;
        }
    }
}

#[derive(Args, Debug, Default)]
struct RegistryArgs {
    /// Registry root directory (default: .berth/registry)
    #[arg(long, env = "BERTH_REGISTRY_ROOT")]
    registry_root: Option<PathBuf>,

    /// Repository prefix for pushed references
    #[arg(long, env = "BERTH_REPOSITORY")]
    repository: Option<String>,

    /// Name of the registry credential
    #[arg(long, env = "BERTH_REGISTRY_CREDENTIAL")]
    credential_name: Option<String>,

    /// Registry credential value
    #[arg(long, env = "BERTH_REGISTRY_TOKEN", hide_env_values = true)]
    registry_token: Option<String>,
}

impl RegistryArgs {
    fn apply(&self, config: &mut BerthConfig) {
        if let Some(root) = &self.registry_root {
            config.registry.root = root.clone();
        }
        if let Some(repository) = &self.repository {
            config.registry.repository = repository.clone();
        }
        if let Some(name) = &self.credential_name {
            config.registry.credential = Some(name.clone());
        }
        if self.registry_token.is_some() && config.registry.credential.is_none() {
            config.registry.credential = Some(DEFAULT_CREDENTIAL_NAME.to_string());
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the release tag for a ref
    ResolveTag {
        /// Branch name or refs/heads/... ref
        #[arg(value_name = "REF")]
        git_ref: String,
    },

    /// Run a build graph descriptor
    Build {
        /// Build graph descriptor (YAML)
        descriptor: PathBuf,

        /// Ref whose release tag is passed to stage commands
        #[arg(long = "ref", value_name = "REF", env = "BERTH_REF")]
        git_ref: Option<String>,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Build a ref and push its terminal artifacts
    Release {
        /// Branch name or refs/heads/... ref
        #[arg(value_name = "REF")]
        git_ref: String,

        /// Build graph descriptor (YAML)
        descriptor: PathBuf,

        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        registry: RegistryArgs,
    },

    /// Start the services of a deployment descriptor
    Deploy {
        /// Deployment descriptor (YAML)
        descriptor: PathBuf,

        /// Ref whose release tag replaces the version variable
        /// (default: the primary branch)
        #[arg(long = "ref", value_name = "REF", env = "BERTH_REF")]
        git_ref: Option<String>,

        /// Replace services even when their spec is unchanged
        #[arg(long)]
        force_recreate: bool,

        /// Stop every service once the deployment settles instead of
        /// waiting for Ctrl-C
        #[arg(long)]
        once: bool,

        /// Directory for per-service log files
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Check a descriptor without running anything
    Validate {
        /// Deployment or build graph descriptor (YAML)
        descriptor: PathBuf,
    },
}

impl Commands {
    fn failure_code(&self) -> u8 {
        match self {
            Commands::Deploy { .. } => EXIT_DEPLOY_FAILURE,
            _ => EXIT_BUILD_FAILURE,
        }
    }
}

/// How a command that ran to completion went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    BuildFailed,
    DeployFailed,
}

impl Outcome {
    fn code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::BuildFailed => EXIT_BUILD_FAILURE,
            Outcome::DeployFailed => EXIT_DEPLOY_FAILURE,
        }
    }
}

/// Exit code for a command that returned `Err`.
fn error_code(err: &anyhow::Error, fallback: u8) -> u8 {
    let structural = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<BerthError>())
        .any(BerthError::is_structural);
    if structural {
        EXIT_INVALID_DESCRIPTOR
    } else {
        fallback
    }
}

#[derive(Debug, Clone)]
struct DeployOptions {
    force_recreate: bool,
    once: bool,
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    berth_core::init_tracing(cli.json, level);

    let fallback = cli.command.failure_code();
    let result = run(cli).await;
    METRICS.flush();

    match result {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(error_code(&err, fallback))
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let mut config = load_config(&cli)?;
    let output = cli.output;

    match cli.command {
        Commands::ResolveTag { git_ref } => cmd_resolve_tag(&config, &git_ref, output),
        Commands::Build {
            descriptor,
            git_ref,
            build,
        } => {
            build.apply(&mut config);
            cmd_build(&config, &descriptor, git_ref.as_deref(), !build.no_cache, output).await
        }
        Commands::Release {
            git_ref,
            descriptor,
            build,
            registry,
        } => {
            build.apply(&mut config);
            registry.apply(&mut config);
            cmd_release(
                &config,
                &git_ref,
                &descriptor,
                !build.no_cache,
                registry.registry_token.as_deref(),
                output,
            )
            .await
        }
        Commands::Deploy {
            descriptor,
            git_ref,
            force_recreate,
            once,
            log_dir,
        } => {
            let options = DeployOptions {
                force_recreate,
                once,
                log_dir,
            };
            cmd_deploy(&config, &descriptor, git_ref.as_deref(), &options, output).await
        }
        Commands::Validate { descriptor } => cmd_validate(&descriptor, output),
    }
}

/// Load `berth.toml` and layer the global flags on top.
fn load_config(cli: &Cli) -> Result<BerthConfig> {
    let mut config = BerthConfig::discover(cli.config.as_deref(), Path::new("."))
        .context("Failed to load berth config")?;
    if let Some(branch) = &cli.primary_branch {
        config.resolver.primary_branch = branch.clone();
    }
    if let Some(prefix) = &cli.feature_prefix {
        config.resolver.feature_prefix = prefix.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Stage commands run in the descriptor's directory, so output paths must
/// not depend on the working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(cwd.join(path))
}

fn build_executor(
    config: &BerthConfig,
    workdir: &Path,
    use_cache: bool,
) -> Result<BuildGraphExecutor> {
    let cache_dir = absolute(&config.build.cache_dir)?;
    let storage = FsCacheStorage::new(&cache_dir)
        .with_context(|| format!("Failed to open build cache at {}", cache_dir.display()))?;
    let cache = Arc::new(BuildCache::new(Arc::new(storage)));
    let backend = Arc::new(CommandBuildBackend::new(workdir, cache_dir.join("outputs")));
    Ok(BuildGraphExecutor::new(
        cache,
        backend,
        config.executor_config(use_cache),
    ))
}

fn load_build_graph(path: &Path) -> Result<BuildGraphDescriptor> {
    BuildGraphDescriptor::from_path(path)
        .with_context(|| format!("Failed to load build graph {}", path.display()))
}

// ---------------------------------------------------------------------------
// resolve-tag
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TagOutput<'a> {
    git_ref: &'a str,
    tag: String,
}

fn cmd_resolve_tag(config: &BerthConfig, git_ref: &str, output: OutputFormat) -> Result<Outcome> {
    let tag = RefTagResolver::new(config.resolver.clone()).resolve(git_ref);
    obs::emit_tag_resolved(git_ref, &tag.as_label());

    match output {
        OutputFormat::Json => print_json(&TagOutput {
            git_ref,
            tag: tag.as_label(),
        })?,
        OutputFormat::Text => println!("{tag}"),
    }
    Ok(Outcome::Success)
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

async fn run_build(
    config: &BerthConfig,
    path: &Path,
    git_ref: Option<&str>,
    use_cache: bool,
) -> Result<BuildReport> {
    let descriptor = load_build_graph(path)?;
    let tag = git_ref.map(|r| RefTagResolver::new(config.resolver.clone()).resolve(r));
    let label = tag.as_ref().map(|t| t.as_label()).unwrap_or_default();
    let _span = RunSpan::enter("build", &label);

    let executor = build_executor(config, descriptor_dir(path), use_cache)?;
    let report = executor
        .run(&descriptor.stages, tag.as_ref())
        .await
        .context("Build graph rejected")?;
    Ok(report)
}

async fn cmd_build(
    config: &BerthConfig,
    path: &Path,
    git_ref: Option<&str>,
    use_cache: bool,
    output: OutputFormat,
) -> Result<Outcome> {
    let report = run_build(config, path, git_ref, use_cache).await?;

    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_build_report(&report),
    }

    if report.success() {
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::BuildFailed)
    }
}

fn print_build_report(report: &BuildReport) {
    if let Some(tag) = &report.tag {
        println!("Tag: {tag}");
    }
    for outcome in &report.stages {
        match &outcome.status {
            StageStatus::Built { artifact } | StageStatus::Cached { artifact } => println!(
                "  ✓ {} {} {} ({}ms)",
                outcome.stage,
                outcome.status.label(),
                artifact.short_digest(),
                outcome.duration_ms
            ),
            StageStatus::Failed { cause } => println!("  ✗ {} failed: {cause}", outcome.stage),
            StageStatus::Blocked { by } => {
                println!("  - {} blocked by {}", outcome.stage, by.join(", "))
            }
            StageStatus::Cancelled => println!("  - {} cancelled", outcome.stage),
        }
    }
    println!();
    println!(
        "Summary: {} built, {} cached, {} failed, {} blocked ({}ms)",
        report.built().len(),
        report.cached().len(),
        report.failed().len(),
        report.blocked().len(),
        report.duration_ms
    );
}

// ---------------------------------------------------------------------------
// release
// ---------------------------------------------------------------------------

async fn run_release(
    config: &BerthConfig,
    git_ref: &str,
    path: &Path,
    use_cache: bool,
    token: Option<&str>,
) -> Result<ReleaseReport> {
    let descriptor = load_build_graph(path)?;
    let resolver = RefTagResolver::new(config.resolver.clone());
    let _span = RunSpan::enter("release", &resolver.resolve(git_ref).as_label());

    let mut registry = FsRegistry::new(&config.registry.root);
    if let Some(name) = &config.registry.credential {
        let mut credentials = StaticCredentials::new();
        if let Some(token) = token {
            credentials = credentials.with(name.as_str(), token);
        } else {
            warn!(credential = %name, "no registry credential value provided");
        }
        registry = registry.with_credentials(Arc::new(credentials), name.as_str());
    }

    let executor = build_executor(config, descriptor_dir(path), use_cache)?;
    let pipeline = ReleasePipeline::new(resolver, executor, Arc::new(registry))
        .with_push_timeout(config.registry.push_timeout);
    let report = pipeline
        .release(git_ref, &descriptor.stages, &config.registry.repository)
        .await
        .context("Build graph rejected")?;
    Ok(report)
}

async fn cmd_release(
    config: &BerthConfig,
    git_ref: &str,
    path: &Path,
    use_cache: bool,
    token: Option<&str>,
    output: OutputFormat,
) -> Result<Outcome> {
    let report = run_release(config, git_ref, path, use_cache, token).await?;

    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            println!("Ref: {}", report.git_ref);
            print_build_report(&report.build);
            if !report.pushes.is_empty() {
                println!();
                println!("Pushes:");
            }
            for push in &report.pushes {
                match &push.error {
                    None => println!("  ✓ {} ({})", push.reference, push.digest),
                    Some(error) => println!("  ✗ {}: {error}", push.reference),
                }
            }
        }
    }

    if report.success() {
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::BuildFailed)
    }
}

// ---------------------------------------------------------------------------
// deploy
// ---------------------------------------------------------------------------

async fn cmd_deploy(
    config: &BerthConfig,
    path: &Path,
    git_ref: Option<&str>,
    options: &DeployOptions,
    output: OutputFormat,
) -> Result<Outcome> {
    let descriptor = DeploymentDescriptor::from_path(path)
        .with_context(|| format!("Failed to load deployment {}", path.display()))?;
    let git_ref = git_ref.unwrap_or(config.resolver.primary_branch.as_str());
    let tag = RefTagResolver::new(config.resolver.clone()).resolve(git_ref);
    let _span = RunSpan::enter("deploy", &tag.as_label());
    let specs = descriptor.render(&tag);

    let mut runtime = ProcessRuntime::new()
        .with_workdir(descriptor_dir(path))
        .with_image_command(config.deploy.image_command.clone());
    if let Some(dir) = &options.log_dir {
        runtime = runtime.with_log_dir(dir);
    }
    let prober = CompositeHealthProber::new().context("Failed to build health prober")?;
    let orchestrator = ServiceOrchestrator::new(
        Arc::new(runtime),
        HealthGate::new(Arc::new(prober)),
        config.orchestrator_config(),
    );

    let (handle, mut signal) = cancel_pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let start = StartOptions {
        force_recreate: options.force_recreate,
    };
    let report = orchestrator
        .start_with_cancel(&specs, start, signal.clone())
        .await
        .context("Deployment rejected");
    let report = match report {
        Ok(report) => report,
        Err(e) => {
            interrupt.abort();
            return Err(e);
        }
    };

    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_deployment_report(&report),
    }

    if report.ready() && !options.once {
        info!("deployment ready, press Ctrl-C to stop");
        signal.cancelled().await;
    }
    interrupt.abort();

    let shutdown = orchestrator.stop_all().await;
    info!(stopped = shutdown.stopped.len(), "deployment stopped");
    for (service, error) in &shutdown.errors {
        eprintln!("failed to stop {service}: {error}");
    }

    if report.ready() && shutdown.is_complete() {
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::DeployFailed)
    }
}

fn print_deployment_report(report: &DeploymentReport) {
    for service in &report.services {
        match service.state {
            ServiceState::Ready => {
                let note = if service.reused { ", reused" } else { "" };
                println!(
                    "  ✓ {} ready ({} probe attempts{note})",
                    service.name, service.probe_attempts
                );
            }
            ServiceState::Pending if !service.blocked_by.is_empty() => println!(
                "  - {} pending, blocked by {}",
                service.name,
                service.blocked_by.join(", ")
            ),
            state => println!(
                "  ✗ {} {state}: {}",
                service.name,
                service.cause.as_deref().unwrap_or("no cause recorded")
            ),
        }
    }
    println!();
    println!(
        "Summary: {}/{} services ready ({}ms)",
        report
            .services
            .iter()
            .filter(|s| s.state == ServiceState::Ready)
            .count(),
        report.services.len(),
        report.duration_ms
    );
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ValidateOutput<'a> {
    descriptor: String,
    kind: &'a str,
    entries: usize,
}

fn cmd_validate(path: &Path, output: OutputFormat) -> Result<Outcome> {
    let descriptor = Descriptor::load(path)
        .with_context(|| format!("Invalid descriptor {}", path.display()))?;

    match output {
        OutputFormat::Json => print_json(&ValidateOutput {
            descriptor: path.display().to_string(),
            kind: descriptor.kind(),
            entries: descriptor.len(),
        })?,
        OutputFormat::Text => println!(
            "✓ {} is a valid {} descriptor ({} entries)",
            path.display(),
            descriptor.kind(),
            descriptor.len()
        ),
    }
    Ok(Outcome::Success)
}
