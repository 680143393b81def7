//! Stackform CLI entrypoint.
//!
//! This is the main entrypoint for the stackform command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackform::cli::{Cli, Commands, OutputFormatter, StateCommands};
use stackform::config::{
    find_config_file, ConfigParser, ConfigValidator, ProviderKind, StackConfig, StateBackend,
};
use stackform::error::{ConfigError, Result, StackformError};
use stackform::planner::{ApplyOptions, DependencyPlanner};
use stackform::provider::{HttpProvider, InMemoryProvider, Provider};
use stackform::reconciler::{Reconciler, RollbackPolicy};
use stackform::state::{LocalStateStore, S3StateStore, StateStore, STATE_DIR};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply {
            yes,
            dry_run,
            concurrency,
            no_rollback,
        } => {
            let flags = ApplyFlags {
                yes,
                dry_run,
                concurrency,
                no_rollback,
            };
            cmd_apply(config_path, flags, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::Graph => cmd_graph(config_path, &formatter),
        Commands::Status => cmd_status(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Flags of the `apply` command.
#[derive(Debug, Clone, Copy)]
struct ApplyFlags {
    yes: bool,
    dry_run: bool,
    concurrency: Option<usize>,
    no_rollback: bool,
}

/// Initialize a new stack configuration.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stackform.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stackform.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# stackform")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stackform.yaml with your image and sizing");
    eprintln!("  2. Run 'stackform validate' to check the configuration");
    eprintln!("  3. Run 'stackform plan' to see the change set");
    eprintln!("  4. Run 'stackform apply' to converge the stack");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config_file, config) = load_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let validator = ConfigValidator::new();
    let result = validator.check(&config);
    emit(&formatter.format_validation(&result, show_warnings))?;

    if !result.is_valid() {
        return Err(StackformError::Config(ConfigError::validation_general(format!(
            "{} validation error(s)",
            result.error_count()
        ))));
    }

    if !formatter.is_json() {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Project: {}", config.project.name);
        eprintln!("  Environment: {}", config.project.environment);
        eprintln!("  Resources: {}", config.declared_resources().len());
        eprintln!("  Provider: {:?}", config.provider.kind);
        eprintln!("  State backend: {:?}", config.state.backend);
    }

    Ok(())
}

/// Show the change set.
async fn cmd_plan(config_path: Option<&PathBuf>, detailed: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config, store.as_ref()).await?;
    let reconciler = Reconciler::new(provider, store.as_ref(), &config.project);

    let change_set = reconciler.plan(&config.declared_resources()).await?;
    emit(&formatter.format_plan(&change_set, detailed))
}

/// Apply the change set.
async fn cmd_apply(config_path: Option<&PathBuf>, flags: ApplyFlags, formatter: &OutputFormatter) -> Result<()> {
    let (config, store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config, store.as_ref()).await?;
    let declared = config.declared_resources();

    let options = ApplyOptions {
        dry_run: flags.dry_run,
        concurrency: flags.concurrency.unwrap_or(config.apply.concurrency).max(1),
        retry: config.retry_policy(),
    };
    let rollback = if flags.no_rollback {
        RollbackPolicy::default()
    } else {
        RollbackPolicy::from_config(&config.rollback)
    };
    let reconciler = Reconciler::new(provider, store.as_ref(), &config.project)
        .with_options(options)
        .with_rollback(rollback);

    if !flags.dry_run {
        let change_set = reconciler.plan(&declared).await?;
        if change_set.is_converged() {
            emit(&formatter.format_plan(&change_set, false))?;
            return Ok(());
        }

        if !formatter.is_json() {
            emit(&formatter.format_plan(&change_set, false))?;
        }

        if !flags.yes && !confirm("Do you want to apply this change set? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let result = reconciler
        .apply(&declared)
        .await
        .map_err(|e| report_abort(formatter, e))?;
    emit(&formatter.format_result(&result))?;

    if let Some(rollback) = &result.rollback {
        warn!("Deployment rolled back after '{}' failed health checks", rollback.resource_id);
    }

    Ok(())
}

/// Destroy every tracked resource.
async fn cmd_destroy(config_path: Option<&PathBuf>, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, store) = load_config_and_state(config_path).await?;
    let state = store.load().await?;

    if state.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for resource in state.in_sequence().into_iter().rev() {
        eprintln!("  - {} {} ({})", resource.kind, resource.id, resource.provider_id);
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let provider = create_provider(&config, store.as_ref()).await?;
    let options = ApplyOptions {
        concurrency: config.apply.concurrency,
        retry: config.retry_policy(),
        ..ApplyOptions::default()
    };
    let reconciler = Reconciler::new(provider, store.as_ref(), &config.project).with_options(options);

    let result = reconciler.destroy().await.map_err(|e| report_abort(formatter, e))?;
    emit(&formatter.format_result(&result))
}

/// Show dependency levels of the declared set.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (_, config) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let levels = DependencyPlanner::new().levels(&config.declared_resources())?;
    emit(&formatter.format_graph(&levels))
}

/// Show live status of applied resources.
async fn cmd_status(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config, store.as_ref()).await?;
    let reconciler = Reconciler::new(provider, store.as_ref(), &config.project);

    let statuses = reconciler.status().await?;
    emit(&formatter.format_status(&config.qualified_name(), &statuses))
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (_config, store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if store.exists().await? {
                let state = store.load().await?;
                let lock = store.get_lock_info().await?;
                emit(&formatter.format_state(&state, lock.as_ref()))?;
            } else {
                eprintln!("No state found at {}.", store.location());
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
/// Prints what an aborted run completed before passing the error on.
fn report_abort(formatter: &OutputFormatter, err: StackformError) -> StackformError {
    if let StackformError::Apply(abort) = &err {
        if let Err(e) = emit(&formatter.format_abort(abort)) {
            warn!("Failed to print completed actions: {e}");
        }
    }
    err
}

fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{output}")?;
    Ok(())
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the configuration file.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads the configuration with `.env` and environment overrides.
fn load_config(config_path: Option<&PathBuf>) -> Result<(PathBuf, StackConfig)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config_file, config))
}

/// Loads and validates configuration and creates the state store.
async fn load_config_and_state(config_path: Option<&PathBuf>) -> Result<(StackConfig, Box<dyn StateStore>)> {
    let (config_file, config) = load_config(config_path)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => match config.state.path.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                let path = if path.is_relative() {
                    config_dir(&config_file).join(path)
                } else {
                    path.to_path_buf()
                };
                Box::new(LocalStateStore::with_state_path(path))
            }
            None => Box::new(LocalStateStore::with_base_dir(config_dir(&config_file).join(STATE_DIR))),
        },
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                StackformError::Config(ConfigError::validation("S3 bucket not configured", "state.bucket"))
            })?;
            Box::new(S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref()).await?)
        }
    };
    debug!("Using {} state at {}", store.backend_type(), store.location());

    Ok((config, store))
}

/// Creates the configured provider.
async fn create_provider(config: &StackConfig, store: &dyn StateStore) -> Result<Arc<dyn Provider>> {
    match config.provider.kind {
        ProviderKind::Http => {
            let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
                StackformError::Config(ConfigError::validation("Provider endpoint not configured", "provider.endpoint"))
            })?;
            let provider = HttpProvider::with_timeout(endpoint, ConfigParser::provider_token(), config.provider.timeout_secs)?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Simulated => {
            warn!("Using the simulated provider: nothing is deployed");
            let state = store.load().await?;
            Ok(Arc::new(InMemoryProvider::from_applied(&state)))
        }
    }
}
