//! nextdns-operator - Declarative reconciliation of NextDNS profiles
//!
//! Main entry point for the nextdns-operator CLI.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nextdns_operator::api::{HttpClientFactory, InMemoryPolicyApi, PolicyApiFactory};
use nextdns_operator::config::{validate_config, validate_config_result, OperatorConfig};
use nextdns_operator::controller::{Controller, ControllerConfig};
use nextdns_operator::logging::{self, LogFormat};
use nextdns_operator::manifest::{ManifestSet, ManifestSource};
use nextdns_operator::reconcile::{Action, Reconciler, ResolveError, Resolver};
use nextdns_operator::resources::validation::describe;
use nextdns_operator::resources::{validate_list, validate_profile, ListKind, Phase, ResourceKey};
use nextdns_operator::server::StatusServer;
use nextdns_operator::store::{InMemoryStore, ResourceStore, StateFile};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::sync::watch;

/// nextdns-operator - keep NextDNS profiles in sync with YAML manifests
#[derive(Parser, Debug)]
#[command(name = "nextdns-operator")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/nextdns-operator/config.yaml)
    #[arg(short, long, global = true, env = "NEXTDNS_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log format (pretty, json); overrides the config file
    #[arg(long, global = true, env = "NEXTDNS_OPERATOR_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against a manifest directory
    Run {
        /// Directory of YAML manifests
        #[arg(short, long, env = "NEXTDNS_OPERATOR_MANIFESTS")]
        manifests: PathBuf,

        /// Reconcile against an in-memory fake instead of the real API
        #[arg(long)]
        dry_run: bool,

        /// Reconcile every object once and exit
        #[arg(long)]
        once: bool,
    },

    /// Validate manifests without contacting the API
    Validate {
        /// Directory of YAML manifests
        #[arg(short, long, env = "NEXTDNS_OPERATOR_MANIFESTS")]
        manifests: PathBuf,
    },

    /// Print the merged lists of a profile
    Resolve {
        /// Directory of YAML manifests
        #[arg(short, long, env = "NEXTDNS_OPERATOR_MANIFESTS")]
        manifests: PathBuf,

        /// Profile key (namespace/name, or name in the default namespace)
        profile: ResourceKey,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write a default configuration file
    Init,
    /// Print the effective configuration
    Show,
    /// Check the configuration file
    Validate,
}

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = OperatorConfig::load_or_default(cli.config.as_deref())?;

    let log_format = cli.log_format.unwrap_or(config.log_format);
    if let Err(e) = logging::init(log_format) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Run {
            manifests,
            dry_run,
            once,
        } => {
            validate_config_result(&config)?;
            run_controller(config, &manifests, dry_run, once).await
        }
        Commands::Validate { manifests } => handle_validate(&manifests),
        Commands::Resolve { manifests, profile } => handle_resolve(&manifests, &profile).await,
        Commands::Config(cmd) => handle_config_command(&cmd, cli.config.as_deref(), &config),
    }
}

async fn run_controller(
    config: OperatorConfig,
    manifests: &Path,
    dry_run: bool,
    once: bool,
) -> anyhow::Result<()> {
    let store = match config.state_file {
        Some(ref path) => Arc::new(
            InMemoryStore::with_state_file(StateFile::new(path))
                .with_context(|| format!("failed to load state file {}", path.display()))?,
        ),
        None => Arc::new(InMemoryStore::new()),
    };

    let source = ManifestSource::new(manifests, Arc::clone(&store));
    let report = source
        .sync_once()
        .await
        .with_context(|| format!("failed to load manifests from {}", manifests.display()))?;
    tracing::info!(
        dir = %manifests.display(),
        applied = report.applied,
        deleted = report.deleted,
        "Manifests loaded"
    );

    let api_factory: Arc<dyn PolicyApiFactory> = if dry_run {
        tracing::warn!("Dry run: changes are applied to an in-memory fake");
        Arc::new(InMemoryPolicyApi::new())
    } else {
        Arc::new(HttpClientFactory::new(config.api_base_url.clone())?)
    };

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        api_factory,
        config.reconciler_config(),
    ));
    let mut controller = Controller::new(
        reconciler,
        ControllerConfig::default()
            .with_workers(config.workers)
            .with_resync_interval(std::time::Duration::from_secs(config.resync_interval_secs))
            .with_namespace(config.namespace.clone()),
    );

    if once {
        let results = controller.reconcile_all_once().await?;
        for (key, action) in &results {
            let outcome = match action {
                Action::AwaitChange => "done",
                Action::Requeue(_) => "requeue",
            };
            println!("{:<40} {}", key.to_string(), outcome);
        }
        let failed = store
            .list_profiles(config.namespace.as_deref())
            .await?
            .iter()
            .filter(|p| p.status.as_ref().is_some_and(|s| s.phase == Phase::Error))
            .count();
        if failed > 0 {
            bail!("{} profile(s) failed to sync", failed);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poll_interval = config.manifest_poll_interval();
    let poller = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { source.run(poll_interval, shutdown).await })
    };

    let server = config.metrics_addr.clone().map(|addr| {
        let server = StatusServer::new(store.clone());
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(&addr, shutdown).await {
                tracing::error!(error = %e, "Status server failed");
            }
        })
    });

    let result = controller.run().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        tracing::warn!(error = %e, "Manifest source task failed");
    }
    if let Some(server) = server {
        if let Err(e) = server.await {
            tracing::warn!(error = %e, "Status server task failed");
        }
    }

    result.map_err(Into::into)
}

fn handle_validate(manifests: &Path) -> anyhow::Result<()> {
    let set = ManifestSet::load_dir(manifests)?;
    let mut problems = Vec::new();

    for list in &set.lists {
        if let Err(errors) = validate_list(list) {
            problems.push(format!("{} {}: {}", list.kind, list.metadata.key(), describe(&errors)));
        }
    }

    for profile in &set.profiles {
        let key = profile.metadata.key();
        if let Err(errors) = validate_profile(profile) {
            problems.push(format!("Profile {}: {}", key, describe(&errors)));
        }
        for kind in ListKind::ALL {
            for reference in profile.spec.refs(kind) {
                let target = reference.to_key(&profile.metadata.namespace);
                let declared = set
                    .lists
                    .iter()
                    .any(|l| l.kind == kind && l.metadata.key() == target);
                if !declared {
                    problems.push(format!("Profile {}: {} {} not found", key, kind, target));
                }
            }
        }
        let secret = ResourceKey::new(&profile.metadata.namespace, &profile.spec.credentials_ref.name);
        if !set.secrets.iter().any(|(k, _)| k == &secret) {
            println!("warning: Profile {}: Secret {} is not declared in the manifests", key, secret);
        }
    }

    if !problems.is_empty() {
        for problem in &problems {
            println!("✗ {}", problem);
        }
        bail!("{} problem(s) found", problems.len());
    }

    println!(
        "✓ {} profile(s), {} shared list(s), {} secret(s) are valid",
        set.profiles.len(),
        set.lists.len(),
        set.secrets.len()
    );
    Ok(())
}

async fn handle_resolve(manifests: &Path, key: &ResourceKey) -> anyhow::Result<()> {
    let set = ManifestSet::load_dir(manifests)?;
    let Some(profile) = set.profile(key).cloned() else {
        bail!("Profile {} is not declared in {}", key, manifests.display());
    };

    let store = InMemoryStore::new();
    for list in set.lists {
        store.apply_list(list).await;
    }

    let resolution = match Resolver::new(&store).resolve(&profile).await {
        Ok(resolution) => resolution,
        Err(ResolveError::ReferenceNotFound(missing)) => bail!("{}", missing),
        Err(e) => return Err(e.into()),
    };

    println!("Profile {}", key);
    for reference in &resolution.references {
        println!(
            "  {} {} ({} active)",
            reference.kind, reference.key, reference.active_entries
        );
    }
    for kind in ListKind::ALL {
        let identifiers = resolution.document.identifiers(kind);
        println!();
        println!("{} ({}):", kind, identifiers.len());
        for identifier in identifiers {
            println!("  {}", identifier);
        }
    }
    Ok(())
}

fn handle_config_command(
    cmd: &ConfigCommands,
    config_path: Option<&Path>,
    config: &OperatorConfig,
) -> anyhow::Result<()> {
    let config_file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(OperatorConfig::default_path);

    match cmd {
        ConfigCommands::Init => {
            if config_file.exists() {
                println!("Configuration already exists at {}", config_file.display());
                return Ok(());
            }
            OperatorConfig::new().save(&config_file)?;
            println!("✓ Created configuration at {}", config_file.display());
        }
        ConfigCommands::Show => {
            print!("{}", serde_yaml::to_string(config)?);
        }
        ConfigCommands::Validate => match validate_config(config) {
            Ok(()) => println!("✓ Configuration is valid"),
            Err(errors) => {
                for error in &errors {
                    println!("✗ {}", error);
                }
                bail!("{} problem(s) found", errors.len());
            }
        },
    }
    Ok(())
}
