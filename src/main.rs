//! Keelson CLI entrypoint.
//!
//! This is the main entrypoint for the keelson command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use keelson::cli::{Cli, Commands, OutputFormatter, StateCommands};
use keelson::config::{find_stack_file, ConfigParser, ConfigValidator, StackConfig};
use keelson::error::Result;
use keelson::graph::Graph;
use keelson::planner::cancel_pair;
use keelson::provider::{LocalProvider, ProviderRegistry, TypeDescriptor};
use keelson::reconciler::Reconciler;
use keelson::state::{generate_holder_id, LocalSnapshotStore, SnapshotStore};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
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

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, workers } => cmd_apply(config, yes, workers, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Refresh => cmd_refresh(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let stack_path = path.join("keelson.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && stack_path.exists() {
        eprintln!("Stack file already exists: {}", stack_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&stack_path, include_str!("../templates/keelson.stack.yaml"))?;
    eprintln!("Created: {}", stack_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".keelson") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Keelson")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".keelson") {
                writeln!(file, ".keelson/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.keelson/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Edit keelson.stack.yaml to declare your resources");
    eprintln!("  2. Run 'keelson validate' to check the stack");
    eprintln!("  3. Run 'keelson plan' to preview the changes");
    eprintln!("  4. Run 'keelson apply' to converge");

    Ok(())
}

/// Validate the stack file and its graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (stack, base) = load_stack(config_path)?;
    let result = ConfigValidator::new().validate(&stack)?;

    // Cycles only show up once the graph is built
    let graph = Graph::from_decls(stack.to_declarations()?)?;
    debug!("Graph for {} has {} resources", base.display(), graph.len());

    println!("{}", formatter.format_validation(&result, &graph, show_warnings));
    Ok(())
}

/// Show the plan.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<()> {
    let context = Context::load(config_path).await?;
    let reconciler = Reconciler::from_stack(&context.stack, &context.store, context.registry.clone())?;

    let plan = reconciler.plan().await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Apply the plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    workers: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let context = Context::load(config_path).await?;
    let (handle, signal) = cancel_pair();
    let mut reconciler = Reconciler::from_stack(&context.stack, &context.store, context.registry.clone())?
        .with_cancel_signal(signal);
    if let Some(workers) = workers {
        reconciler = reconciler.with_workers(workers);
    }

    let plan = reconciler.plan().await?;
    if plan.is_empty() {
        println!("{}", formatter.format_plan(&plan, false));
        return Ok(());
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, false));
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    // In-flight changes finish; nothing new starts after Ctrl-C
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight changes");
            handle.cancel();
        }
    });

    let result = reconciler.apply().await?;
    println!("{}", formatter.format_result(&result));
    result.apply.ensure_complete()
}

/// Destroy every recorded resource.
async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let context = Context::load(config_path).await?;
    let reconciler = Reconciler::from_stack(&context.stack, &context.store, context.registry.clone())?;

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, false));
        if !confirm("This action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let result = reconciler.destroy().await?;
    println!("{}", formatter.format_result(&result));
    result.apply.ensure_complete()
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let context = Context::load(config_path).await?;
    let reconciler = Reconciler::from_stack(&context.stack, &context.store, context.registry.clone())?;

    let report = reconciler.check_drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// Refresh the snapshot from the remote objects.
async fn cmd_refresh(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let context = Context::load(config_path).await?;
    let reconciler = Reconciler::from_stack(&context.stack, &context.store, context.registry.clone())?;

    let report = reconciler.refresh().await?;
    println!("{}", formatter.format_refresh(&report));
    Ok(())
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (stack, base) = load_stack(config_path)?;
    let store = LocalSnapshotStore::with_base_dir(stack.state_dir(&base));

    match command {
        StateCommands::Show => {
            if let Some(snapshot) = store.load().await? {
                println!("{}", formatter.format_snapshot(&snapshot));
            } else {
                eprintln!("No snapshot found.");
            }
            if let Some(lock) = store.get_lock_info().await? {
                println!("{}", formatter.format_lock(&lock));
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("Snapshot forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("Snapshot unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
        StateCommands::Purge => {
            let lock = store.acquire_lock(&generate_holder_id(), "purge").await?;
            let outcome = purge_tombstones(&store).await;
            store.release_lock(&lock.lock_id).await?;
            eprintln!("Removed {} tombstoned entries.", outcome?);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs to talk to the snapshot and providers.
struct Context {
    stack: StackConfig,
    store: LocalSnapshotStore,
    registry: ProviderRegistry,
}

impl Context {
    /// Loads the stack, opens the snapshot store and registers providers.
    async fn load(config_path: Option<&Path>) -> Result<Self> {
        let (stack, base) = load_stack(config_path)?;
        ConfigValidator::new().validate(&stack)?;

        let store = LocalSnapshotStore::with_base_dir(stack.state_dir(&base));
        let root = stack.provider_root(&base);
        debug!("Using {} snapshot store, objects under {}", store.backend_type(), root.display());

        let mut registry = ProviderRegistry::new();
        for descriptor in stack.descriptors() {
            registry.register(LocalProvider::new(&root, descriptor));
        }

        // Types that were removed from the stack still need a provider to be deleted
        if let Some(snapshot) = store.load().await? {
            let recorded = snapshot.live_entries().map(|entry| &entry.id);
            for id in recorded.chain(snapshot.deposed.iter().map(|deposed| &deposed.id)) {
                let type_name = &id.type_name;
                if !registry.contains(type_name) {
                    debug!("Registering provider for recorded type {type_name}");
                    registry.register(LocalProvider::new(&root, TypeDescriptor::new(type_name)));
                }
            }
        }

        Ok(Self { stack, store, registry })
    }
}

/// Resolves, parses and env-expands the stack file.
fn load_stack(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let stack_file = config_path.map_or_else(|| find_stack_file("."), |path| Ok(path.to_path_buf()))?;
    debug!("Loading stack from: {}", stack_file.display());

    let base = stack_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(base.clone());
    parser.load_dotenv()?;

    let stack = parser.load_with_env(&stack_file)?;
    Ok((stack, base))
}

/// Drops tombstoned entries from the stored snapshot.
async fn purge_tombstones(store: &LocalSnapshotStore) -> Result<usize> {
    let Some(mut snapshot) = store.load().await? else {
        return Ok(0);
    };
    let removed = snapshot.purge_tombstones();
    if removed > 0 {
        store.save(&snapshot).await?;
    }
    Ok(removed)
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
