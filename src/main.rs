//! Kiln CLI
//!
//! Entry point for the `kiln` command-line tool. Every command loads the
//! platform state file, runs one core operation and writes the state back.

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

use kiln::executor::mock::{simulate_build, RecordingExecutor};
use kiln::gc::report;
use kiln::{
    ArtifactId, EffectiveConfig, ExitCode, ExternalKit, PlatformCore, PlatformSettings,
    PruneScope, StateFile, Submission,
};
use kiln_api::BuildRequest;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Build queue and kit dependency graph manager", version)]
struct Cli {
    /// Path to the platform state file
    #[arg(long, global = true, default_value = "kiln-state.json")]
    state: PathBuf,

    /// Path to the platform config file (default: kiln.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Kit management commands
    Kit {
        #[command(subcommand)]
        action: KitCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KitCommands {
    /// Delete kits no integration can reach
    Prune {
        /// Show what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,

        /// Delete every kit not used directly, ancestors included
        #[arg(long)]
        unreferenced: bool,

        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Flatten straight kit lineages into a single image layer
    Squash {
        /// Show what would be squashed without squashing it
        #[arg(long)]
        dry_run: bool,

        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Build a kit, or register one for an existing image
    Create {
        /// Kit name (build name when the kit is built)
        name: String,

        /// Namespace of the kit
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,

        /// Dependency coordinate, repeatable (e.g. camel:http)
        #[arg(long = "dependency", short = 'd')]
        dependencies: Vec<String>,

        /// Build property as key=value, repeatable
        #[arg(long = "property", short = 'p')]
        properties: Vec<String>,

        /// Runtime catalog version (default: newest catalog in the state file)
        #[arg(long)]
        runtime_version: Option<String>,

        /// Register an existing image instead of building
        #[arg(long)]
        image: Option<String>,

        /// Base kit of an external kit
        #[arg(long)]
        base_kit: Option<String>,

        /// Priority label of the kit
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// List kits
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as JSON
    Show,
}

struct Loaded {
    core: PlatformCore,
    registry: std::sync::Arc<kiln::InMemoryRegistry>,
    executor: RecordingExecutor,
    catalogs: Vec<kiln::CatalogSpec>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Config {
            action: ConfigCommands::Show,
        } => run_config_show(cli.config.as_deref()),
        Commands::Kit { action } => {
            let settings = load_settings(cli.config.as_deref());
            match action {
                KitCommands::Prune {
                    dry_run,
                    unreferenced,
                    yes,
                } => {
                    let scope = if unreferenced {
                        PruneScope::Unreferenced
                    } else {
                        PruneScope::Lineage
                    };
                    run_prune(&cli.state, settings, scope, dry_run, yes)
                }
                KitCommands::Squash { dry_run, yes } => run_squash(&cli.state, settings, dry_run, yes),
                KitCommands::Create {
                    name,
                    namespace,
                    dependencies,
                    properties,
                    runtime_version,
                    image,
                    base_kit,
                    priority,
                } => {
                    let properties = parse_properties(&properties);
                    run_create(
                        &cli.state,
                        settings,
                        CreateArgs {
                            name,
                            namespace,
                            dependencies: dependencies.into_iter().collect(),
                            properties,
                            runtime_version,
                            image,
                            base_kit,
                            priority,
                        },
                    )
                }
                KitCommands::List { json } => run_list(&cli.state, settings, json),
            }
        }
    };

    process::exit(code.as_i32());
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn fail(message: impl std::fmt::Display, code: ExitCode) -> ! {
    eprintln!("Error: {}", message);
    process::exit(code.as_i32());
}

fn load_settings(config_path: Option<&Path>) -> PlatformSettings {
    let path = config_path.unwrap_or_else(|| Path::new("kiln.toml"));
    let config = match EffectiveConfig::build(Some(path), None) {
        Ok(c) => c,
        Err(e) => fail(e, ExitCode::Usage),
    };
    match PlatformSettings::from_effective(&config) {
        Ok(s) => s,
        Err(e) => fail(e, ExitCode::Usage),
    }
}

fn load_platform(state_path: &Path, settings: PlatformSettings) -> Loaded {
    let state = match StateFile::load_or_default(state_path) {
        Ok(s) => s,
        Err(e) => fail(e, ExitCode::StateFile),
    };
    let catalogs = state.catalogs.clone();
    let executor = RecordingExecutor::new();
    match state.into_platform(settings, Box::new(executor.clone())) {
        Ok((core, registry)) => Loaded {
            core,
            registry,
            executor,
            catalogs,
        },
        Err(e) => fail(e, ExitCode::StateFile),
    }
}

fn save_platform(state_path: &Path, loaded: &Loaded) {
    let state = StateFile::capture(&loaded.core, &loaded.registry, loaded.catalogs.clone());
    if let Err(e) = state.save(state_path) {
        fail(e, ExitCode::StateFile);
    }
}

fn confirm() -> bool {
    print!("Continue Y/N ? ");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes" | "Yes")
}

fn run_config_show(config_path: Option<&Path>) -> ExitCode {
    let path = config_path.unwrap_or_else(|| Path::new("kiln.toml"));
    let config = match EffectiveConfig::build(Some(path), None) {
        Ok(c) => c,
        Err(e) => fail(e, ExitCode::Usage),
    };
    match config.to_json() {
        Ok(json) => {
            println!("{}", json);
            ExitCode::Success
        }
        Err(e) => fail(e, ExitCode::Internal),
    }
}

fn run_prune(
    state_path: &Path,
    settings: PlatformSettings,
    scope: PruneScope,
    dry_run: bool,
    yes: bool,
) -> ExitCode {
    let mut loaded = load_platform(state_path, settings);
    let plan = match loaded.core.prune(scope, true) {
        Ok(p) => p,
        Err(e) => fail(&e, e.exit_code()),
    };
    print!("{}", report::prune_plan(&plan));
    if dry_run || plan.is_empty() || (!yes && !confirm()) {
        return ExitCode::Success;
    }

    let outcome = match loaded.core.prune(scope, false) {
        Ok(o) => o,
        Err(e) => fail(&e, e.exit_code()),
    };
    save_platform(state_path, &loaded);
    print!("{}", report::prune_summary(&outcome));
    if outcome.has_errors() {
        ExitCode::OperationFailed
    } else {
        ExitCode::Success
    }
}

fn run_squash(state_path: &Path, settings: PlatformSettings, dry_run: bool, yes: bool) -> ExitCode {
    let mut loaded = load_platform(state_path, settings);
    let plan = match loaded.core.squash(true) {
        Ok(p) => p,
        Err(e) => fail(&e, e.exit_code()),
    };
    print!("{}", report::squash_plan(&plan));
    if dry_run || plan.is_empty() || (!yes && !confirm()) {
        return ExitCode::Success;
    }

    let outcome = match loaded.core.squash(false) {
        Ok(o) => o,
        Err(e) => fail(&e, e.exit_code()),
    };
    save_platform(state_path, &loaded);
    print!("{}", report::squash_summary(&outcome));
    if outcome.has_errors() {
        ExitCode::OperationFailed
    } else {
        ExitCode::Success
    }
}

struct CreateArgs {
    name: String,
    namespace: String,
    dependencies: BTreeSet<String>,
    properties: BTreeMap<String, String>,
    runtime_version: Option<String>,
    image: Option<String>,
    base_kit: Option<String>,
    priority: i32,
}

fn parse_properties(raw: &[String]) -> BTreeMap<String, String> {
    raw.iter()
        .map(|p| match p.split_once('=') {
            Some((k, v)) if !k.is_empty() => (k.to_string(), v.to_string()),
            _ => fail(
                format!("invalid property {:?}, expected key=value", p),
                ExitCode::Usage,
            ),
        })
        .collect()
}

fn run_create(state_path: &Path, settings: PlatformSettings, args: CreateArgs) -> ExitCode {
    let mut loaded = load_platform(state_path, settings);
    let runtime_version = match args.runtime_version.clone() {
        Some(v) => v,
        None => match loaded.catalogs.iter().map(|c| &c.runtime_version).max() {
            Some(v) => v.clone(),
            None => fail(
                "no runtime catalog in the state file, pass --runtime-version",
                ExitCode::Usage,
            ),
        },
    };

    if let Some(image) = args.image {
        let kit = ExternalKit {
            id: ArtifactId::new(args.namespace.clone(), args.name),
            image,
            dependencies: args.dependencies,
            build_properties: args.properties,
            runtime_version,
            base: args
                .base_kit
                .map(|b| ArtifactId::new(args.namespace.clone(), b)),
            priority: args.priority,
        };
        return match loaded.core.create_external_kit(kit, Utc::now()) {
            Ok(kit) => {
                save_platform(state_path, &loaded);
                println!("Kit {} in namespace: {} created", kit.name, kit.namespace);
                ExitCode::Success
            }
            Err(e) => fail(&e, e.exit_code()),
        };
    }
    if args.base_kit.is_some() {
        fail("--base-kit requires --image", ExitCode::Usage);
    }

    let mut request = BuildRequest::new(args.namespace, args.name, runtime_version)
        .dependencies(args.dependencies)
        .priority(args.priority);
    request.build_properties = args.properties;

    let submission = match loaded.core.submit(&request, Utc::now()) {
        Ok(s) => s,
        Err(e) => fail(&e, e.exit_code()),
    };
    let code = match &submission {
        Submission::Reused { kit } => {
            println!("Kit {} in namespace: {} already satisfies the request", kit.name, kit.namespace);
            ExitCode::Success
        }
        Submission::Rejected { failure, .. } => {
            eprintln!("Build rejected: {}", failure.reason);
            kiln::failure::build_failure_exit_code(failure.kind)
        }
        Submission::Queued { build, kit, .. } => {
            run_builds(&mut loaded);
            match loaded.core.build(build) {
                Some(b) if b.phase == kiln_api::BuildPhase::Succeeded => {
                    println!(
                        "Kit {} in namespace: {} created, image: {}",
                        kit.name,
                        kit.namespace,
                        b.image.as_deref().unwrap_or("-")
                    );
                    ExitCode::Success
                }
                Some(b) => {
                    let kind = b.failure.as_ref().map(|f| f.kind);
                    let reason = b.failure.as_ref().map(|f| f.reason.as_str()).unwrap_or("unknown");
                    eprintln!("Build {} failed: {}", build, reason);
                    kind.map(kiln::failure::build_failure_exit_code)
                        .unwrap_or(ExitCode::OperationFailed)
                }
                None => ExitCode::Internal,
            }
        }
    };
    if !matches!(submission, Submission::Rejected { .. }) {
        save_platform(state_path, &loaded);
    }
    code
}

/// Run every launched build to completion against the local registry.
fn run_builds(loaded: &mut Loaded) {
    let repository = loaded.core.settings().repository.clone();
    let mut seen = 0;
    loop {
        let launches = loaded.executor.launches();
        if seen >= launches.len() {
            break;
        }
        for spec in &launches[seen..] {
            let event = match simulate_build(spec, loaded.registry.as_ref(), &repository) {
                Ok(e) => e,
                Err(e) => fail(e, ExitCode::Registry),
            };
            if let Err(e) = loaded.core.on_build_event(event, Utc::now()) {
                fail(&e, e.exit_code());
            }
        }
        seen = launches.len();
    }
}

fn run_list(state_path: &Path, settings: PlatformSettings, json: bool) -> ExitCode {
    let loaded = load_platform(state_path, settings);
    let kits = loaded.core.kits();
    if json {
        return match serde_json::to_string_pretty(&kits) {
            Ok(out) => {
                println!("{}", out);
                ExitCode::Success
            }
            Err(e) => fail(e, ExitCode::Internal),
        };
    }

    if kits.is_empty() {
        println!("No kits");
        return ExitCode::Success;
    }
    println!(
        "{:<24} {:<12} {:<9} {:<5} {:<24} IMAGE",
        "NAME", "NAMESPACE", "PHASE", "USED", "BASE"
    );
    for kit in &kits {
        println!(
            "{:<24} {:<12} {:<9} {:<5} {:<24} {}",
            kit.name,
            kit.namespace,
            kit.phase,
            kit.used,
            kit.base_kit.as_deref().unwrap_or("-"),
            kit.image.as_deref().unwrap_or("-")
        );
    }
    ExitCode::Success
}
