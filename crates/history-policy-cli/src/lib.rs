//! Command surface for deploying case models and inspecting history capture
//! decisions against a `SQLite` case store.
//!
//! Hosts embed the CLI through [`run_cli`] for parsed execution, or through
//! [`run_command`] against an already opened [`SqliteHistoryStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use history_policy_core::{
    CaseModel, EngineConfig, EntityLink, HistoryEvent, HistoryLevel, HistoryLink,
    HistoryPolicyResolver, IdentityLink,
};
use history_policy_store_sqlite::{DeploymentInput, SqliteHistoryStore, TaskInput};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "hp")]
#[command(about = "Case history policy CLI")]
pub struct Cli {
    #[arg(long, default_value = "./history_policy.sqlite3")]
    db: PathBuf,

    /// JSON engine configuration; takes precedence over the stored config.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    history_level: Option<HistoryLevelArg>,

    /// `--enable-definition-history-level` alone enables overrides; `=false` disables them.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    enable_definition_history_level: Option<bool>,

    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Definition {
        #[command(subcommand)]
        command: DefinitionCommand,
    },
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Level {
        #[command(subcommand)]
        command: LevelCommand,
    },
    Check {
        #[command(subcommand)]
        command: CheckCommand,
    },
    Link {
        #[command(subcommand)]
        command: LinkCommand,
    },
    Decide(DecideArgs),
}

#[derive(Debug, Subcommand)]
pub enum DefinitionCommand {
    Deploy(DeployArgs),
    Show(DefinitionShowArgs),
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    key: String,
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
pub struct DefinitionShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    Start(InstanceStartArgs),
}

#[derive(Debug, Args)]
pub struct InstanceStartArgs {
    #[arg(long)]
    definition_id: String,
    #[arg(long)]
    business_key: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    Create(TaskCreateArgs),
}

#[derive(Debug, Args)]
pub struct TaskCreateArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    scope_id: Option<String>,
    #[arg(long)]
    scope_type: Option<String>,
    #[arg(long)]
    scope_definition_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Save,
}

#[derive(Debug, Subcommand)]
pub enum LevelCommand {
    Show(DefinitionArgs),
}

#[derive(Debug, Args)]
pub struct DefinitionArgs {
    #[arg(long)]
    definition_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CheckCommand {
    Enabled(DefinitionArgs),
    AtLeast(AtLeastArgs),
    Task(DefinitionArgs),
    Activity(ActivityArgs),
}

#[derive(Debug, Args)]
pub struct AtLeastArgs {
    #[arg(long)]
    definition_id: Option<String>,
    #[arg(long)]
    level: HistoryLevelArg,
}

#[derive(Debug, Args)]
pub struct ActivityArgs {
    #[arg(long)]
    definition_id: Option<String>,
    #[arg(long)]
    activity_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LinkCommand {
    Identity(IdentityLinkArgs),
    Entity(EntityLinkArgs),
}

#[derive(Debug, Args)]
pub struct IdentityLinkArgs {
    #[arg(long)]
    link_type: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    group_id: Option<String>,
    #[arg(long)]
    task_id: Option<String>,
    #[arg(long)]
    scope_id: Option<String>,
    #[arg(long)]
    scope_type: Option<String>,
    #[arg(long)]
    scope_definition_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct EntityLinkArgs {
    #[arg(long)]
    link_type: Option<String>,
    #[arg(long)]
    scope_id: Option<String>,
    #[arg(long)]
    scope_type: Option<String>,
    #[arg(long)]
    reference_scope_id: Option<String>,
    #[arg(long)]
    reference_scope_type: Option<String>,
}

#[derive(Debug, Args)]
pub struct DecideArgs {
    /// History event as JSON, tagged by `event`.
    #[arg(long)]
    event_json: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HistoryLevelArg {
    None,
    Instance,
    Task,
    Activity,
    Audit,
    Full,
}

impl From<HistoryLevelArg> for HistoryLevel {
    fn from(value: HistoryLevelArg) -> Self {
        match value {
            HistoryLevelArg::None => HistoryLevel::None,
            HistoryLevelArg::Instance => HistoryLevel::Instance,
            HistoryLevelArg::Task => HistoryLevel::Task,
            HistoryLevelArg::Activity => HistoryLevel::Activity,
            HistoryLevelArg::Audit => HistoryLevel::Audit,
            HistoryLevelArg::Full => HistoryLevel::Full,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, the engine
/// configuration is invalid, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteHistoryStore::open(&cli.db)?;
    store.migrate()?;
    let config = resolve_engine_config(&cli, &store)?;
    run_command(cli.command, &store, config)
}

/// Engine configuration from `--config`, else the stored config, else the
/// default; command-line level flags are applied on top.
fn resolve_engine_config(cli: &Cli, store: &SqliteHistoryStore) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading engine config {}", path.display()))?;
            EngineConfig::from_json_str(&raw).map_err(|err| anyhow!("{err}"))?
        }
        None => store.load_engine_config()?.unwrap_or_default(),
    };

    if let Some(level) = cli.history_level {
        config.history_level = level.into();
    }
    if let Some(enabled) = cli.enable_definition_history_level {
        config.enable_definition_history_level = enabled;
    }

    debug!(
        history_level = %config.history_level,
        definition_history_level = config.enable_definition_history_level,
        "resolved engine config"
    );
    Ok(config)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, persistence, or lookup of a
/// required record fails.
pub fn run_command(
    command: Command,
    store: &SqliteHistoryStore,
    config: EngineConfig,
) -> Result<()> {
    match command {
        Command::Definition { command } => run_definition(command, store),
        Command::Instance { command } => run_instance(command, store),
        Command::Task { command } => run_task(command, store),
        Command::Config { command } => run_config(command, store, config),
        Command::Level { command } => run_level(command, store, config),
        Command::Check { command } => run_check(command, store, config),
        Command::Link { command } => run_link(command, store, config),
        Command::Decide(args) => {
            let event: HistoryEvent = serde_json::from_str(&args.event_json)
                .map_err(|err| anyhow!("invalid --event-json value: {err}"))?;
            let resolver = HistoryPolicyResolver::new(config, store, store);
            print_json(&resolver.decide(&event))
        }
    }
}

fn run_definition(command: DefinitionCommand, store: &SqliteHistoryStore) -> Result<()> {
    match command {
        DefinitionCommand::Deploy(args) => {
            let raw = std::fs::read_to_string(&args.model)
                .with_context(|| format!("failed reading case model {}", args.model.display()))?;
            let model = CaseModel::from_json_str(&raw).map_err(|err| anyhow!("{err}"))?;

            let definition = store.deploy_definition(&DeploymentInput {
                case_definition_id: args.id,
                key: args.key,
                name: args.name,
                model,
            })?;
            print_json(&definition)
        }
        DefinitionCommand::Show(args) => {
            let Some(definition) = store.get_case_definition(&args.id)? else {
                return Err(anyhow!("case definition not found: {}", args.id));
            };
            let model = store.get_case_model(&args.id)?;
            print_json(&json!({
                "definition": definition,
                "model": model,
            }))
        }
    }
}

fn run_instance(command: InstanceCommand, store: &SqliteHistoryStore) -> Result<()> {
    match command {
        InstanceCommand::Start(args) => {
            let instance =
                store.start_case_instance(&args.definition_id, args.business_key.as_deref())?;
            print_json(&instance)
        }
    }
}

fn run_task(command: TaskCommand, store: &SqliteHistoryStore) -> Result<()> {
    match command {
        TaskCommand::Create(args) => {
            let task = store.create_task(&TaskInput {
                task_id: args.id,
                name: args.name,
                scope_id: args.scope_id,
                scope_type: args.scope_type,
                scope_definition_id: args.scope_definition_id,
            })?;
            print_json(&task)
        }
    }
}

fn run_config(
    command: ConfigCommand,
    store: &SqliteHistoryStore,
    config: EngineConfig,
) -> Result<()> {
    match command {
        ConfigCommand::Show => print_json(&config),
        ConfigCommand::Save => {
            store.save_engine_config(&config)?;
            print_json(&config)
        }
    }
}

fn run_level(
    command: LevelCommand,
    store: &SqliteHistoryStore,
    config: EngineConfig,
) -> Result<()> {
    let resolver = HistoryPolicyResolver::new(config, store, store);
    match command {
        LevelCommand::Show(args) => {
            let definition_id = args.definition_id.as_deref();
            let declared = definition_id.and_then(|id| resolver.definition_history_level(id));
            print_json(&json!({
                "definition_id": definition_id,
                "engine_level": config.history_level,
                "definition_history_level_enabled": config.enable_definition_history_level,
                "declared_level": declared,
                "effective_level": resolver.effective_level(definition_id),
            }))
        }
    }
}

fn run_check(
    command: CheckCommand,
    store: &SqliteHistoryStore,
    config: EngineConfig,
) -> Result<()> {
    let resolver = HistoryPolicyResolver::new(config, store, store);
    match command {
        CheckCommand::Enabled(args) => {
            let definition_id = args.definition_id.as_deref();
            print_json(&json!({
                "check": "enabled",
                "definition_id": definition_id,
                "effective_level": resolver.effective_level(definition_id),
                "result": resolver.is_history_enabled(definition_id),
            }))
        }
        CheckCommand::AtLeast(args) => {
            let definition_id = args.definition_id.as_deref();
            let required = HistoryLevel::from(args.level);
            print_json(&json!({
                "check": "at_least",
                "definition_id": definition_id,
                "required": required,
                "effective_level": resolver.effective_level(definition_id),
                "result": resolver.meets_level(definition_id, required),
            }))
        }
        CheckCommand::Task(args) => {
            let definition_id = args.definition_id.as_deref();
            print_json(&json!({
                "check": "task",
                "definition_id": definition_id,
                "effective_level": resolver.effective_level(definition_id),
                "result": resolver.has_task_history_level(definition_id),
            }))
        }
        CheckCommand::Activity(args) => {
            let definition_id = args.definition_id.as_deref();
            let activity_id = args.activity_id.as_deref();
            print_json(&json!({
                "check": "activity",
                "definition_id": definition_id,
                "activity_id": activity_id,
                "effective_level": resolver.effective_level(definition_id),
                "result": resolver.has_activity_history_level(definition_id, activity_id),
            }))
        }
    }
}

fn run_link(
    command: LinkCommand,
    store: &SqliteHistoryStore,
    config: EngineConfig,
) -> Result<()> {
    let resolver = HistoryPolicyResolver::new(config, store, store);
    let link = match command {
        LinkCommand::Identity(args) => HistoryLink::Identity(IdentityLink {
            id: String::new(),
            link_type: args.link_type,
            user_id: args.user_id,
            group_id: args.group_id,
            task_id: args.task_id,
            scope_id: args.scope_id,
            scope_type: args.scope_type,
            scope_definition_id: args.scope_definition_id,
        }),
        LinkCommand::Entity(args) => HistoryLink::Entity(EntityLink {
            id: String::new(),
            link_type: args.link_type,
            scope_id: args.scope_id,
            scope_type: args.scope_type,
            reference_scope_id: args.reference_scope_id,
            reference_scope_type: args.reference_scope_type,
            hierarchy_type: None,
        }),
    };

    let event = match link.clone() {
        HistoryLink::Identity(link) => HistoryEvent::IdentityLink { link },
        HistoryLink::Entity(link) => HistoryEvent::EntityLink { link },
    };

    print_json(&json!({
        "link": link,
        "definition_id": resolver.definition_id_for(&link),
        "decision": resolver.decide(&event),
    }))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
