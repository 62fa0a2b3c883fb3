#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use history_policy_core::{
    CaseDefinition, CaseInstance, CaseModel, DefinitionModelProvider, EngineConfig,
    InstanceLookup, LookupError, Task, SCOPE_TYPE_CMMN,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info};
use ulid::Ulid;

const HISTORY_POLICY_MIGRATION_VERSION: i64 = 1;
const ENGINE_CONFIG_KEY: &str = "engine";

const SCHEMA_HISTORY_POLICY_V1: &str = r"
CREATE TABLE IF NOT EXISTS case_definitions (
  case_definition_id TEXT PRIMARY KEY,
  definition_key TEXT NOT NULL,
  name TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  model_json TEXT NOT NULL,
  deployed_at TEXT NOT NULL,
  UNIQUE(definition_key, version)
);

CREATE TABLE IF NOT EXISTS case_instances (
  case_instance_id TEXT PRIMARY KEY,
  case_definition_id TEXT NOT NULL,
  business_key TEXT,
  started_at TEXT NOT NULL,
  FOREIGN KEY (case_definition_id) REFERENCES case_definitions(case_definition_id)
);

CREATE INDEX IF NOT EXISTS idx_case_instances_definition
  ON case_instances(case_definition_id);

CREATE TABLE IF NOT EXISTS tasks (
  task_id TEXT PRIMARY KEY,
  name TEXT,
  scope_id TEXT,
  scope_type TEXT,
  scope_definition_id TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engine_config (
  config_key TEXT PRIMARY KEY CHECK (config_key = 'engine'),
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// `SQLite`-backed case repository serving the resolver's collaborator traits.
pub struct SqliteHistoryStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentInput {
    pub case_definition_id: Option<String>,
    pub key: String,
    pub name: Option<String>,
    pub model: CaseModel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskInput {
    pub task_id: Option<String>,
    pub name: Option<String>,
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub scope_definition_id: Option<String>,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_HISTORY_POLICY_V1)
            .context("failed to apply history policy schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![HISTORY_POLICY_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register history policy schema migration")?;

        Ok(())
    }

    /// Stores a case model as the next version of `key`.
    ///
    /// The model must declare a case whose id equals `key`; generated ids take
    /// the form `<key>:<version>:<ulid>`.
    pub fn deploy_definition(&self, input: &DeploymentInput) -> Result<CaseDefinition> {
        if input.key.trim().is_empty() {
            return Err(anyhow!("definition key MUST be provided"));
        }

        input
            .model
            .validate()
            .map_err(|err| anyhow!("case model validation failed: {err}"))?;

        if input.model.case_by_id(&input.key).is_none() {
            return Err(anyhow!(
                "case model does not declare a case with id {}",
                input.key
            ));
        }

        let latest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM case_definitions WHERE definition_key = ?1",
                params![input.key],
                |row| row.get(0),
            )
            .context("failed to read latest definition version")?;
        let version = u32::try_from(latest.unwrap_or(0) + 1)
            .with_context(|| format!("definition version overflow for key {}", input.key))?;

        let case_definition_id = match &input.case_definition_id {
            Some(value) if !value.trim().is_empty() => value.clone(),
            Some(_) => return Err(anyhow!("case definition id MUST NOT be blank")),
            None => format!("{}:{}:{}", input.key, version, Ulid::new()),
        };

        let model_json =
            serde_json::to_string(&input.model).context("failed to serialize case model")?;

        self.conn
            .execute(
                "INSERT INTO case_definitions(
                    case_definition_id, definition_key, name, version, model_json, deployed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    case_definition_id,
                    input.key,
                    input.name,
                    i64::from(version),
                    model_json,
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert case definition")?;

        info!(
            case_definition_id = %case_definition_id,
            key = %input.key,
            version,
            "deployed case definition"
        );

        Ok(CaseDefinition {
            id: case_definition_id,
            key: input.key.clone(),
            name: input.name.clone(),
            version,
        })
    }

    pub fn get_case_definition(&self, case_definition_id: &str) -> Result<Option<CaseDefinition>> {
        self.conn
            .query_row(
                "SELECT case_definition_id, definition_key, name, version
                 FROM case_definitions WHERE case_definition_id = ?1",
                params![case_definition_id],
                parse_definition_row,
            )
            .optional()
            .context("failed to read case definition")
    }

    pub fn get_case_model(&self, case_definition_id: &str) -> Result<Option<CaseModel>> {
        let raw = self
            .stored_model_json(case_definition_id)
            .context("failed to read case model")?;

        match raw {
            Some(json) => {
                let model = serde_json::from_str(&json).with_context(|| {
                    format!("invalid stored case model for {case_definition_id}")
                })?;
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }

    pub fn start_case_instance(
        &self,
        case_definition_id: &str,
        business_key: Option<&str>,
    ) -> Result<CaseInstance> {
        if self.get_case_definition(case_definition_id)?.is_none() {
            return Err(anyhow!("case definition not found: {case_definition_id}"));
        }

        let instance = CaseInstance {
            id: Ulid::new().to_string(),
            case_definition_id: case_definition_id.to_string(),
            business_key: business_key.map(str::to_string),
        };

        self.conn
            .execute(
                "INSERT INTO case_instances(case_instance_id, case_definition_id, business_key, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    instance.id,
                    instance.case_definition_id,
                    instance.business_key,
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert case instance")?;

        debug!(case_instance_id = %instance.id, case_definition_id, "started case instance");
        Ok(instance)
    }

    pub fn get_case_instance(&self, case_instance_id: &str) -> Result<Option<CaseInstance>> {
        self.conn
            .query_row(
                "SELECT case_instance_id, case_definition_id, business_key
                 FROM case_instances WHERE case_instance_id = ?1",
                params![case_instance_id],
                |row| {
                    Ok(CaseInstance {
                        id: row.get(0)?,
                        case_definition_id: row.get(1)?,
                        business_key: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to read case instance")
    }

    /// Inserts a task. A case-scoped task without an explicit scope definition
    /// inherits the definition of its case instance.
    pub fn create_task(&self, input: &TaskInput) -> Result<Task> {
        let scope_definition_id = match (&input.scope_definition_id, &input.scope_id) {
            (Some(value), _) => Some(value.clone()),
            (None, Some(scope_id)) if input.scope_type.as_deref() == Some(SCOPE_TYPE_CMMN) => {
                let instance = self
                    .get_case_instance(scope_id)?
                    .ok_or_else(|| anyhow!("case instance not found: {scope_id}"))?;
                Some(instance.case_definition_id)
            }
            _ => None,
        };

        let task = Task {
            id: input
                .task_id
                .clone()
                .unwrap_or_else(|| Ulid::new().to_string()),
            name: input.name.clone(),
            scope_id: input.scope_id.clone(),
            scope_type: input.scope_type.clone(),
            scope_definition_id,
        };

        self.conn
            .execute(
                "INSERT INTO tasks(task_id, name, scope_id, scope_type, scope_definition_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task.id,
                    task.name,
                    task.scope_id,
                    task.scope_type,
                    task.scope_definition_id,
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert task")?;

        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                "SELECT task_id, name, scope_id, scope_type, scope_definition_id
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(Task {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        scope_id: row.get(2)?,
                        scope_type: row.get(3)?,
                        scope_definition_id: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("failed to read task")
    }

    pub fn save_engine_config(&self, config: &EngineConfig) -> Result<()> {
        let payload = serde_json::to_string(config).context("failed to serialize engine config")?;

        self.conn
            .execute(
                "INSERT INTO engine_config(config_key, config_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_key) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![ENGINE_CONFIG_KEY, payload, now_rfc3339()?],
            )
            .context("failed to upsert engine config")?;

        info!(
            history_level = %config.history_level,
            enable_definition_history_level = config.enable_definition_history_level,
            "saved engine config"
        );
        Ok(())
    }

    pub fn load_engine_config(&self) -> Result<Option<EngineConfig>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM engine_config WHERE config_key = ?1",
                params![ENGINE_CONFIG_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read engine config")?;

        match raw {
            Some(json) => {
                let config = EngineConfig::from_json_str(&json)
                    .map_err(|err| anyhow!("invalid stored engine config: {err}"))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    fn stored_model_json(&self, case_definition_id: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT model_json FROM case_definitions WHERE case_definition_id = ?1",
                params![case_definition_id],
                |row| row.get(0),
            )
            .optional()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DefinitionModelProvider for SqliteHistoryStore {
    fn case_definition(
        &self,
        case_definition_id: &str,
    ) -> Result<Option<CaseDefinition>, LookupError> {
        self.get_case_definition(case_definition_id)
            .map_err(|err| LookupError::Storage(format!("{err:#}")))
    }

    fn case_model(&self, case_definition_id: &str) -> Result<Option<Arc<CaseModel>>, LookupError> {
        let raw = self
            .stored_model_json(case_definition_id)
            .map_err(|err| LookupError::Storage(err.to_string()))?;

        match raw {
            Some(json) => serde_json::from_str::<CaseModel>(&json)
                .map(|model| Some(Arc::new(model)))
                .map_err(|err| LookupError::Decode(err.to_string())),
            None => Ok(None),
        }
    }
}

impl InstanceLookup for SqliteHistoryStore {
    fn find_case_instance(
        &self,
        case_instance_id: &str,
    ) -> Result<Option<CaseInstance>, LookupError> {
        self.get_case_instance(case_instance_id)
            .map_err(|err| LookupError::Storage(format!("{err:#}")))
    }

    fn find_task(&self, task_id: &str) -> Result<Option<Task>, LookupError> {
        self.get_task(task_id)
            .map_err(|err| LookupError::Storage(format!("{err:#}")))
    }
}

fn parse_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseDefinition> {
    let version_i64: i64 = row.get(3)?;
    let version = u32::try_from(version_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid version: {version_i64}"),
            )),
        )
    })?;

    Ok(CaseDefinition {
        id: row.get(0)?,
        key: row.get(1)?,
        name: row.get(2)?,
        version,
    })
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_policy_core::{
        ExtensionElement, ExtensionElements, HistoryEvent, HistoryLevel, HistoryPolicyResolver,
        IdentityLink, SCOPE_TYPE_TASK,
    };
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteHistoryStore {
        let store = must(SqliteHistoryStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_model(history_level: Option<&str>) -> CaseModel {
        let mut plan_model_extensions = ExtensionElements::new();
        if let Some(level) = history_level {
            plan_model_extensions.insert(
                "historyLevel".to_string(),
                vec![ExtensionElement::with_text(level)],
            );
        }

        let raw = serde_json::json!({
            "cases": [{
                "id": "claimCase",
                "plan_model": {
                    "id": "claimPlan",
                    "extension_elements": plan_model_extensions,
                    "plan_items": [
                        {"id": "PI_review", "definition_ref": "review"},
                        {"id": "PI_notify", "definition_ref": "notify"}
                    ],
                    "plan_item_definitions": [
                        {
                            "id": "review",
                            "kind": "human_task",
                            "extension_elements": {"includeInHistory": [{"text": "true"}]}
                        },
                        {"id": "notify", "kind": "service_task"}
                    ]
                }
            }]
        });

        match serde_json::from_value(raw) {
            Ok(model) => model,
            Err(err) => panic!("invalid fixture model: {err}"),
        }
    }

    fn deploy(store: &SqliteHistoryStore, history_level: Option<&str>) -> CaseDefinition {
        must(store.deploy_definition(&DeploymentInput {
            case_definition_id: None,
            key: "claimCase".to_string(),
            name: Some("Claim".to_string()),
            model: fixture_model(history_level),
        }))
    }

    #[test]
    fn migration_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());

        let count: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(count, 1);
    }

    #[test]
    fn deploy_assigns_incrementing_versions() {
        let store = fixture_store();
        let first = deploy(&store, None);
        let second = deploy(&store, Some("task"));

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(first.id.starts_with("claimCase:1:"));
        assert_ne!(first.id, second.id);

        let loaded = must(store.get_case_definition(&second.id));
        assert_eq!(loaded, Some(second));
    }

    #[test]
    fn deploy_rejects_model_without_matching_case() {
        let store = fixture_store();
        let result = store.deploy_definition(&DeploymentInput {
            case_definition_id: None,
            key: "otherCase".to_string(),
            name: None,
            model: fixture_model(None),
        });

        let err = match result {
            Ok(_) => panic!("expected deploy to fail"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("does not declare a case"));
    }

    #[test]
    fn case_scoped_task_inherits_definition() {
        let store = fixture_store();
        let definition = deploy(&store, None);
        let instance = must(store.start_case_instance(&definition.id, Some("claim-42")));

        let task = must(store.create_task(&TaskInput {
            name: Some("Review claim".to_string()),
            scope_id: Some(instance.id.clone()),
            scope_type: Some(SCOPE_TYPE_CMMN.to_string()),
            ..TaskInput::default()
        }));
        assert_eq!(task.scope_definition_id.as_deref(), Some(definition.id.as_str()));

        let loaded = must(store.get_task(&task.id));
        assert_eq!(loaded, Some(task));
    }

    #[test]
    fn start_case_instance_requires_known_definition() {
        let store = fixture_store();
        assert!(store.start_case_instance("missing:1:x", None).is_err());
    }

    #[test]
    fn engine_config_round_trips() {
        let store = fixture_store();
        assert_eq!(must(store.load_engine_config()), None);

        let config = EngineConfig::new(HistoryLevel::Task).with_definition_history_level(true);
        must(store.save_engine_config(&config));
        must(store.save_engine_config(&config));
        assert_eq!(must(store.load_engine_config()), Some(config));
    }

    #[test]
    fn corrupt_stored_model_degrades_to_engine_level() {
        let store = fixture_store();
        let definition = deploy(&store, Some("none"));

        let update = store.connection().execute(
            "UPDATE case_definitions SET model_json = '{' WHERE case_definition_id = ?1",
            params![definition.id],
        );
        if let Err(err) = update {
            panic!("test failure: {err}");
        }

        assert!(matches!(
            store.case_model(&definition.id),
            Err(LookupError::Decode(_))
        ));

        let resolver = HistoryPolicyResolver::new(
            EngineConfig::new(HistoryLevel::Task).with_definition_history_level(true),
            &store,
            &store,
        );
        assert_eq!(resolver.effective_level(Some(definition.id.as_str())), HistoryLevel::Task);
        assert!(resolver.has_task_history_level(Some(definition.id.as_str())));
        assert!(!resolver.has_activity_history_level(Some(definition.id.as_str()), Some("review")));
    }

    #[test]
    fn resolver_reads_overrides_and_links_from_store() {
        let store = fixture_store();
        let definition = deploy(&store, Some("task"));
        let instance = must(store.start_case_instance(&definition.id, None));
        let task = must(store.create_task(&TaskInput {
            scope_id: Some(instance.id.clone()),
            scope_type: Some(SCOPE_TYPE_CMMN.to_string()),
            ..TaskInput::default()
        }));

        let resolver = HistoryPolicyResolver::new(
            EngineConfig::new(HistoryLevel::Full).with_definition_history_level(true),
            &store,
            &store,
        );

        assert_eq!(resolver.effective_level(Some(definition.id.as_str())), HistoryLevel::Task);
        assert!(resolver.has_task_history_level(Some(definition.id.as_str())));
        assert!(resolver.has_activity_history_level(Some(definition.id.as_str()), Some("review")));
        assert!(
            resolver.has_activity_history_level(Some(definition.id.as_str()), Some("PI_review"))
        );
        assert!(!resolver.has_activity_history_level(Some(definition.id.as_str()), Some("notify")));

        let link = IdentityLink {
            task_id: Some(task.id.clone()),
            user_id: Some("kermit".to_string()),
            ..IdentityLink::default()
        };
        let decision = resolver.decide(&HistoryEvent::IdentityLink { link });
        assert_eq!(decision.definition_id.as_deref(), Some(definition.id.as_str()));
        assert_eq!(decision.effective_level, HistoryLevel::Task);
        assert!(!decision.record);

        let standalone = must(store.create_task(&TaskInput {
            scope_type: Some(SCOPE_TYPE_TASK.to_string()),
            ..TaskInput::default()
        }));
        assert_eq!(standalone.scope_definition_id, None);
    }

    fn level_strategy() -> impl Strategy<Value = HistoryLevel> {
        prop::sample::select(HistoryLevel::all().to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_stored_override_precedence(engine in level_strategy(), declared in level_strategy(), enabled in any::<bool>()) {
            let store = fixture_store();
            let definition = deploy(&store, Some(declared.as_str()));
            let resolver = HistoryPolicyResolver::new(
                EngineConfig::new(engine).with_definition_history_level(enabled),
                &store,
                &store,
            );

            let expected = if enabled { declared } else { engine };
            prop_assert_eq!(resolver.effective_level(Some(definition.id.as_str())), expected);
            prop_assert_eq!(resolver.effective_level(Some("missing:1:x")), engine);
            prop_assert_eq!(
                resolver.has_activity_history_level(Some(definition.id.as_str()), Some("notify")),
                expected.has_activity_capture()
            );
        }
    }
}
