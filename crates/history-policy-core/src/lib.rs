use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Extension element on a case plan model carrying the definition-level override.
pub const HISTORY_LEVEL_EXTENSION: &str = "historyLevel";
/// Extension element on a plan item definition opting it into activity history.
pub const INCLUDE_IN_HISTORY_EXTENSION: &str = "includeInHistory";

pub const SCOPE_TYPE_CMMN: &str = "cmmn";
pub const SCOPE_TYPE_TASK: &str = "task";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LookupError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("illegal value for history level: {0}")]
pub struct HistoryLevelParseError(pub String);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ModelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Granularity of the history an engine records.
///
/// Levels compare through [`HistoryLevel::rank`], never through declaration
/// order. `Task` sits below `Activity`, yet `Audit` and above still capture
/// tasks; see [`HistoryLevel::has_task_capture`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryLevel {
    None,
    Instance,
    Task,
    Activity,
    Audit,
    Full,
}

impl HistoryLevel {
    const ALL: [Self; 6] = [
        Self::None,
        Self::Instance,
        Self::Task,
        Self::Activity,
        Self::Audit,
        Self::Full,
    ];

    /// All levels, lowest rank first.
    #[must_use]
    pub fn all() -> &'static [Self] {
        &Self::ALL
    }

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Instance => 1,
            Self::Task => 2,
            Self::Activity => 3,
            Self::Audit => 4,
            Self::Full => 5,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Instance => "instance",
            Self::Task => "task",
            Self::Activity => "activity",
            Self::Audit => "audit",
            Self::Full => "full",
        }
    }

    /// Looks up a level by its exact (case-sensitive) key.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "instance" => Some(Self::Instance),
            "task" => Some(Self::Task),
            "activity" => Some(Self::Activity),
            "audit" => Some(Self::Audit),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_at_least(self, required: Self) -> bool {
        self.rank() >= required.rank()
    }

    /// Task history is recorded at exactly `Task`, or at `Audit` and above.
    #[must_use]
    pub fn has_task_capture(self) -> bool {
        self == Self::Task || self.is_at_least(Self::Audit)
    }

    #[must_use]
    pub fn has_activity_capture(self) -> bool {
        self.is_at_least(Self::Activity)
    }
}

impl Display for HistoryLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryLevel {
    type Err = HistoryLevelParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| HistoryLevelParseError(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub history_level: HistoryLevel,
    #[serde(default)]
    pub enable_definition_history_level: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_level: HistoryLevel::Audit,
            enable_definition_history_level: false,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new(history_level: HistoryLevel) -> Self {
        Self {
            history_level,
            enable_definition_history_level: false,
        }
    }

    #[must_use]
    pub fn with_definition_history_level(mut self, enabled: bool) -> Self {
        self.enable_definition_history_level = enabled;
        self
    }

    #[must_use]
    pub fn history_level(&self) -> HistoryLevel {
        self.history_level
    }

    #[must_use]
    pub fn is_definition_history_level_enabled(&self) -> bool {
        self.enable_definition_history_level
    }

    /// Decodes an engine configuration from JSON.
    ///
    /// # Errors
    /// Returns [`ConfigError::Configuration`] when the payload is not an
    /// object with a known `history_level` key.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            ConfigError::Configuration(format!("invalid engine config JSON payload: {err}"))
        })
    }

    /// Decodes an engine configuration from a JSON document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Configuration`] when the text is not valid JSON
    /// or does not describe an engine configuration.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| {
            ConfigError::Configuration(format!("engine config is not valid JSON: {err}"))
        })?;
        Self::from_json(&value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExtensionElement {
    #[serde(default)]
    pub text: Option<String>,
}

impl ExtensionElement {
    #[must_use]
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// Extension elements keyed by element name, in document order per name.
pub type ExtensionElements = BTreeMap<String, Vec<ExtensionElement>>;

pub trait HasExtensionElements {
    fn extension_elements(&self) -> &ExtensionElements;

    /// Text of the first element registered under `key`.
    fn extension_value(&self, key: &str) -> Option<&str> {
        self.extension_elements()
            .get(key)
            .and_then(|elements| elements.first())
            .and_then(|element| element.text.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanItemDefinitionKind {
    #[default]
    Generic,
    HumanTask,
    ServiceTask,
    ProcessTask,
    CaseTask,
    DecisionTask,
    Milestone,
    EventListener,
    Stage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanItem {
    pub id: String,
    pub definition_ref: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanItemDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: PlanItemDefinitionKind,
    #[serde(default)]
    pub extension_elements: ExtensionElements,
    /// Children of a stage definition; empty for every other kind.
    #[serde(default)]
    pub plan_items: Vec<PlanItem>,
    #[serde(default)]
    pub plan_item_definitions: Vec<PlanItemDefinition>,
}

impl HasExtensionElements for PlanItemDefinition {
    fn extension_elements(&self) -> &ExtensionElements {
        &self.extension_elements
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanModel {
    pub id: String,
    #[serde(default)]
    pub extension_elements: ExtensionElements,
    #[serde(default)]
    pub plan_items: Vec<PlanItem>,
    #[serde(default)]
    pub plan_item_definitions: Vec<PlanItemDefinition>,
}

impl HasExtensionElements for PlanModel {
    fn extension_elements(&self) -> &ExtensionElements {
        &self.extension_elements
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Case {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub plan_model: PlanModel,
}

/// Parsed case model as produced by a definition loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseModel {
    pub cases: Vec<Case>,
}

impl CaseModel {
    /// Decodes and validates a case model from a JSON document.
    ///
    /// # Errors
    /// Returns [`ModelError::Decode`] for malformed JSON and
    /// [`ModelError::Validation`] when the decoded model is inconsistent.
    pub fn from_json_str(raw: &str) -> Result<Self, ModelError> {
        let model: Self = serde_json::from_str(raw)
            .map_err(|err| ModelError::Decode(format!("invalid case model JSON: {err}")))?;
        model.validate()?;
        Ok(model)
    }

    /// Checks that the model has at least one case, non-empty unique ids and
    /// plan items whose definition references resolve.
    ///
    /// # Errors
    /// Returns [`ModelError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.cases.is_empty() {
            return Err(ModelError::Validation(
                "case model MUST declare at least one case".to_string(),
            ));
        }

        let mut seen_cases = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            if case.id.trim().is_empty() {
                return Err(ModelError::Validation("case id MUST be provided".to_string()));
            }
            if seen_cases.contains(&case.id.as_str()) {
                return Err(ModelError::Validation(format!(
                    "duplicate case id: {}",
                    case.id
                )));
            }
            seen_cases.push(case.id.as_str());

            let mut definition_ids = Vec::new();
            collect_definition_ids(&case.plan_model.plan_item_definitions, &mut definition_ids)?;
            validate_plan_items(
                &case.plan_model.plan_items,
                &case.plan_model.plan_item_definitions,
                &definition_ids,
            )?;
        }

        Ok(())
    }

    #[must_use]
    pub fn case_by_id(&self, case_id: &str) -> Option<&Case> {
        self.cases.iter().find(|case| case.id == case_id)
    }

    /// Finds a plan item definition by id in any case, descending into stages.
    #[must_use]
    pub fn find_plan_item_definition(&self, definition_id: &str) -> Option<&PlanItemDefinition> {
        self.cases.iter().find_map(|case| {
            find_definition_in(&case.plan_model.plan_item_definitions, definition_id)
        })
    }

    /// Finds a plan item (the wrapper around a definition) by id in any case.
    #[must_use]
    pub fn find_plan_item(&self, plan_item_id: &str) -> Option<&PlanItem> {
        self.cases.iter().find_map(|case| {
            find_plan_item_in(
                &case.plan_model.plan_items,
                &case.plan_model.plan_item_definitions,
                plan_item_id,
            )
        })
    }

    #[must_use]
    pub fn plan_item_definition_of(&self, plan_item: &PlanItem) -> Option<&PlanItemDefinition> {
        self.find_plan_item_definition(&plan_item.definition_ref)
    }
}

fn find_definition_in<'a>(
    definitions: &'a [PlanItemDefinition],
    definition_id: &str,
) -> Option<&'a PlanItemDefinition> {
    for definition in definitions {
        if definition.id == definition_id {
            return Some(definition);
        }
        if let Some(found) = find_definition_in(&definition.plan_item_definitions, definition_id) {
            return Some(found);
        }
    }
    None
}

fn find_plan_item_in<'a>(
    plan_items: &'a [PlanItem],
    definitions: &'a [PlanItemDefinition],
    plan_item_id: &str,
) -> Option<&'a PlanItem> {
    if let Some(item) = plan_items.iter().find(|item| item.id == plan_item_id) {
        return Some(item);
    }
    definitions.iter().find_map(|definition| {
        find_plan_item_in(
            &definition.plan_items,
            &definition.plan_item_definitions,
            plan_item_id,
        )
    })
}

fn collect_definition_ids<'a>(
    definitions: &'a [PlanItemDefinition],
    ids: &mut Vec<&'a str>,
) -> Result<(), ModelError> {
    for definition in definitions {
        if definition.id.trim().is_empty() {
            return Err(ModelError::Validation(
                "plan item definition id MUST be provided".to_string(),
            ));
        }
        if ids.contains(&definition.id.as_str()) {
            return Err(ModelError::Validation(format!(
                "duplicate plan item definition id: {}",
                definition.id
            )));
        }
        ids.push(definition.id.as_str());
        collect_definition_ids(&definition.plan_item_definitions, ids)?;
    }
    Ok(())
}

fn validate_plan_items(
    plan_items: &[PlanItem],
    definitions: &[PlanItemDefinition],
    definition_ids: &[&str],
) -> Result<(), ModelError> {
    for item in plan_items {
        if item.id.trim().is_empty() {
            return Err(ModelError::Validation("plan item id MUST be provided".to_string()));
        }
        if !definition_ids.contains(&item.definition_ref.as_str()) {
            return Err(ModelError::Validation(format!(
                "plan item {} references unknown definition {}",
                item.id, item.definition_ref
            )));
        }
    }
    for definition in definitions {
        validate_plan_items(
            &definition.plan_items,
            &definition.plan_item_definitions,
            definition_ids,
        )?;
    }
    Ok(())
}

/// Deployed case definition; `key` names the case inside its model.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseDefinition {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseInstance {
    pub id: String,
    pub case_definition_id: String,
    #[serde(default)]
    pub business_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub scope_type: Option<String>,
    #[serde(default)]
    pub scope_definition_id: Option<String>,
}

/// Source of parsed case models. Caching, if any, lives behind this trait.
pub trait DefinitionModelProvider {
    /// # Errors
    /// Returns [`LookupError`] when the backing store cannot be read.
    fn case_definition(&self, case_definition_id: &str)
        -> Result<Option<CaseDefinition>, LookupError>;

    /// # Errors
    /// Returns [`LookupError`] when the backing store cannot be read or the
    /// stored model cannot be decoded.
    fn case_model(&self, case_definition_id: &str) -> Result<Option<Arc<CaseModel>>, LookupError>;
}

/// Point reads of runtime records by id.
pub trait InstanceLookup {
    /// # Errors
    /// Returns [`LookupError`] when the backing store cannot be read.
    fn find_case_instance(&self, case_instance_id: &str)
        -> Result<Option<CaseInstance>, LookupError>;

    /// # Errors
    /// Returns [`LookupError`] when the backing store cannot be read.
    fn find_task(&self, task_id: &str) -> Result<Option<Task>, LookupError>;
}

/// A record that can name the case definition it belongs to.
pub trait OwningDefinition {
    fn owning_definition_id(&self, instances: &dyn InstanceLookup) -> Option<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityLink {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub scope_type: Option<String>,
    #[serde(default)]
    pub scope_definition_id: Option<String>,
}

impl OwningDefinition for IdentityLink {
    fn owning_definition_id(&self, instances: &dyn InstanceLookup) -> Option<String> {
        if let Some(scope_definition_id) = &self.scope_definition_id {
            return Some(scope_definition_id.clone());
        }
        if let Some(scope_id) = &self.scope_id {
            return case_definition_id_of_instance(instances, scope_id);
        }
        if let Some(task_id) = &self.task_id {
            return scope_definition_id_of_task(instances, task_id);
        }
        None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityLink {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub scope_type: Option<String>,
    #[serde(default)]
    pub reference_scope_id: Option<String>,
    #[serde(default)]
    pub reference_scope_type: Option<String>,
    #[serde(default)]
    pub hierarchy_type: Option<String>,
}

impl OwningDefinition for EntityLink {
    fn owning_definition_id(&self, instances: &dyn InstanceLookup) -> Option<String> {
        let scope_id = self.scope_id.as_deref()?;
        match self.scope_type.as_deref() {
            Some(SCOPE_TYPE_CMMN) => case_definition_id_of_instance(instances, scope_id),
            Some(SCOPE_TYPE_TASK) => scope_definition_id_of_task(instances, scope_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryLink {
    Identity(IdentityLink),
    Entity(EntityLink),
}

impl OwningDefinition for HistoryLink {
    fn owning_definition_id(&self, instances: &dyn InstanceLookup) -> Option<String> {
        match self {
            Self::Identity(link) => link.owning_definition_id(instances),
            Self::Entity(link) => link.owning_definition_id(instances),
        }
    }
}

fn case_definition_id_of_instance(
    instances: &dyn InstanceLookup,
    case_instance_id: &str,
) -> Option<String> {
    match instances.find_case_instance(case_instance_id) {
        Ok(Some(instance)) => Some(instance.case_definition_id),
        Ok(None) => {
            debug!(case_instance_id, "case instance not found; definition unresolved");
            None
        }
        Err(err) => {
            debug!(
                case_instance_id,
                error = %err,
                "case instance lookup failed; definition unresolved"
            );
            None
        }
    }
}

fn scope_definition_id_of_task(instances: &dyn InstanceLookup, task_id: &str) -> Option<String> {
    match instances.find_task(task_id) {
        Ok(Some(task)) => task.scope_definition_id,
        Ok(None) => {
            debug!(task_id, "task not found; definition unresolved");
            None
        }
        Err(err) => {
            debug!(task_id, error = %err, "task lookup failed; definition unresolved");
            None
        }
    }
}

/// A point in case execution where history may be written.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    CaseInstance {
        #[serde(default)]
        definition_id: Option<String>,
    },
    PlanItemInstance {
        #[serde(default)]
        definition_id: Option<String>,
        #[serde(default)]
        activity_id: Option<String>,
    },
    Task {
        #[serde(default)]
        definition_id: Option<String>,
    },
    Variable {
        #[serde(default)]
        definition_id: Option<String>,
    },
    VariableDetail {
        #[serde(default)]
        definition_id: Option<String>,
    },
    IdentityLink {
        link: IdentityLink,
    },
    EntityLink {
        link: EntityLink,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryDecision {
    pub record: bool,
    pub definition_id: Option<String>,
    pub effective_level: HistoryLevel,
    pub required: HistoryLevel,
    pub reason_codes: Vec<String>,
}

/// Decides whether history is captured for a definition, task or activity.
///
/// Every lookup failure degrades to the engine-wide level; no predicate
/// returns an error.
pub struct HistoryPolicyResolver<'a> {
    config: EngineConfig,
    models: &'a dyn DefinitionModelProvider,
    instances: &'a dyn InstanceLookup,
}

impl<'a> HistoryPolicyResolver<'a> {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        models: &'a dyn DefinitionModelProvider,
        instances: &'a dyn InstanceLookup,
    ) -> Self {
        Self {
            config,
            models,
            instances,
        }
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    #[must_use]
    pub fn is_engine_level_at_least(&self, required: HistoryLevel) -> bool {
        debug!(current = %self.config.history_level, %required, "engine history level check");
        self.config.history_level.is_at_least(required)
    }

    #[must_use]
    pub fn effective_level(&self, definition_id: Option<&str>) -> HistoryLevel {
        let engine_level = self.config.history_level;
        if !self.config.enable_definition_history_level {
            return engine_level;
        }
        let Some(definition_id) = definition_id else {
            return engine_level;
        };
        self.definition_history_level(definition_id)
            .unwrap_or(engine_level)
    }

    /// Override declared on the definition's plan model, if one resolves.
    #[must_use]
    pub fn definition_history_level(&self, definition_id: &str) -> Option<HistoryLevel> {
        let definition = absorb(
            self.models.case_definition(definition_id),
            definition_id,
            "case definition",
        )?;
        let model = absorb(
            self.models.case_model(definition_id),
            definition_id,
            "case model",
        )?;

        let Some(case) = model.case_by_id(&definition.key) else {
            debug!(
                definition_id,
                key = %definition.key,
                "case for definition key missing from model; using engine history level"
            );
            return None;
        };

        let raw = case
            .plan_model
            .extension_value(HISTORY_LEVEL_EXTENSION)
            .filter(|value| !value.is_empty())?;

        let level = HistoryLevel::parse(raw);
        if level.is_none() {
            debug!(
                definition_id,
                value = raw,
                "unparseable definition history level; using engine history level"
            );
        }
        level
    }

    #[must_use]
    pub fn is_history_enabled(&self, definition_id: Option<&str>) -> bool {
        let level = self.effective_level(definition_id);
        debug!(current = %level, "history enabled check");
        level != HistoryLevel::None
    }

    #[must_use]
    pub fn meets_level(&self, definition_id: Option<&str>, required: HistoryLevel) -> bool {
        let level = self.effective_level(definition_id);
        debug!(current = %level, %required, "history level check");
        level.is_at_least(required)
    }

    #[must_use]
    pub fn has_task_history_level(&self, definition_id: Option<&str>) -> bool {
        let level = self.effective_level(definition_id);
        debug!(current = %level, required = %HistoryLevel::Task, "task history level check");
        level.has_task_capture()
    }

    #[must_use]
    pub fn has_activity_history_level(
        &self,
        definition_id: Option<&str>,
        activity_id: Option<&str>,
    ) -> bool {
        let level = self.effective_level(definition_id);
        debug!(
            current = %level,
            required = %HistoryLevel::Activity,
            "activity history level check"
        );
        self.activity_capture(level, definition_id, activity_id).0
    }

    /// Reads `includeInHistory` for an activity, looking it up first as a plan
    /// item definition and then as a plan item wrapping one.
    #[must_use]
    pub fn include_plan_item_in_history(
        &self,
        definition_id: Option<&str>,
        activity_id: &str,
    ) -> bool {
        let Some(definition_id) = definition_id else {
            return false;
        };
        let Some(model) = absorb(
            self.models.case_model(definition_id),
            definition_id,
            "case model",
        ) else {
            return false;
        };

        let plan_item_definition = model.find_plan_item_definition(activity_id).or_else(|| {
            model
                .find_plan_item(activity_id)
                .and_then(|item| model.plan_item_definition_of(item))
        });
        let Some(plan_item_definition) = plan_item_definition else {
            debug!(definition_id, activity_id, "activity not found in case model");
            return false;
        };

        plan_item_definition
            .extension_value(INCLUDE_IN_HISTORY_EXTENSION)
            .is_some_and(parse_boolean)
    }

    #[must_use]
    pub fn definition_id_for<L>(&self, link: &L) -> Option<String>
    where
        L: OwningDefinition + ?Sized,
    {
        link.owning_definition_id(self.instances)
    }

    #[must_use]
    pub fn decide(&self, event: &HistoryEvent) -> HistoryDecision {
        match event {
            HistoryEvent::CaseInstance { definition_id } => {
                self.threshold_decision(definition_id.clone(), HistoryLevel::Instance, Vec::new())
            }
            HistoryEvent::Variable { definition_id } => {
                self.threshold_decision(definition_id.clone(), HistoryLevel::Activity, Vec::new())
            }
            HistoryEvent::VariableDetail { definition_id } => {
                self.threshold_decision(definition_id.clone(), HistoryLevel::Full, Vec::new())
            }
            HistoryEvent::Task { definition_id } => self.task_decision(definition_id.clone()),
            HistoryEvent::PlanItemInstance {
                definition_id,
                activity_id,
            } => self.activity_decision(definition_id.clone(), activity_id.as_deref()),
            HistoryEvent::IdentityLink { link } => self.link_decision(link),
            HistoryEvent::EntityLink { link } => self.link_decision(link),
        }
    }

    fn link_decision<L: OwningDefinition + ?Sized>(&self, link: &L) -> HistoryDecision {
        let definition_id = self.definition_id_for(link);
        let mut reason_codes = Vec::new();
        if definition_id.is_none() {
            reason_codes.push("fallback.definition_unresolved".to_string());
        }
        self.threshold_decision(definition_id, HistoryLevel::Audit, reason_codes)
    }

    fn threshold_decision(
        &self,
        definition_id: Option<String>,
        required: HistoryLevel,
        mut reason_codes: Vec<String>,
    ) -> HistoryDecision {
        let level = self.effective_level(definition_id.as_deref());
        let record = level.is_at_least(required);
        let reason = if level == HistoryLevel::None {
            "excluded.history_disabled"
        } else if record {
            "included.level_threshold"
        } else {
            "excluded.below_threshold"
        };
        reason_codes.push(reason.to_string());

        HistoryDecision {
            record,
            definition_id,
            effective_level: level,
            required,
            reason_codes,
        }
    }

    fn task_decision(&self, definition_id: Option<String>) -> HistoryDecision {
        let level = self.effective_level(definition_id.as_deref());
        let reason = if level == HistoryLevel::Task {
            "included.task_level"
        } else if level.is_at_least(HistoryLevel::Audit) {
            "included.audit_implies_task"
        } else if level == HistoryLevel::None {
            "excluded.history_disabled"
        } else {
            "excluded.below_threshold"
        };

        HistoryDecision {
            record: level.has_task_capture(),
            definition_id,
            effective_level: level,
            required: HistoryLevel::Task,
            reason_codes: vec![reason.to_string()],
        }
    }

    fn activity_decision(
        &self,
        definition_id: Option<String>,
        activity_id: Option<&str>,
    ) -> HistoryDecision {
        let level = self.effective_level(definition_id.as_deref());
        let (record, reason) = self.activity_capture(level, definition_id.as_deref(), activity_id);

        HistoryDecision {
            record,
            definition_id,
            effective_level: level,
            required: HistoryLevel::Activity,
            reason_codes: vec![reason.to_string()],
        }
    }

    // A `None` level is never re-enabled by an activity override.
    fn activity_capture(
        &self,
        level: HistoryLevel,
        definition_id: Option<&str>,
        activity_id: Option<&str>,
    ) -> (bool, &'static str) {
        if level.has_activity_capture() {
            return (true, "included.level_threshold");
        }
        if level == HistoryLevel::None {
            return (false, "excluded.history_disabled");
        }
        match activity_id.filter(|id| !id.is_empty()) {
            Some(activity_id) => {
                if self.include_plan_item_in_history(definition_id, activity_id) {
                    (true, "included.activity_override")
                } else {
                    (false, "excluded.activity_not_included")
                }
            }
            None => (false, "excluded.below_threshold"),
        }
    }
}

fn absorb<T>(
    result: Result<Option<T>, LookupError>,
    definition_id: &str,
    what: &str,
) -> Option<T> {
    match result {
        Ok(Some(value)) => Some(value),
        Ok(None) => {
            debug!(definition_id, "{what} not found; using engine history level");
            None
        }
        Err(err) => {
            debug!(definition_id, error = %err, "{what} lookup failed; using engine history level");
            None
        }
    }
}

fn parse_boolean(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

/// Map-backed collaborators for embedding hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCaseRepository {
    definitions: BTreeMap<String, (CaseDefinition, Arc<CaseModel>)>,
    instances: BTreeMap<String, CaseInstance>,
    tasks: BTreeMap<String, Task>,
}

impl InMemoryCaseRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_definition(&mut self, definition: CaseDefinition, model: CaseModel) {
        self.definitions
            .insert(definition.id.clone(), (definition, Arc::new(model)));
    }

    pub fn insert_case_instance(&mut self, instance: CaseInstance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    pub fn insert_task(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }
}

impl DefinitionModelProvider for InMemoryCaseRepository {
    fn case_definition(
        &self,
        case_definition_id: &str,
    ) -> Result<Option<CaseDefinition>, LookupError> {
        Ok(self
            .definitions
            .get(case_definition_id)
            .map(|(definition, _)| definition.clone()))
    }

    fn case_model(&self, case_definition_id: &str) -> Result<Option<Arc<CaseModel>>, LookupError> {
        Ok(self
            .definitions
            .get(case_definition_id)
            .map(|(_, model)| Arc::clone(model)))
    }
}

impl InstanceLookup for InMemoryCaseRepository {
    fn find_case_instance(
        &self,
        case_instance_id: &str,
    ) -> Result<Option<CaseInstance>, LookupError> {
        Ok(self.instances.get(case_instance_id).cloned())
    }

    fn find_task(&self, task_id: &str) -> Result<Option<Task>, LookupError> {
        Ok(self.tasks.get(task_id).cloned())
    }
}
