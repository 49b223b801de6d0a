//! Template registry: publish, list, and instantiate workflow templates.
//!
//! Publish-time validation enforces unique step ids and an acyclic
//! dependency graph, so a registered template always instantiates cleanly.
//! Instantiation clones the template's steps into execution-owned instances
//! with fresh ids, rewrites `depends_on` through an id-remap table, and
//! substitutes `${name}` parameter placeholders from caller parameters
//! layered over template defaults.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use dashmap::DashMap;
use relay_types::error::EngineError;
use relay_types::workflow::{
    ConditionOp, ConditionalRule, ExecutionStatus, ParallelMode, RetryPolicy, Step,
    StepDefinition, StepStatus, WorkflowExecution, WorkflowTemplate,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Group name for parallel steps that declare no explicit group.
const DEFAULT_PARALLEL_GROUP: &str = "default";

// ---------------------------------------------------------------------------
// TemplateRegistry
// ---------------------------------------------------------------------------

/// Listing row for a registered template.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    pub version: String,
    pub tags: Vec<String>,
    pub step_count: usize,
}

/// Concurrent store of published templates, keyed by template id.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<String, WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in templates.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for template in builtin_templates() {
            // Builtins are validated by their own tests; a publish failure
            // here is a programming error worth surfacing loudly in logs.
            if let Err(err) = registry.publish(template) {
                tracing::error!(error = %err, "failed to publish builtin template");
            }
        }
        registry
    }

    /// Validate and store a template.
    ///
    /// Re-publishing the same id is allowed only with a different `version`
    /// string; the same id and version returns [`EngineError::TemplateExists`].
    pub fn publish(&self, template: WorkflowTemplate) -> Result<(), EngineError> {
        validate_steps(&template.steps)?;

        if let Some(existing) = self.templates.get(&template.id) {
            if existing.version == template.version {
                return Err(EngineError::TemplateExists {
                    id: template.id.clone(),
                    version: template.version.clone(),
                });
            }
        }

        tracing::info!(
            template_id = %template.id,
            version = %template.version,
            steps = template.steps.len(),
            "template published"
        );
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    /// Fetch a template by id.
    pub fn get(&self, id: &str) -> Result<WorkflowTemplate, EngineError> {
        self.templates
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| EngineError::TemplateNotFound(id.to_string()))
    }

    /// Summaries of every registered template, sorted by id.
    pub fn list(&self) -> Vec<TemplateSummary> {
        let mut summaries: Vec<_> = self
            .templates
            .iter()
            .map(|entry| TemplateSummary {
                id: entry.id.clone(),
                name: entry.name.clone(),
                category: entry.category.clone(),
                version: entry.version.clone(),
                tags: entry.tags.clone(),
                step_count: entry.steps.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Instantiate a template into a PENDING execution.
    ///
    /// Caller `parameters` layer over the template's parameter defaults; the
    /// merged map seeds the execution context as `context.input` and drives
    /// `${name}` placeholder substitution in step parameters.
    pub fn instantiate(
        &self,
        id: &str,
        parameters: Map<String, Value>,
    ) -> Result<WorkflowExecution, EngineError> {
        let template = self.get(id)?;
        // Graph shape is validated at publish, but instantiation re-checks so
        // executions built from a future mutable store stay safe.
        validate_steps(&template.steps)?;

        let mut merged: Map<String, Value> = template
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in parameters {
            merged.insert(k, v);
        }

        // Remap table: definition id -> fresh instance id.
        let remap: HashMap<String, Uuid> = template
            .steps
            .iter()
            .map(|s| (s.id.clone(), Uuid::now_v7()))
            .collect();

        let mut parallel_groups: HashMap<String, Vec<Uuid>> = HashMap::new();
        let steps: Vec<Step> = template
            .steps
            .iter()
            .map(|def| {
                let instance_id = remap[&def.id];
                if def.parallel {
                    let group = def
                        .parallel_group
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PARALLEL_GROUP.to_string());
                    parallel_groups.entry(group).or_default().push(instance_id);
                }
                Step {
                    id: instance_id,
                    definition_id: def.id.clone(),
                    name: def.name.clone(),
                    service: def.service.clone(),
                    action: def.action.clone(),
                    parameters: substitute_map(&def.parameters, &merged),
                    depends_on: def.depends_on.iter().map(|d| remap[d]).collect(),
                    parallel: def.parallel,
                    parallel_group: def.parallel_group.clone().or_else(|| {
                        def.parallel.then(|| DEFAULT_PARALLEL_GROUP.to_string())
                    }),
                    parallel_mode: def.parallel_mode,
                    condition: def.condition.clone(),
                    timeout_secs: def.timeout_secs,
                    retry: def.retry.clone(),
                    status: StepStatus::Pending,
                    result: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                }
            })
            .collect();

        let mut context = Map::new();
        context.insert("input".to_string(), Value::Object(merged));
        context.insert("steps".to_string(), json!({}));

        Ok(WorkflowExecution {
            id: Uuid::now_v7(),
            template_id: Some(template.id.clone()),
            name: template.name.clone(),
            steps,
            context,
            status: ExecutionStatus::Pending,
            parallel_groups,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: Map::new(),
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Unique step ids and an acyclic dependency graph.
fn validate_steps(steps: &[StepDefinition]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            return Err(EngineError::Policy(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }
    super::dag::topological_order(steps)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Placeholder substitution
// ---------------------------------------------------------------------------

/// Whole-value `${name}` substitution, recursing into objects and arrays.
/// Unresolved placeholders pass through unchanged.
fn substitute_map(parameters: &Map<String, Value>, inputs: &Map<String, Value>) -> Map<String, Value> {
    parameters
        .iter()
        .map(|(k, v)| (k.clone(), substitute_value(v, inputs)))
        .collect()
}

fn substitute_value(value: &Value, inputs: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => match placeholder_name(s) {
            Some(name) => inputs.get(name).cloned().unwrap_or_else(|| value.clone()),
            None => value.clone(),
        },
        Value::Object(map) => Value::Object(substitute_map(map, inputs)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, inputs)).collect())
        }
        other => other.clone(),
    }
}

/// `"${customer_name}"` -> `Some("customer_name")`. Only whole-value
/// placeholders count; embedded `${}` inside longer strings do not.
fn placeholder_name(s: &str) -> Option<&str> {
    s.strip_prefix("${")?.strip_suffix('}')
}

// ---------------------------------------------------------------------------
// Built-in templates
// ---------------------------------------------------------------------------

fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        customer_onboarding(),
        account_enrichment(),
        invoice_followup(),
    ]
}

/// Linear chain with a conditional tail: create the contact, send the
/// welcome email, then ping sales only when asked to.
fn customer_onboarding() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "customer-onboarding".to_string(),
        name: "Customer Onboarding".to_string(),
        category: "sales".to_string(),
        description: Some(
            "Create a CRM contact, send the welcome email, optionally notify sales".to_string(),
        ),
        version: "1.0.0".to_string(),
        tags: vec!["crm".to_string(), "email".to_string()],
        parameters: HashMap::from([("notify_sales".to_string(), json!(false))]),
        steps: vec![
            StepDefinition {
                id: "create-contact".to_string(),
                name: "Create Contact".to_string(),
                service: "crm".to_string(),
                action: "create_contact".to_string(),
                parameters: object(json!({
                    "name": "${customer_name}",
                    "email": "${customer_email}",
                })),
                depends_on: vec![],
                parallel: false,
                parallel_group: None,
                parallel_mode: ParallelMode::All,
                condition: None,
                timeout_secs: Some(60),
                retry: Some(RetryPolicy::default()),
            },
            StepDefinition {
                id: "send-welcome".to_string(),
                name: "Send Welcome Email".to_string(),
                service: "email".to_string(),
                action: "send".to_string(),
                parameters: object(json!({
                    "to": "${customer_email}",
                    "template": "welcome",
                })),
                depends_on: vec!["create-contact".to_string()],
                parallel: false,
                parallel_group: None,
                parallel_mode: ParallelMode::All,
                condition: None,
                timeout_secs: Some(60),
                retry: Some(RetryPolicy::default()),
            },
            StepDefinition {
                id: "notify-sales".to_string(),
                name: "Notify Sales".to_string(),
                service: "chat".to_string(),
                action: "post_message".to_string(),
                parameters: object(json!({
                    "channel": "#sales",
                    "customer": "${customer_name}",
                })),
                depends_on: vec!["send-welcome".to_string()],
                parallel: false,
                parallel_group: None,
                parallel_mode: ParallelMode::All,
                condition: Some(ConditionalRule::compare(
                    ConditionOp::Equals,
                    "input.notify_sales",
                    json!(true),
                )),
                timeout_secs: None,
                retry: None,
            },
        ],
    }
}

/// Three data sources fan out in an `all` group, then one merge step joins
/// on all of them.
fn account_enrichment() -> WorkflowTemplate {
    let source = |id: &str, service: &str, action: &str| StepDefinition {
        id: id.to_string(),
        name: id.replace('-', " "),
        service: service.to_string(),
        action: action.to_string(),
        parameters: object(json!({ "domain": "${company_domain}" })),
        depends_on: vec![],
        parallel: true,
        parallel_group: Some("sources".to_string()),
        parallel_mode: ParallelMode::All,
        condition: None,
        timeout_secs: Some(120),
        retry: Some(RetryPolicy {
            max_retries: 2,
            base_delay_ms: 500,
            exponential: true,
            max_delay_ms: 5000,
            retryable_errors: None,
        }),
    };

    WorkflowTemplate {
        id: "account-enrichment".to_string(),
        name: "Account Enrichment".to_string(),
        category: "data".to_string(),
        description: Some("Pull firmographic data from three sources and merge".to_string()),
        version: "1.0.0".to_string(),
        tags: vec!["enrichment".to_string()],
        parameters: HashMap::new(),
        steps: vec![
            source("fetch-firmographics", "clearbit", "lookup"),
            source("fetch-tech-stack", "builtwith", "lookup"),
            source("fetch-funding", "crunchbase", "lookup"),
            StepDefinition {
                id: "merge-profile".to_string(),
                name: "Merge Profile".to_string(),
                service: "crm".to_string(),
                action: "update_account".to_string(),
                parameters: Map::new(),
                depends_on: vec![
                    "fetch-firmographics".to_string(),
                    "fetch-tech-stack".to_string(),
                    "fetch-funding".to_string(),
                ],
                parallel: false,
                parallel_group: None,
                parallel_mode: ParallelMode::All,
                condition: None,
                timeout_secs: Some(60),
                retry: None,
            },
        ],
    }
}

/// Balance check followed by two independent notification branches in
/// separate parallel groups.
fn invoice_followup() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "invoice-followup".to_string(),
        name: "Invoice Follow-up".to_string(),
        category: "billing".to_string(),
        description: Some("Chase overdue invoices over email and chat".to_string()),
        version: "1.0.0".to_string(),
        tags: vec!["billing".to_string()],
        parameters: HashMap::from([("min_balance".to_string(), json!(0))]),
        steps: vec![
            StepDefinition {
                id: "check-balance".to_string(),
                name: "Check Balance".to_string(),
                service: "billing".to_string(),
                action: "outstanding_balance".to_string(),
                parameters: object(json!({ "account_id": "${account_id}" })),
                depends_on: vec![],
                parallel: false,
                parallel_group: None,
                parallel_mode: ParallelMode::All,
                condition: None,
                timeout_secs: Some(60),
                retry: Some(RetryPolicy::default()),
            },
            StepDefinition {
                id: "email-reminder".to_string(),
                name: "Email Reminder".to_string(),
                service: "email".to_string(),
                action: "send".to_string(),
                parameters: object(json!({ "template": "overdue-invoice" })),
                depends_on: vec!["check-balance".to_string()],
                parallel: true,
                parallel_group: Some("email".to_string()),
                parallel_mode: ParallelMode::All,
                condition: Some(ConditionalRule::compare(
                    ConditionOp::GreaterThan,
                    "steps.check-balance.total",
                    json!(0),
                )),
                timeout_secs: Some(60),
                retry: None,
            },
            StepDefinition {
                id: "chat-reminder".to_string(),
                name: "Chat Reminder".to_string(),
                service: "chat".to_string(),
                action: "post_message".to_string(),
                parameters: object(json!({ "channel": "#collections" })),
                depends_on: vec!["check-balance".to_string()],
                parallel: true,
                parallel_group: Some("chat".to_string()),
                parallel_mode: ParallelMode::All,
                condition: Some(ConditionalRule::compare(
                    ConditionOp::GreaterThan,
                    "steps.check-balance.total",
                    json!(0),
                )),
                timeout_secs: Some(60),
                retry: None,
            },
        ],
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
