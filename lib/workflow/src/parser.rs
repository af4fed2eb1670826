//! Definition document parser.
//!
//! Parsing walks the JSON document by hand rather than through serde so that
//! every problem is collected: shape, expressions, action names, config
//! schemas and graph structure are all reported in one pass.

use crate::definition::{DefinitionDocument, TimeoutSpec, TriggerSpec, WorkflowDefinition};
use crate::error::DefinitionError;
use crate::expression::{Expression, placeholder_expressions};
use crate::graph;
use crate::registry::{ActionRegistry, StructuralKind};
use crate::retry::RetrySpec;
use crate::step::{
    ActionStep, ApprovalStep, BranchStep, DelayStep, JoinMode, ParallelStep, SequenceStep, StepId,
    StepSpec, WaitStep,
};
use haulflow_core::{DefinitionId, TenantScope};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};

/// Parses and validates a definition document.
///
/// # Errors
///
/// Returns every problem found in the document. The list is never empty.
pub fn parse_definition(
    id: DefinitionId,
    tenant: TenantScope,
    document: &JsonValue,
    registry: &ActionRegistry,
) -> Result<WorkflowDefinition, Vec<DefinitionError>> {
    let mut errors = Vec::new();
    let parsed = parse_document(document, registry, &mut errors);
    match parsed {
        Some(document) if errors.is_empty() => {
            Ok(WorkflowDefinition::from_document(id, tenant, document))
        }
        _ => {
            if errors.is_empty() {
                errors.push(DefinitionError::InvalidValue {
                    path: String::new(),
                    reason: "document could not be parsed".to_string(),
                });
            }
            Err(errors)
        }
    }
}

fn parse_document(
    document: &JsonValue,
    registry: &ActionRegistry,
    errors: &mut Vec<DefinitionError>,
) -> Option<DefinitionDocument> {
    let mut top = Reader::object(String::new(), document, errors)?;
    let name = top.string("name", true, errors);
    let version = top.version(errors);
    let trigger = match top.take("trigger") {
        Some(value) => parse_trigger(value, errors),
        None => {
            errors.push(DefinitionError::MissingKey {
                path: String::new(),
                key: "trigger",
            });
            None
        }
    };
    let entry = top.step_ref("entry", true, errors);
    let retry = top.retry(errors);
    let timeout = top.take("timeout").and_then(|value| parse_timeout(value, errors));

    let raw_steps = top.take("steps");
    if raw_steps.is_none() {
        errors.push(DefinitionError::MissingKey {
            path: String::new(),
            key: "steps",
        });
    }
    top.finish(errors);

    let (steps, known) = match raw_steps {
        Some(raw) => parse_steps(raw, registry, errors),
        None => (BTreeMap::new(), BTreeSet::new()),
    };

    if let Some(entry) = &entry {
        if raw_steps.is_some() {
            errors.extend(graph::validate(entry, &steps, &known));
        }
    }

    Some(DefinitionDocument {
        name: name?,
        version: version?,
        trigger: trigger?,
        entry: entry?,
        steps,
        retry,
        timeout,
    })
}

fn parse_trigger(value: &JsonValue, errors: &mut Vec<DefinitionError>) -> Option<TriggerSpec> {
    let mut reader = Reader::object("trigger".to_string(), value, errors)?;
    let event_kind = reader.string("event_kind", true, errors);
    let predicate = reader.expression("match", false, errors);
    reader.finish(errors);
    Some(TriggerSpec {
        event_kind: event_kind?,
        predicate,
    })
}

fn parse_timeout(value: &JsonValue, errors: &mut Vec<DefinitionError>) -> Option<TimeoutSpec> {
    let mut reader = Reader::object("timeout".to_string(), value, errors)?;
    let step_seconds = reader.seconds("step_seconds", errors);
    let instance_seconds = reader.seconds("instance_seconds", errors);
    reader.finish(errors);
    Some(TimeoutSpec {
        step_seconds,
        instance_seconds,
    })
}

fn parse_steps(
    raw: &JsonValue,
    registry: &ActionRegistry,
    errors: &mut Vec<DefinitionError>,
) -> (BTreeMap<StepId, StepSpec>, BTreeSet<StepId>) {
    let mut steps = BTreeMap::new();
    let Some(map) = raw.as_object() else {
        errors.push(DefinitionError::InvalidValue {
            path: "steps".to_string(),
            reason: "steps must be an object keyed by step id".to_string(),
        });
        return (steps, BTreeSet::new());
    };

    let known: BTreeSet<StepId> = map.keys().map(|k| StepId::from(k.as_str())).collect();
    for (key, value) in map {
        let id = StepId::from(key.as_str());
        if let Some(spec) = parse_step(&id, value, registry, errors) {
            steps.insert(id, spec);
        }
    }
    (steps, known)
}

fn parse_step(
    id: &StepId,
    value: &JsonValue,
    registry: &ActionRegistry,
    errors: &mut Vec<DefinitionError>,
) -> Option<StepSpec> {
    let mut reader = Reader::object(format!("steps.{id}"), value, errors)?;
    let kind = reader.string("kind", true, errors)?;
    if !STEP_KINDS.contains(&kind.as_str()) {
        errors.push(DefinitionError::InvalidValue {
            path: format!("steps.{id}.kind"),
            reason: format!("unknown step kind '{kind}'"),
        });
        return None;
    }
    let spec = step_body(id, &kind, &mut reader, registry, errors);
    reader.finish(errors);
    spec
}

const STEP_KINDS: [&str; 7] = [
    "action",
    "sequence",
    "branch",
    "parallel",
    "wait_for_event",
    "approval",
    "delay",
];

fn step_body(
    id: &StepId,
    kind: &str,
    reader: &mut Reader<'_>,
    registry: &ActionRegistry,
    errors: &mut Vec<DefinitionError>,
) -> Option<StepSpec> {
    match kind {
        "action" => parse_action(id, reader, registry, errors),
        "sequence" => {
            let children = reader.step_list("children", errors);
            let next = reader.step_ref("next", false, errors);
            children.map(|children| StepSpec::Sequence(SequenceStep { children, next }))
        }
        "branch" => {
            let condition = reader.expression("condition", true, errors);
            let true_next = reader.step_ref("true_next", true, errors);
            let false_next = reader.step_ref("false_next", true, errors);
            Some(StepSpec::Branch(BranchStep {
                condition: condition?,
                true_next: true_next?,
                false_next: false_next?,
            }))
        }
        "parallel" => {
            let children = reader.step_list("children", errors);
            let join = reader.step_ref("join", true, errors);
            let mode = reader.join_mode(errors);
            Some(StepSpec::Parallel(ParallelStep {
                children: children?,
                join: join?,
                mode,
            }))
        }
        "wait_for_event" => {
            let event_kind = reader.string("event_kind", true, errors);
            let predicate = reader.expression("match", false, errors);
            let timeout_seconds = reader.timeout(errors);
            let next = reader.step_ref("next", false, errors);
            let on_timeout = reader.step_ref("on_timeout", false, errors);
            let result_var = reader.string("result_var", false, errors);
            Some(StepSpec::WaitForEvent(WaitStep {
                event_kind: event_kind?,
                predicate,
                timeout_seconds,
                next,
                on_timeout,
                result_var,
            }))
        }
        "approval" => {
            let approver = reader.value("approver", true, errors);
            let timeout_seconds = reader.timeout(errors);
            let approved_next = reader.step_ref("approved_next", true, errors);
            let rejected_next = reader.step_ref("rejected_next", true, errors);
            let on_timeout = reader.step_ref("on_timeout", false, errors);
            let result_var = reader.string("result_var", false, errors);
            Some(StepSpec::Approval(ApprovalStep {
                approver: approver?,
                timeout_seconds,
                approved_next: approved_next?,
                rejected_next: rejected_next?,
                on_timeout,
                result_var,
            }))
        }
        "delay" => {
            let seconds = reader.required_seconds("seconds", errors);
            let next = reader.step_ref("next", false, errors);
            Some(StepSpec::Delay(DelayStep {
                seconds: seconds?,
                next,
            }))
        }
        _ => None,
    }
}

fn parse_action(
    id: &StepId,
    reader: &mut Reader<'_>,
    registry: &ActionRegistry,
    errors: &mut Vec<DefinitionError>,
) -> Option<StepSpec> {
    let action = reader.string("action", true, errors);
    let config = reader.value("config", true, errors);
    let next = reader.step_ref("next", false, errors);
    let on_failure = reader.step_ref("on_failure", false, errors);
    let on_timeout = reader.step_ref("on_timeout", false, errors);
    let condition = reader.expression("condition", false, errors);
    let result_var = reader.string("result_var", false, errors);
    let retry = reader.retry(errors);
    let timeout_seconds = reader.seconds("timeout_seconds", errors);
    let step = ActionStep {
        action: action?,
        config: config?,
        next,
        on_failure,
        on_timeout,
        condition,
        result_var,
        retry,
        timeout_seconds,
    };

    let entry = match registry.lookup(&step.action) {
        Ok(entry) => entry,
        Err(_) => {
            errors.push(DefinitionError::UnknownAction {
                step: id.clone(),
                action: step.action,
            });
            return None;
        }
    };

    let violations = entry.schema.validate_static(&step.config);
    let valid = violations.is_empty();
    for violation in violations {
        errors.push(DefinitionError::Config {
            step: id.clone(),
            message: violation.to_string(),
        });
    }

    let placeholders = placeholder_expressions(&step.config);
    match entry.structural() {
        Some(_) if !valid => None,
        Some(kind) => {
            if !placeholders.is_empty() {
                errors.push(DefinitionError::Config {
                    step: id.clone(),
                    message: format!("config of {} must be static", step.action),
                });
                return None;
            }
            normalize_structural(id, kind, step, errors)
        }
        None => {
            for (path, source) in placeholders {
                let checked = source.and_then(|source| {
                    let expression = Expression::parse(&source)?;
                    expression.check()
                });
                if let Err(error) = checked {
                    errors.push(DefinitionError::Expression {
                        path: format!("steps.{id}.config.{path}"),
                        message: error.to_string(),
                    });
                }
            }
            Some(StepSpec::Action(step))
        }
    }
}

/// Rewrites an action step naming a `flow.*` action into the structural step
/// the runtime executes. The config has already passed the action's schema.
fn normalize_structural(
    id: &StepId,
    kind: StructuralKind,
    step: ActionStep,
    errors: &mut Vec<DefinitionError>,
) -> Option<StepSpec> {
    let path = format!("steps.{id}");
    let reject = |errors: &mut Vec<DefinitionError>, key: &str| {
        errors.push(DefinitionError::InvalidValue {
            path: format!("{path}.{key}"),
            reason: format!("{} does not take '{key}'", step.action),
        });
    };

    if step.condition.is_some() {
        reject(errors, "condition");
    }
    if step.retry.is_some() {
        reject(errors, "retry");
    }
    if step.timeout_seconds.is_some() {
        reject(errors, "timeout_seconds");
    }

    let config_json = step.config.clone();
    let mut config = Reader::object(format!("{path}.config"), &config_json, errors)?;
    match kind {
        StructuralKind::WaitForEvent => {
            if step.on_failure.is_some() {
                reject(errors, "on_failure");
            }
            let event_kind = config.string("event_kind", true, errors);
            let predicate = config.expression("match", false, errors);
            let timeout_seconds = config.timeout(errors);
            Some(StepSpec::WaitForEvent(WaitStep {
                event_kind: event_kind?,
                predicate,
                timeout_seconds,
                next: step.next,
                on_timeout: step.on_timeout,
                result_var: step.result_var,
            }))
        }
        StructuralKind::Approval => {
            let approver = config.value("approver", true, errors);
            let timeout_seconds = config.timeout(errors);
            let missing = |errors: &mut Vec<DefinitionError>, key: &'static str| {
                errors.push(DefinitionError::MissingKey {
                    path: path.clone(),
                    key,
                });
            };
            if step.next.is_none() {
                missing(errors, "next");
            }
            if step.on_failure.is_none() {
                missing(errors, "on_failure");
            }
            Some(StepSpec::Approval(ApprovalStep {
                approver: approver?,
                timeout_seconds,
                approved_next: step.next?,
                rejected_next: step.on_failure?,
                on_timeout: step.on_timeout,
                result_var: step.result_var,
            }))
        }
        StructuralKind::Parallel => {
            for (key, present) in [
                ("on_failure", step.on_failure.is_some()),
                ("on_timeout", step.on_timeout.is_some()),
                ("result_var", step.result_var.is_some()),
            ] {
                if present {
                    reject(errors, key);
                }
            }
            let children = config.step_list("children", errors);
            let mode = config.join_mode(errors);
            if step.next.is_none() {
                errors.push(DefinitionError::MissingKey {
                    path: path.clone(),
                    key: "next",
                });
            }
            Some(StepSpec::Parallel(ParallelStep {
                children: children?,
                join: step.next?,
                mode,
            }))
        }
        StructuralKind::Delay => {
            for (key, present) in [
                ("on_failure", step.on_failure.is_some()),
                ("on_timeout", step.on_timeout.is_some()),
                ("result_var", step.result_var.is_some()),
            ] {
                if present {
                    reject(errors, key);
                }
            }
            let seconds = config.required_seconds("seconds", errors);
            Some(StepSpec::Delay(DelayStep {
                seconds: seconds?,
                next: step.next,
            }))
        }
    }
}

/// Reads keys from one JSON object and remembers which keys were consumed.
struct Reader<'a> {
    path: String,
    map: &'a Map<String, JsonValue>,
    consumed: BTreeSet<&'a str>,
}

impl<'a> Reader<'a> {
    fn object(
        path: String,
        value: &'a JsonValue,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<Self> {
        match value.as_object() {
            Some(map) => Some(Self {
                path,
                map,
                consumed: BTreeSet::new(),
            }),
            None => {
                errors.push(DefinitionError::InvalidValue {
                    path,
                    reason: "expected an object".to_string(),
                });
                None
            }
        }
    }

    fn key_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.path)
        }
    }

    fn take(&mut self, key: &'static str) -> Option<&'a JsonValue> {
        let (name, value) = self.map.get_key_value(key)?;
        self.consumed.insert(name.as_str());
        Some(value).filter(|v| !v.is_null())
    }

    fn invalid(&self, key: &str, reason: &str, errors: &mut Vec<DefinitionError>) {
        errors.push(DefinitionError::InvalidValue {
            path: self.key_path(key),
            reason: reason.to_string(),
        });
    }

    fn value(
        &mut self,
        key: &'static str,
        required: bool,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<JsonValue> {
        let value = self.take(key).cloned();
        if value.is_none() && required {
            errors.push(DefinitionError::MissingKey {
                path: self.path.clone(),
                key,
            });
        }
        value
    }

    fn string(
        &mut self,
        key: &'static str,
        required: bool,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<String> {
        match self.value(key, required, errors)? {
            JsonValue::String(s) if !s.is_empty() => Some(s),
            _ => {
                self.invalid(key, "expected a non-empty string", errors);
                None
            }
        }
    }

    fn step_ref(
        &mut self,
        key: &'static str,
        required: bool,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<StepId> {
        self.string(key, required, errors).map(StepId::from)
    }

    fn step_list(
        &mut self,
        key: &'static str,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<Vec<StepId>> {
        let value = self.value(key, true, errors)?;
        let ids = value.as_array().and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().filter(|s| !s.is_empty()).map(StepId::from))
                .collect::<Option<Vec<_>>>()
        });
        if ids.is_none() {
            self.invalid(key, "expected a list of step ids", errors);
        }
        ids
    }

    fn seconds(&mut self, key: &'static str, errors: &mut Vec<DefinitionError>) -> Option<u64> {
        let value = self.take(key)?;
        let seconds = value.as_u64().filter(|s| *s > 0);
        if seconds.is_none() {
            self.invalid(key, "expected a positive whole number of seconds", errors);
        }
        seconds
    }

    fn required_seconds(
        &mut self,
        key: &'static str,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<u64> {
        if self.map.get(key).is_none_or(JsonValue::is_null) {
            errors.push(DefinitionError::MissingKey {
                path: self.path.clone(),
                key,
            });
            return None;
        }
        self.seconds(key, errors)
    }

    /// Reads `timeout_seconds`, also accepting the shorter `timeout`.
    fn timeout(&mut self, errors: &mut Vec<DefinitionError>) -> Option<u64> {
        let long = self.seconds("timeout_seconds", errors);
        let short = self.seconds("timeout", errors);
        if long.is_some() && short.is_some() {
            self.invalid("timeout", "give either timeout or timeout_seconds", errors);
        }
        long.or(short)
    }

    fn version(&mut self, errors: &mut Vec<DefinitionError>) -> Option<u32> {
        let Some(value) = self.take("version") else {
            errors.push(DefinitionError::MissingKey {
                path: self.path.clone(),
                key: "version",
            });
            return None;
        };
        let version = value.as_u64().and_then(|v| u32::try_from(v).ok());
        if version.is_none() {
            self.invalid("version", "expected a non-negative integer", errors);
        }
        version
    }

    fn expression(
        &mut self,
        key: &'static str,
        required: bool,
        errors: &mut Vec<DefinitionError>,
    ) -> Option<Expression> {
        let source = self.string(key, required, errors)?;
        let parsed = Expression::parse(&source).and_then(|expression| {
            expression.check()?;
            Ok(expression)
        });
        match parsed {
            Ok(expression) => Some(expression),
            Err(error) => {
                errors.push(DefinitionError::Expression {
                    path: self.key_path(key),
                    message: error.to_string(),
                });
                None
            }
        }
    }

    fn join_mode(&mut self, errors: &mut Vec<DefinitionError>) -> JoinMode {
        match self.take("mode").map(JsonValue::as_str) {
            None => JoinMode::All,
            Some(Some("all")) => JoinMode::All,
            Some(Some("first_success")) => JoinMode::FirstSuccess,
            Some(_) => {
                self.invalid("mode", "expected 'all' or 'first_success'", errors);
                JoinMode::All
            }
        }
    }

    fn retry(&mut self, errors: &mut Vec<DefinitionError>) -> Option<RetrySpec> {
        let value = self.take("retry")?;
        match serde_json::from_value::<RetrySpec>(value.clone()) {
            Ok(spec) => {
                let problems = spec.problems();
                for problem in &problems {
                    self.invalid("retry", problem, errors);
                }
                problems.is_empty().then_some(spec)
            }
            Err(e) => {
                self.invalid("retry", &e.to_string(), errors);
                None
            }
        }
    }

    fn finish(self, errors: &mut Vec<DefinitionError>) {
        for key in self.map.keys() {
            if !self.consumed.contains(key.as_str()) {
                errors.push(DefinitionError::UnknownKey {
                    path: self.path.clone(),
                    key: key.clone(),
                });
            }
        }
    }
}
