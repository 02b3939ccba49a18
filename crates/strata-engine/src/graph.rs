//! Graph preprocessing: id normalization, `$prev` expansion, and validation.
//!
//! Everything here runs once, before an execution context exists. The output
//! is a workflow whose step ids are unique and whose input mappings only name
//! concrete steps or global variables.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use strata_core::error::{Result, StrataError};
use strata_core::workflow::{StepConfig, StepKind, WorkflowDefinition, PREV_PLACEHOLDER};

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap())
}

/// Lowercase slug with runs of non-alphanumerics collapsed to `_`.
pub fn slugify(name: &str) -> String {
    let lower = name.to_lowercase();
    let slug = slug_pattern().replace_all(&lower, "_");
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "step".to_string()
    } else {
        slug.to_string()
    }
}

/// Assign missing step ids and de-duplicate dependency lists.
///
/// Explicit ids are kept as written and must be unique. Generated ids come
/// from the step name, from `<type>_<n>` when unnamed, or are `trigger` for
/// trigger steps; collisions get `_2`, `_3`, ... suffixes.
pub fn normalize(def: &mut WorkflowDefinition) -> Result<()> {
    let mut used: HashSet<String> = HashSet::new();
    for step in def.steps.iter().filter(|s| !s.step_id.is_empty()) {
        if !used.insert(step.step_id.clone()) {
            return Err(StrataError::Validation(format!(
                "duplicate step id '{}'",
                step.step_id
            )));
        }
    }

    for (idx, step) in def.steps.iter_mut().enumerate() {
        if step.step_id.is_empty() {
            let base = if step.kind == StepKind::Trigger {
                "trigger".to_string()
            } else {
                match step.name.as_deref() {
                    Some(name) if !name.trim().is_empty() => slugify(name),
                    _ => format!("{}_{}", step.kind, idx + 1),
                }
            };
            let mut candidate = base.clone();
            let mut n = 2;
            while used.contains(&candidate) {
                candidate = format!("{}_{}", base, n);
                n += 1;
            }
            used.insert(candidate.clone());
            step.step_id = candidate;
        }

        let mut seen = HashSet::new();
        step.dependencies.retain(|d| seen.insert(d.clone()));
    }
    Ok(())
}

/// Replace `$prev` placeholders with the step's single dependency.
pub fn expand_prev(steps: &mut [StepConfig]) -> Result<()> {
    for step in steps.iter_mut() {
        let uses_prev = step.input_mapping.values().any(|v| is_prev_ref(v))
            || nested_mapping_uses_prev(step);
        if !uses_prev {
            continue;
        }
        if step.dependencies.len() != 1 {
            return Err(StrataError::Validation(format!(
                "step '{}' uses {} but has {} dependencies (exactly one required)",
                step.step_id,
                PREV_PLACEHOLDER,
                step.dependencies.len()
            )));
        }
        let prev = step.dependencies[0].clone();

        for source in step.input_mapping.values_mut() {
            if let Some(expanded) = expand_ref(source, &prev) {
                *source = expanded;
            }
        }
        if let Some(serde_json::Value::Object(nested)) = step.parameters.get_mut("input_mapping") {
            for value in nested.values_mut() {
                if let Some(expanded) = value.as_str().and_then(|s| expand_ref(s, &prev)) {
                    *value = serde_json::Value::String(expanded);
                }
            }
        }
    }
    Ok(())
}

fn is_prev_ref(source: &str) -> bool {
    source == PREV_PLACEHOLDER || source.starts_with("$prev.")
}

fn nested_mapping_uses_prev(step: &StepConfig) -> bool {
    step.parameters
        .get("input_mapping")
        .and_then(|v| v.as_object())
        .is_some_and(|m| m.values().filter_map(|v| v.as_str()).any(is_prev_ref))
}

fn expand_ref(source: &str, prev: &str) -> Option<String> {
    if source == PREV_PLACEHOLDER {
        Some(prev.to_string())
    } else {
        source
            .strip_prefix("$prev.")
            .map(|path| format!("{}.{}", prev, path))
    }
}

/// `step_id -> declared dependencies`.
pub fn dependency_graph(steps: &[StepConfig]) -> HashMap<String, Vec<String>> {
    steps
        .iter()
        .map(|s| (s.step_id.clone(), s.dependencies.clone()))
        .collect()
}

/// Structural checks on a normalized step list.
pub fn validate(steps: &[StepConfig]) -> Result<()> {
    if steps.is_empty() {
        return Err(StrataError::Validation("workflow has no steps".into()));
    }

    let mut ids = HashSet::new();
    for step in steps {
        if step.step_id.is_empty() {
            return Err(StrataError::Validation("step without an id".into()));
        }
        if !ids.insert(step.step_id.as_str()) {
            return Err(StrataError::Validation(format!(
                "duplicate step id '{}'",
                step.step_id
            )));
        }
    }

    let triggers: Vec<&StepConfig> = steps.iter().filter(|s| s.kind == StepKind::Trigger).collect();
    if triggers.len() > 1 {
        return Err(StrataError::Validation(format!(
            "workflow has {} trigger steps (at most one allowed)",
            triggers.len()
        )));
    }
    if let Some(trigger) = triggers.first() {
        if !trigger.dependencies.is_empty() {
            return Err(StrataError::Validation(format!(
                "trigger step '{}' cannot have dependencies",
                trigger.step_id
            )));
        }
    }

    for step in steps {
        for dep in &step.dependencies {
            if dep == &step.step_id {
                return Err(StrataError::Validation(format!(
                    "step '{}' depends on itself",
                    step.step_id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(StrataError::Validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.step_id, dep
                )));
            }
        }
        if step.kind == StepKind::Merge {
            step.merge_mode()?;
        }
        if step.effective_input_mapping().values().any(|v| is_prev_ref(v)) {
            return Err(StrataError::Validation(format!(
                "step '{}' still contains an unexpanded {}",
                step.step_id, PREV_PLACEHOLDER
            )));
        }
    }

    if let Some(cycle) = find_cycle(&dependency_graph(steps), steps) {
        return Err(StrataError::Validation(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn find_cycle(graph: &HashMap<String, Vec<String>>, steps: &[StepConfig]) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = graph.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
    let mut path: Vec<String> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        graph: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(node).copied() {
            Some(Mark::Done) | None => return None,
            Some(Mark::InProgress) => {
                let start = path.iter().position(|p| p == node).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            Some(Mark::Unvisited) => {}
        }
        marks.insert(node, Mark::InProgress);
        path.push(node.to_string());
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if let Some(cycle) = visit(dep, graph, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    // Walk in declaration order so the reported cycle is stable.
    for step in steps {
        if let Some(cycle) = visit(step.step_id.as_str(), graph, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Normalize, expand, and validate a workflow in one pass.
pub fn prepare(mut def: WorkflowDefinition) -> Result<WorkflowDefinition> {
    normalize(&mut def)?;
    expand_prev(&mut def.steps)?;
    validate(&def.steps)?;
    Ok(def)
}
