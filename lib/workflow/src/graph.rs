//! Step graph checks using petgraph.
//!
//! The graph has one node per step and one edge per transition the runtime
//! can take. Sequence steps contribute an edge to their first child, and each
//! child continues to the next child and finally to the sequence's `next`.

use crate::error::DefinitionError;
use crate::step::{EdgeKind, StepId, StepSpec};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Maps each sequence child to the step that follows it.
pub(crate) fn continuations(steps: &BTreeMap<StepId, StepSpec>) -> BTreeMap<StepId, StepId> {
    let mut continuations = BTreeMap::new();
    for spec in steps.values() {
        let StepSpec::Sequence(sequence) = spec else {
            continue;
        };
        let following = sequence
            .children
            .iter()
            .skip(1)
            .map(Some)
            .chain(std::iter::once(sequence.next.as_ref()));
        for (child, next) in sequence.children.iter().zip(following) {
            if let Some(next) = next {
                continuations.insert(child.clone(), next.clone());
            }
        }
    }
    continuations
}

/// The directed graph of a definition's steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<StepId, EdgeKind>,
    index: HashMap<StepId, NodeIndex>,
}

impl StepGraph {
    /// Builds the graph, leaving out edges to steps that do not exist.
    #[must_use]
    pub fn build(steps: &BTreeMap<StepId, StepSpec>) -> Self {
        let continuations = continuations(steps);
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in steps.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }

        for (id, spec) in steps {
            for (kind, target) in flow_edges(id, spec, &continuations) {
                if let (Some(&from), Some(&to)) = (index.get(id), index.get(target)) {
                    graph.add_edge(from, to, kind);
                }
            }
        }
        Self { graph, index }
    }

    /// Returns the steps directly reachable from `id`.
    #[must_use]
    pub fn successors(&self, id: &StepId) -> Vec<(&StepId, EdgeKind)> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .filter_map(|edge| Some((self.graph.node_weight(edge.target())?, *edge.weight())))
            .collect()
    }

    /// Returns a step on a cycle, if the graph has one.
    #[must_use]
    pub fn cycle(&self) -> Option<&StepId> {
        toposort(&self.graph, None)
            .err()
            .and_then(|cycle| self.graph.node_weight(cycle.node_id()))
    }

    /// Returns every step not reachable from `entry`, in id order.
    #[must_use]
    pub fn unreachable_from(&self, entry: &StepId) -> Vec<&StepId> {
        let Some(&start) = self.index.get(entry) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            seen.insert(node);
        }
        let mut unreachable: Vec<_> = self
            .graph
            .node_indices()
            .filter(|node| !seen.contains(node))
            .filter_map(|node| self.graph.node_weight(node))
            .collect();
        unreachable.sort();
        unreachable
    }
}

fn flow_edges<'a>(
    id: &StepId,
    spec: &'a StepSpec,
    continuations: &'a BTreeMap<StepId, StepId>,
) -> Vec<(EdgeKind, &'a StepId)> {
    match spec {
        StepSpec::Sequence(sequence) => sequence
            .children
            .first()
            .map(|first| vec![(EdgeKind::Child, first)])
            .unwrap_or_default(),
        StepSpec::Action(_) | StepSpec::WaitForEvent(_) | StepSpec::Delay(_)
            if spec.next().is_none() =>
        {
            let mut edges = spec.edges();
            if let Some(next) = continuations.get(id) {
                edges.push((EdgeKind::Next, next));
            }
            edges
        }
        _ => spec.edges(),
    }
}

/// Checks every structural invariant of a step map.
///
/// `known` holds every step id in the document, including steps that failed
/// to parse, so references to them are not reported twice.
#[must_use]
pub fn validate(
    entry: &StepId,
    steps: &BTreeMap<StepId, StepSpec>,
    known: &BTreeSet<StepId>,
) -> Vec<DefinitionError> {
    let mut errors = Vec::new();

    if !steps.contains_key(entry) && !known.contains(entry) {
        errors.push(DefinitionError::EntryMissing {
            entry: entry.clone(),
        });
    }

    for (id, spec) in steps {
        for (_, target) in spec.edges() {
            if !known.contains(target) {
                errors.push(DefinitionError::MissingStep {
                    from: id.clone(),
                    to: target.clone(),
                });
            }
        }
    }

    check_sequences(steps, &mut errors);
    check_forks(steps, &mut errors);

    let graph = StepGraph::build(steps);
    if let Some(step) = graph.cycle() {
        errors.push(DefinitionError::Cycle { step: step.clone() });
        return errors;
    }

    if steps.contains_key(entry) {
        for step in graph.unreachable_from(entry) {
            errors.push(DefinitionError::Unreachable { step: step.clone() });
        }
    }

    for (id, spec) in steps {
        if let StepSpec::Parallel(parallel) = spec {
            check_branches(&graph, id, &parallel.children, &parallel.join, steps, &mut errors);
        }
    }

    errors
}

fn check_sequences(steps: &BTreeMap<StepId, StepSpec>, errors: &mut Vec<DefinitionError>) {
    let mut owner: BTreeMap<&StepId, &StepId> = BTreeMap::new();
    for (id, spec) in steps {
        let StepSpec::Sequence(sequence) = spec else {
            continue;
        };
        if sequence.children.is_empty() {
            errors.push(DefinitionError::EmptyChildren { step: id.clone() });
        }
        for child in &sequence.children {
            let problem = |reason: &str| DefinitionError::SequenceChild {
                sequence: id.clone(),
                child: child.clone(),
                reason: reason.to_string(),
            };
            if let Some(previous) = owner.insert(child, id) {
                errors.push(problem(&format!("already a child of sequence '{previous}'")));
                continue;
            }
            match steps.get(child) {
                Some(StepSpec::Action(_) | StepSpec::WaitForEvent(_) | StepSpec::Delay(_)) => {
                    if steps.get(child).and_then(StepSpec::next).is_some() {
                        errors.push(problem("a sequence child must not declare 'next'"));
                    }
                }
                Some(other) => errors.push(problem(&format!(
                    "a {} step cannot be a sequence child",
                    other.kind()
                ))),
                None => {}
            }
        }
    }
}

fn check_forks(steps: &BTreeMap<StepId, StepSpec>, errors: &mut Vec<DefinitionError>) {
    for (id, spec) in steps {
        let StepSpec::Parallel(parallel) = spec else {
            continue;
        };
        if parallel.children.is_empty() {
            errors.push(DefinitionError::EmptyChildren { step: id.clone() });
        }
        if parallel.children.contains(&parallel.join) {
            errors.push(DefinitionError::InvalidValue {
                path: format!("steps.{id}.join"),
                reason: "the join must not be one of the children".to_string(),
            });
        }
        let distinct: BTreeSet<_> = parallel.children.iter().collect();
        if distinct.len() != parallel.children.len() {
            errors.push(DefinitionError::InvalidValue {
                path: format!("steps.{id}.children"),
                reason: "children must be distinct".to_string(),
            });
        }
    }
}

/// Walks each branch of a fork up to the join.
///
/// A branch that reaches a step with no way forward never joins; a step
/// reached from two branches would let them write the same variables.
fn check_branches(
    graph: &StepGraph,
    fork: &StepId,
    children: &[StepId],
    join: &StepId,
    steps: &BTreeMap<StepId, StepSpec>,
    errors: &mut Vec<DefinitionError>,
) {
    let mut owner: HashMap<&StepId, &StepId> = HashMap::new();
    let mut shared = BTreeSet::new();

    for child in children {
        if !steps.contains_key(child) || child == join {
            continue;
        }
        let mut stack = vec![child];
        let mut visited = BTreeSet::new();
        let mut joins = true;
        while let Some(step) = stack.pop() {
            if step == join || !visited.insert(step) {
                continue;
            }
            match owner.get(step) {
                Some(other) if *other != child => {
                    shared.insert(step.clone());
                    continue;
                }
                _ => {
                    owner.insert(step, child);
                }
            }
            let successors = graph.successors(step);
            if successors.is_empty() && steps.contains_key(step) {
                joins = false;
            }
            stack.extend(successors.into_iter().map(|(next, _)| next));
        }
        if !joins {
            errors.push(DefinitionError::BranchNeverJoins {
                fork: fork.clone(),
                child: child.clone(),
            });
        }
    }

    for step in shared {
        errors.push(DefinitionError::SharedBranchStep {
            fork: fork.clone(),
            step,
        });
    }
}
