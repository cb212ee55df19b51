//! The rule graph.
//!
//! Rules are registered once and never change afterwards. Edges point from a
//! dependency to its dependent and cover both declared and extra
//! dependencies, since both constrain build order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::rule::Rule;
use crate::target::Target;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("{dependent} depends on unknown target {missing}")]
  MissingDependency { dependent: Target, missing: Target },

  #[error("dependency cycle: {}", format_cycle(.cycle))]
  CyclicDependency { cycle: Vec<Target> },

  #[error("target {0} is already defined")]
  DuplicateTarget(Target),

  #[error("unknown target {0}")]
  UnknownTarget(Target),
}

fn format_cycle(cycle: &[Target]) -> String {
  cycle.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" -> ")
}

#[derive(Debug, Default)]
pub struct RuleGraph {
  graph: DiGraph<Target, ()>,
  nodes: HashMap<Target, NodeIndex>,
  rules: HashMap<Target, Arc<Rule>>,
}

impl RuleGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a rule whose dependencies are all registered already.
  ///
  /// Graphs assembled this way are acyclic by construction.
  pub fn add_rule(&mut self, rule: Rule) -> Result<(), GraphError> {
    if self.nodes.contains_key(rule.target()) {
      return Err(GraphError::DuplicateTarget(rule.target().clone()));
    }
    if let Some(missing) = rule.all_deps().find(|dep| !self.nodes.contains_key(*dep)) {
      return Err(GraphError::MissingDependency {
        dependent: rule.target().clone(),
        missing: missing.clone(),
      });
    }
    self.insert(rule);
    Ok(())
  }

  /// Register a batch of rules in any order.
  ///
  /// Dependencies may refer to any rule in the batch, so the result can
  /// contain cycles; they surface from [`RuleGraph::transitive_closure`] and
  /// [`RuleGraph::topological_order`].
  pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Result<Self, GraphError> {
    let mut pending = Vec::new();
    let mut known = BTreeSet::new();
    for rule in rules {
      if !known.insert(rule.target().clone()) {
        return Err(GraphError::DuplicateTarget(rule.target().clone()));
      }
      pending.push(rule);
    }

    for rule in &pending {
      if let Some(missing) = rule.all_deps().find(|dep| !known.contains(*dep)) {
        return Err(GraphError::MissingDependency {
          dependent: rule.target().clone(),
          missing: missing.clone(),
        });
      }
    }

    let mut graph = Self::new();
    for rule in &pending {
      let idx = graph.graph.add_node(rule.target().clone());
      graph.nodes.insert(rule.target().clone(), idx);
    }
    for rule in pending {
      graph.connect(&rule);
      graph.rules.insert(rule.target().clone(), Arc::new(rule));
    }
    Ok(graph)
  }

  fn insert(&mut self, rule: Rule) {
    let idx = self.graph.add_node(rule.target().clone());
    self.nodes.insert(rule.target().clone(), idx);
    self.connect(&rule);
    self.rules.insert(rule.target().clone(), Arc::new(rule));
  }

  fn connect(&mut self, rule: &Rule) {
    let dependent = self.nodes[rule.target()];
    for dep in rule.all_deps() {
      let dependency = self.nodes[dep];
      self.graph.add_edge(dependency, dependent, ());
    }
  }

  pub fn get_rule(&self, target: &Target) -> Option<&Arc<Rule>> {
    self.rules.get(target)
  }

  pub fn contains(&self, target: &Target) -> bool {
    self.rules.contains_key(target)
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Direct dependents of `target`.
  pub fn dependents(&self, target: &Target) -> Vec<&Target> {
    let Some(&idx) = self.nodes.get(target) else {
      return Vec::new();
    };
    let mut dependents: Vec<&Target> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|n| &self.graph[n])
      .collect();
    dependents.sort();
    dependents.dedup();
    dependents
  }

  /// Every target reachable from `targets` through dependency edges,
  /// including `targets` themselves.
  ///
  /// Walks depth-first keeping the current path; reaching a target already
  /// on the path fails with the cycle it closes.
  pub fn transitive_closure(&self, targets: &[Target]) -> Result<BTreeSet<Target>, GraphError> {
    let mut done = BTreeSet::new();
    for target in targets {
      if !self.contains(target) {
        return Err(GraphError::UnknownTarget(target.clone()));
      }
      self.visit(target, &mut done)?;
    }
    Ok(done)
  }

  fn visit<'a>(&'a self, root: &'a Target, done: &mut BTreeSet<Target>) -> Result<(), GraphError> {
    if done.contains(root) {
      return Ok(());
    }

    // `path[i]` still has `remaining[i]` to visit, popped from the back.
    let mut path: Vec<&'a Target> = vec![root];
    let mut remaining: Vec<Vec<&'a Target>> = vec![self.deps_to_visit(root)];
    let mut on_path: HashSet<&'a Target> = HashSet::from([root]);

    while let Some(deps) = remaining.last_mut() {
      match deps.pop() {
        Some(dep) if done.contains(dep) => {}
        Some(dep) if on_path.contains(&dep) => {
          let start = path.iter().position(|t| *t == dep).unwrap_or(0);
          let mut cycle: Vec<Target> = path[start..].iter().map(|t| (*t).clone()).collect();
          cycle.push(dep.clone());
          return Err(GraphError::CyclicDependency { cycle });
        }
        Some(dep) => {
          path.push(dep);
          on_path.insert(dep);
          remaining.push(self.deps_to_visit(dep));
        }
        None => {
          remaining.pop();
          if let Some(finished) = path.pop() {
            on_path.remove(finished);
            done.insert(finished.clone());
          }
        }
      }
    }
    Ok(())
  }

  /// Dependencies of `target` in reverse, so popping yields declaration order.
  fn deps_to_visit(&self, target: &Target) -> Vec<&Target> {
    let mut deps: Vec<&Target> = match self.rules.get(target) {
      Some(rule) => rule.all_deps().collect(),
      None => Vec::new(),
    };
    deps.reverse();
    deps
  }

  /// All targets, dependencies before dependents.
  pub fn topological_order(&self) -> Result<Vec<Target>, GraphError> {
    match toposort(&self.graph, None) {
      Ok(sorted) => Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect()),
      Err(cycle) => {
        let start = self.graph[cycle.node_id()].clone();
        // The closure walk names the full cycle through `start`.
        match self.transitive_closure(std::slice::from_ref(&start)) {
          Err(err) => Err(err),
          Ok(_) => Err(GraphError::CyclicDependency {
            cycle: vec![start.clone(), start],
          }),
        }
      }
    }
  }
}
