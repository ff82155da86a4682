//! Step dependency graph.
//!
//! The graph is built once from the full set of step declarations and is
//! immutable afterwards. Nodes live in an arena indexed by declaration order,
//! so a step's index doubles as its declaration position for tie-breaks.
//! Edges point from producer to consumer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::step::{InputRef, StepDecl, StepId};

/// Errors raised while constructing the graph. All of them are fatal and
/// reported before any step runs.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error("step '{step}' references unknown {kind} '{reference}'")]
  UnresolvedInput {
    step: StepId,
    kind: &'static str,
    reference: String,
  },

  #[error("dependency cycle detected: {}", join_path(.path))]
  Cycle { path: Vec<StepId> },

  #[error("duplicate step id '{0}'")]
  DuplicateStep(StepId),

  #[error("step '{0}' declares no outputs and is not terminal")]
  NoOutputs(StepId),
}

fn join_path(path: &[StepId]) -> String {
  path.iter().map(StepId::as_str).collect::<Vec<_>>().join(" -> ")
}

/// A named group of steps, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
  pub name: String,
  pub steps: Vec<usize>,
}

/// Validated, acyclic graph of build steps.
#[derive(Debug)]
pub struct StepGraph {
  graph: DiGraph<StepDecl, ()>,
  by_id: HashMap<StepId, usize>,
  stages: Vec<Stage>,
}

impl StepGraph {
  /// Build and validate the graph.
  ///
  /// References resolve against the whole declaration set, so a reference to
  /// a step declared later is legal as long as no cycle results.
  ///
  /// # Errors
  ///
  /// - `DuplicateStep` if two declarations share an id
  /// - `NoOutputs` if a non-terminal step declares no outputs
  /// - `UnresolvedInput` if a step or stage reference does not exist
  /// - `Cycle` naming the steps on the cycle
  pub fn build(decls: Vec<StepDecl>) -> Result<Self, GraphError> {
    let mut graph = DiGraph::with_capacity(decls.len(), decls.len());
    let mut by_id = HashMap::with_capacity(decls.len());
    let mut stages: Vec<Stage> = Vec::new();

    for decl in decls {
      if by_id.contains_key(&decl.id) {
        return Err(GraphError::DuplicateStep(decl.id));
      }
      if decl.outputs.is_empty() && !decl.terminal {
        return Err(GraphError::NoOutputs(decl.id));
      }

      let id = decl.id.clone();
      let stage = decl.stage.clone();
      let idx = graph.add_node(decl).index();
      by_id.insert(id, idx);

      if let Some(name) = stage {
        match stages.iter_mut().find(|s| s.name == name) {
          Some(existing) => existing.steps.push(idx),
          None => stages.push(Stage { name, steps: vec![idx] }),
        }
      }
    }

    let mut edges: Vec<(usize, usize)> = Vec::new();
    for consumer in graph.node_indices() {
      let decl = &graph[consumer];
      for input in &decl.inputs {
        match input {
          InputRef::Step { id } => {
            let producer = *by_id.get(id).ok_or_else(|| GraphError::UnresolvedInput {
              step: decl.id.clone(),
              kind: "step",
              reference: id.0.clone(),
            })?;
            edges.push((producer, consumer.index()));
          }
          InputRef::Stage { name } => {
            let stage = stages
              .iter()
              .find(|s| &s.name == name)
              .ok_or_else(|| GraphError::UnresolvedInput {
                step: decl.id.clone(),
                kind: "stage",
                reference: name.clone(),
              })?;
            edges.extend(stage.steps.iter().map(|&producer| (producer, consumer.index())));
          }
          InputRef::File { .. } | InputRef::CacheMount { .. } | InputRef::Param { .. } => {}
        }
      }
    }

    for (producer, consumer) in edges {
      graph.update_edge(NodeIndex::new(producer), NodeIndex::new(consumer), ());
    }

    let step_graph = Self { graph, by_id, stages };
    step_graph.verify_acyclic()?;

    debug!(
      steps = step_graph.len(),
      edges = step_graph.graph.edge_count(),
      stages = step_graph.stages.len(),
      "built step graph"
    );

    Ok(step_graph)
  }

  /// Iterative depth-first search tracking the nodes on the current path.
  /// A neighbour already on the path closes a cycle.
  fn verify_acyclic(&self) -> Result<(), GraphError> {
    const UNVISITED: u8 = 0;
    const ON_STACK: u8 = 1;
    const FINISHED: u8 = 2;

    let mut state = vec![UNVISITED; self.len()];

    for root in 0..self.len() {
      if state[root] != UNVISITED {
        continue;
      }

      // (node, its sorted dependents, next dependent to visit)
      let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(root, self.dependents(root), 0)];
      state[root] = ON_STACK;

      while let Some((node, next, cursor)) = stack.last_mut() {
        let Some(&child) = next.get(*cursor) else {
          state[*node] = FINISHED;
          stack.pop();
          continue;
        };
        *cursor += 1;

        match state[child] {
          UNVISITED => {
            state[child] = ON_STACK;
            let dependents = self.dependents(child);
            stack.push((child, dependents, 0));
          }
          ON_STACK => {
            let start = stack.iter().position(|(n, _, _)| *n == child).unwrap_or(0);
            let mut path: Vec<StepId> = stack[start..].iter().map(|(n, _, _)| self.step(*n).id.clone()).collect();
            path.push(self.step(child).id.clone());
            return Err(GraphError::Cycle { path });
          }
          _ => {}
        }
      }
    }

    Ok(())
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// The declaration at `index`. Panics if the index is out of range.
  pub fn step(&self, index: usize) -> &StepDecl {
    &self.graph[NodeIndex::new(index)]
  }

  pub fn index_of(&self, id: &StepId) -> Option<usize> {
    self.by_id.get(id).copied()
  }

  /// All steps in declaration order.
  pub fn steps(&self) -> impl Iterator<Item = (usize, &StepDecl)> {
    self.graph.node_indices().map(|idx| (idx.index(), &self.graph[idx]))
  }

  /// Direct producers of a step, sorted by declaration order.
  pub fn dependencies(&self, index: usize) -> Vec<usize> {
    self.neighbors(index, Direction::Incoming)
  }

  /// Direct consumers of a step, sorted by declaration order.
  pub fn dependents(&self, index: usize) -> Vec<usize> {
    self.neighbors(index, Direction::Outgoing)
  }

  fn neighbors(&self, index: usize, direction: Direction) -> Vec<usize> {
    let mut out: Vec<usize> = self
      .graph
      .neighbors_directed(NodeIndex::new(index), direction)
      .map(NodeIndex::index)
      .collect();
    out.sort_unstable();
    out
  }

  /// Every step that depends on `index`, directly or not, sorted.
  pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut work = self.dependents(index);

    while let Some(next) = work.pop() {
      if seen.insert(next) {
        work.extend(self.dependents(next));
      }
    }

    let mut out: Vec<usize> = seen.into_iter().collect();
    out.sort_unstable();
    out
  }

  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  pub fn stage(&self, name: &str) -> Option<&Stage> {
    self.stages.iter().find(|s| s.name == name)
  }

  /// Position of a stage in declaration order.
  pub fn stage_position(&self, name: &str) -> Option<usize> {
    self.stages.iter().position(|s| s.name == name)
  }

  /// Producers before consumers; ties resolved by declaration order.
  pub fn topological_order(&self) -> Vec<usize> {
    let mut in_degree: Vec<usize> = (0..self.len()).map(|i| self.dependencies(i).len()).collect();
    let mut heap: BinaryHeap<Reverse<usize>> = (0..self.len())
      .filter(|&i| in_degree[i] == 0)
      .map(Reverse)
      .collect();
    let mut order = Vec::with_capacity(self.len());

    while let Some(Reverse(node)) = heap.pop() {
      order.push(node);
      for dependent in self.dependents(node) {
        in_degree[dependent] -= 1;
        if in_degree[dependent] == 0 {
          heap.push(Reverse(dependent));
        }
      }
    }

    order
  }

  /// Groups of steps whose dependencies all lie in earlier groups.
  ///
  /// Only used for display; the scheduler dispatches dynamically.
  pub fn waves(&self) -> Vec<Vec<usize>> {
    let mut level = vec![0usize; self.len()];
    for node in self.topological_order() {
      level[node] = self
        .dependencies(node)
        .iter()
        .map(|&dep| level[dep] + 1)
        .max()
        .unwrap_or(0);
    }

    let depth = level.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut waves = vec![Vec::new(); depth];
    for (node, &l) in level.iter().enumerate() {
      waves[l].push(node);
    }
    waves
  }
}
