//! Dependency graph and topological ordering
//!
//! Nodes are the module classes of one batch, stored in an index arena.
//! Edges run from a dependency to its dependent and only connect modules of
//! the same batch; dependencies outside the batch are left for the
//! instantiation pipeline to resolve against running modules.

use std::collections::{HashMap, VecDeque};

use sideload_kernel::ModuleTypeId;
use thiserror::Error;
use tracing::debug;

use crate::scanner::ModuleClass;

/// The batch contains at least one dependency cycle
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Graph has at least one cycle: {}", format_members(.members))]
pub struct CycleError {
    /// Modules lying on a cycle
    pub members: Vec<ModuleTypeId>,
}

fn format_members(members: &[ModuleTypeId]) -> String {
    members
        .iter()
        .map(ModuleTypeId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Directed dependency graph over one batch of module classes
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<ModuleClass>,
    successors: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph for a batch
    pub fn build(classes: Vec<ModuleClass>) -> Self {
        let mut index: HashMap<ModuleTypeId, usize> = HashMap::with_capacity(classes.len());
        for (i, class) in classes.iter().enumerate() {
            index.entry(class.type_id().clone()).or_insert(i);
        }

        let mut successors = vec![Vec::new(); classes.len()];
        let mut in_degree = vec![0; classes.len()];

        for (i, class) in classes.iter().enumerate() {
            for dependency in class.dependencies() {
                match index.get(dependency) {
                    Some(&from) => {
                        // A repeated dependency declaration adds a single edge
                        if !successors[from].contains(&i) {
                            successors[from].push(i);
                            in_degree[i] += 1;
                        }
                    }
                    None => debug!(
                        "Dependency {} of {} is outside the batch",
                        dependency,
                        class.type_id()
                    ),
                }
            }
        }

        Self {
            nodes: classes,
            successors,
            in_degree,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ModuleClass] {
        &self.nodes
    }

    /// Every edge as (dependency, dependent)
    pub fn edges(&self) -> impl Iterator<Item = (&ModuleTypeId, &ModuleTypeId)> {
        self.successors.iter().enumerate().flat_map(move |(from, tos)| {
            tos.iter()
                .map(move |&to| (self.nodes[from].type_id(), self.nodes[to].type_id()))
        })
    }

    /// Whether the graph contains a cycle
    pub fn has_cycle(&self) -> bool {
        self.kahn_order().len() != self.nodes.len()
    }

    /// Modules lying on a cycle, empty for an acyclic graph
    pub fn cycle_members(&self) -> Vec<ModuleTypeId> {
        let order = self.kahn_order();
        if order.len() == self.nodes.len() {
            return Vec::new();
        }

        // Peel the leftover nodes that only lead out of the cycles
        let mut remaining = vec![true; self.nodes.len()];
        for &i in &order {
            remaining[i] = false;
        }
        loop {
            let removable: Vec<usize> = (0..self.nodes.len())
                .filter(|&i| remaining[i])
                .filter(|&i| !self.successors[i].iter().any(|&s| remaining[s]))
                .collect();
            if removable.is_empty() {
                break;
            }
            for i in removable {
                remaining[i] = false;
            }
        }

        (0..self.nodes.len())
            .filter(|&i| remaining[i])
            .map(|i| self.nodes[i].type_id().clone())
            .collect()
    }

    /// Order the batch so every dependency precedes its dependents
    ///
    /// Siblings come out in no particular guaranteed order.
    pub fn topological_sort(self) -> Result<Vec<ModuleClass>, CycleError> {
        let order = self.kahn_order();
        if order.len() != self.nodes.len() {
            return Err(CycleError {
                members: self.cycle_members(),
            });
        }

        let mut slots: Vec<Option<ModuleClass>> = self.nodes.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    fn kahn_order(&self) -> Vec<usize> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &self.successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        order
    }
}
