//! Dependency graph - "depends on" edges between tasks.
//!
//! Ownership (parent/child) is tracked on the tasks themselves; this graph
//! only holds dependency references and must stay acyclic.

use std::collections::{BTreeMap, BTreeSet};

use super::task::TaskId;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// task -> tasks it depends on
    dependencies: BTreeMap<TaskId, BTreeSet<TaskId>>,
    /// task -> tasks depending on it
    dependents: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn add_node(&mut self, id: TaskId) {
        self.dependents.entry(id.clone()).or_default();
        self.dependencies.entry(id).or_default();
    }

    /// Adds `task -> dependency` without checking for cycles.
    pub fn add_edge(&mut self, task: &TaskId, dependency: &TaskId) {
        self.dependencies
            .entry(task.clone())
            .or_default()
            .insert(dependency.clone());
        self.dependents
            .entry(dependency.clone())
            .or_default()
            .insert(task.clone());
    }

    /// Returns the cycle `task -> dependency -> ... -> task` the edge would
    /// close, if any.
    pub fn cycle_with(&self, task: &TaskId, dependency: &TaskId) -> Option<Vec<TaskId>> {
        if task == dependency {
            return Some(vec![task.clone(), task.clone()]);
        }
        let mut path = self.path(dependency, task)?;
        path.insert(0, task.clone());
        Some(path)
    }

    /// Checks a set of new edges as if added in order. The graph is unchanged.
    pub fn check_edges<'a>(
        &self,
        edges: impl IntoIterator<Item = (&'a TaskId, &'a TaskId)>,
    ) -> Result<(), Vec<TaskId>> {
        let mut scratch = self.clone();
        for (task, dependency) in edges {
            if let Some(cycle) = scratch.cycle_with(task, dependency) {
                return Err(cycle);
            }
            scratch.add_edge(task, dependency);
        }
        Ok(())
    }

    /// Depth-first search along dependency edges from `from` to `to`.
    fn path(&self, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![(from.clone(), vec![from.clone()])];

        while let Some((node, path)) = stack.pop() {
            if &node == to {
                return Some(path);
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(next) = self.dependencies.get(&node) {
                for dep in next.iter().rev() {
                    if !visited.contains(dep) {
                        let mut extended = path.clone();
                        extended.push(dep.clone());
                        stack.push((dep.clone(), extended));
                    }
                }
            }
        }
        None
    }

    pub fn dependencies(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    pub fn dependents(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, id: &TaskId) {
        if let Some(deps) = self.dependencies.remove(id) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(id);
                }
            }
        }
        if let Some(users) = self.dependents.remove(id) {
            for user in users {
                if let Some(set) = self.dependencies.get_mut(&user) {
                    set.remove(id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}
