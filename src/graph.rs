//! # Dependency Graph
//!
//! Explicit graph over reconciliation units and their `dependsOn` edges,
//! built once at load time, validated once, queried repeatedly. A cycle is a
//! configuration error at startup, never a runtime retry condition.
//!
//! Topological order ties are broken by declaration order so the reconcile
//! order is reproducible across runs.

use crate::unit::{ConfigurationError, ReconciliationUnit, UnitId};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

#[derive(Debug)]
pub struct DependencyGraph {
    /// Dependencies per unit (edges point at prerequisites)
    dependencies: HashMap<UnitId, Vec<UnitId>>,
    /// Reverse edges: units blocked by the key
    dependents: HashMap<UnitId, Vec<UnitId>>,
    /// Valid topological order, dependencies first
    order: Vec<UnitId>,
}

impl DependencyGraph {
    /// Build and validate the graph. Fails fast with
    /// [`ConfigurationError::DependencyCycle`] naming the cycle members.
    pub fn build(units: &[ReconciliationUnit]) -> Result<Self, ConfigurationError> {
        let declaration_order: HashMap<&UnitId, usize> = units
            .iter()
            .map(|u| (&u.id, u.declaration_index))
            .collect();

        let mut dependencies: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        let mut dependents: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        let mut indegree: HashMap<&UnitId, usize> = HashMap::new();

        for unit in units {
            dependencies.insert(unit.id.clone(), unit.depends_on.clone());
            dependents.entry(unit.id.clone()).or_default();
            indegree.insert(&unit.id, unit.depends_on.len());
        }

        for unit in units {
            for dependency in &unit.depends_on {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(unit.id.clone());
            }
        }

        // Kahn's algorithm; the ready set is ordered by declaration index so
        // ties resolve deterministically
        let mut ready: BTreeSet<(usize, UnitId)> = units
            .iter()
            .filter(|u| u.depends_on.is_empty())
            .map(|u| (u.declaration_index, u.id.clone()))
            .collect();

        let mut order = Vec::with_capacity(units.len());

        while let Some((_, id)) = ready.pop_first() {
            for dependent in dependents.get(&id).into_iter().flatten() {
                let Some(degree) = indegree.get_mut(dependent) else {
                    continue;
                };
                *degree -= 1;
                if *degree == 0 {
                    if let Some(&index) = declaration_order.get(dependent) {
                        ready.insert((index, dependent.clone()));
                    }
                }
            }
            order.push(id);
        }

        if order.len() < units.len() {
            let ordered: HashSet<&UnitId> = order.iter().collect();
            let remaining: Vec<&UnitId> = units
                .iter()
                .map(|u| &u.id)
                .filter(|id| !ordered.contains(id))
                .collect();
            return Err(ConfigurationError::DependencyCycle(find_cycle(
                &remaining,
                &dependencies,
            )));
        }

        debug!(units = order.len(), "dependency graph validated");

        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    /// Valid topological order over all units, dependencies first.
    /// Deterministic across repeated calls on the same input.
    pub fn reconcile_order(&self) -> &[UnitId] {
        &self.order
    }

    /// A unit is ready to reconcile when every dependency satisfies the
    /// given predicate (the caller supplies "status is Ready"). A unit with
    /// no dependencies is immediately eligible.
    pub fn is_ready<F>(&self, id: &UnitId, dependency_ready: F) -> bool
    where
        F: Fn(&UnitId) -> bool,
    {
        self.dependencies
            .get(id)
            .map(|deps| deps.iter().all(dependency_ready))
            .unwrap_or(true)
    }

    pub fn dependencies(&self, id: &UnitId) -> &[UnitId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &UnitId) -> &[UnitId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Walk dependency edges restricted to the unordered remainder until a node
/// repeats; the repeated segment is a cycle.
fn find_cycle(remaining: &[&UnitId], dependencies: &HashMap<UnitId, Vec<UnitId>>) -> Vec<UnitId> {
    let remaining_set: HashSet<&UnitId> = remaining.iter().copied().collect();

    let Some(start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<UnitId> = Vec::new();
    let mut seen: HashMap<UnitId, usize> = HashMap::new();
    let mut current = (*start).clone();

    loop {
        if let Some(&position) = seen.get(&current) {
            return path[position..].to_vec();
        }
        seen.insert(current.clone(), path.len());
        path.push(current.clone());

        let next = dependencies
            .get(&current)
            .into_iter()
            .flatten()
            .find(|d| remaining_set.contains(d));

        match next {
            Some(dependency) => current = dependency.clone(),
            // Every remaining node sits on or leads into a cycle; running
            // out of in-remainder edges means the path itself closed
            None => return path,
        }
    }
}
