use crate::id::ObjectId;
use crate::value::Record;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while building the dependency graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Object graphs are reference-acyclic by construction; a cycle means
    /// corrupted storage or a writer bug.
    #[error("cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<ObjectId> },
}

fn format_cycle(cycle: &[ObjectId]) -> String {
    let mut out = String::new();
    for id in cycle {
        let _ = write!(out, "{id} -> ");
    }
    match cycle.first() {
        Some(first) => {
            let _ = write!(out, "{first}");
        }
        None => out.push_str("<empty>"),
    }
    out
}

/// Every identity referenced by `record`.
pub fn extract_references(record: &Record) -> BTreeSet<ObjectId> {
    record.references()
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Directed "object depends on object" graph over identities.
///
/// Nodes are kept in a `BTreeMap` so every ordering the graph produces is
/// deterministic for a given input.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// node -> identities its record references.
    dependencies: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for a set of records and validate it is acyclic.
    ///
    /// Referenced identities without a record of their own (typically
    /// objects already resident in the cache) become leaf nodes.
    pub fn from_records<'a, I>(records: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (&'a ObjectId, &'a Record)>,
    {
        let mut graph = Self::new();
        for (id, record) in records {
            graph.add_dependencies(*id, extract_references(record));
        }
        graph.validate()?;
        Ok(graph)
    }

    pub fn add_node(&mut self, id: ObjectId) {
        self.dependencies.entry(id).or_default();
    }

    /// Add an edge `owner -> dep` for every `dep`.
    pub fn add_dependencies(&mut self, owner: ObjectId, deps: impl IntoIterator<Item = ObjectId>) {
        let deps: Vec<ObjectId> = deps.into_iter().collect();
        for dep in &deps {
            self.add_node(*dep);
        }
        self.dependencies.entry(owner).or_default().extend(deps);
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.dependencies.contains_key(&id)
    }

    pub fn dependencies_of(&self, id: ObjectId) -> impl Iterator<Item = ObjectId> + '_ {
        self.dependencies.get(&id).into_iter().flatten().copied()
    }

    pub fn node_count(&self) -> usize {
        self.dependencies.len()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.dependencies.keys().copied()
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order().map(|_| ())
    }

    /// Dependencies-first order: every identity appears after everything it
    /// references. Kahn's algorithm, O(V+E).
    pub fn topological_order(&self) -> Result<Vec<ObjectId>, GraphError> {
        // Outstanding dependency count per node, plus the reverse edges.
        let mut pending: BTreeMap<ObjectId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<ObjectId, Vec<ObjectId>> = BTreeMap::new();
        for (&node, deps) in &self.dependencies {
            pending.insert(node, deps.len());
            for &dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut queue: VecDeque<ObjectId> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.dependencies.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &dependent in dependents.get(&node).into_iter().flatten() {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.dependencies.len() {
            let stuck: BTreeSet<ObjectId> = pending
                .into_iter()
                .filter(|&(_, count)| count > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(GraphError::CyclicDependency {
                cycle: self.find_cycle(&stuck),
            });
        }
        Ok(order)
    }

    /// Walk unresolved nodes until one repeats. Every unresolved node has at
    /// least one unresolved dependency, so the walk always closes a cycle.
    fn find_cycle(&self, stuck: &BTreeSet<ObjectId>) -> Vec<ObjectId> {
        let Some(&start) = stuck.iter().next() else {
            return Vec::new();
        };
        let mut path: Vec<ObjectId> = Vec::new();
        let mut position: BTreeMap<ObjectId, usize> = BTreeMap::new();
        let mut current = start;
        loop {
            if let Some(&at) = position.get(&current) {
                return path.split_off(at);
            }
            position.insert(current, path.len());
            path.push(current);
            match self.dependencies_of(current).find(|dep| stuck.contains(dep)) {
                Some(next) => current = next,
                None => return path,
            }
        }
    }
}
