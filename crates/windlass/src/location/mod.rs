//! Execution-tree addressing
//!
//! Every durable operation (step, sleep, loop iteration, branch) has exactly
//! one [`Location`]: the path of names leading to it from the workflow root.
//! Locations are the primary key for history lookups, so identical workflow
//! code replaying against identical history must produce identical locations.
//!
//! To keep locations compact, names are interned once per workflow in a
//! [`NameRegistry`] and locations store integer indices instead of strings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Index into the per-workflow [`NameRegistry`].
pub type NameIndex = u32;

/// Width of the zero-padded iteration component in rendered keys.
///
/// Padding makes lexicographic key order agree with numeric iteration order,
/// which the engine relies on for child enumeration and loop trimming.
pub const ITERATION_KEY_WIDTH: usize = 8;

/// One segment of a [`Location`] path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathSegment {
    /// A named child (step, sleep, branch, loop base, ...).
    Name { name: NameIndex },

    /// One iteration of a named loop.
    Loop { name: NameIndex, iteration: u64 },
}

/// Path address of an operation within a workflow's execution tree.
///
/// Immutable once assigned; child locations are derived by appending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location(Vec<PathSegment>);

impl Location {
    /// The workflow root (empty path).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Derive the child location for a named operation.
    pub fn child(&self, name: NameIndex) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Name { name });
        Self(segments)
    }

    /// Derive the child location for one loop iteration.
    pub fn child_iteration(&self, name: NameIndex, iteration: u64) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Loop { name, iteration });
        Self(segments)
    }

    /// Segment-wise prefix test.
    ///
    /// A `Name` segment matches only an equal `Name`; a `Loop` segment matches
    /// only a `Loop` with equal name and iteration. The empty location is a
    /// prefix of everything.
    pub fn is_prefix_of(&self, other: &Location) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }
}

/// Per-workflow append-only name interner.
///
/// `register` returns the existing index when a name was seen before, so a
/// name used across thousands of loop iterations is stored exactly once.
/// A hash map side index keeps lookup O(1) while the array preserves the
/// index → name mapping reloaded from storage.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: Vec<String>,
    index: HashMap<String, NameIndex>,
}

impl NameRegistry {
    /// Empty registry for a fresh workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from names loaded in index order.
    pub fn from_names(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as NameIndex))
            .collect();
        Self { names, index }
    }

    /// Intern `name`, returning its stable index. Idempotent per name.
    pub fn register(&mut self, name: &str) -> NameIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len() as NameIndex;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Resolve an index back to its name.
    pub fn resolve(&self, idx: NameIndex) -> Option<&str> {
        self.names.get(idx as usize).map(String::as_str)
    }

    /// Number of interned names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no names are interned yet.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All names in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Render a location as its history map key.
///
/// Each segment resolves to its string form (`name` or `name~00000001`) and
/// segments join with `/`. The rendering sorts in the same order the engine
/// enumerates children, which loop trimming and child-entry queries depend on.
pub fn location_key(registry: &NameRegistry, location: &Location) -> String {
    let mut parts = Vec::with_capacity(location.segments().len());
    for segment in location.segments() {
        match segment {
            PathSegment::Name { name } => {
                parts.push(registry.resolve(*name).unwrap_or("?").to_string());
            }
            PathSegment::Loop { name, iteration } => {
                let base = registry.resolve(*name).unwrap_or("?");
                parts.push(format!("{base}~{iteration:0width$}", width = ITERATION_KEY_WIDTH));
            }
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = NameRegistry::new();
        let a = registry.register("outer");
        let b = registry.register("inner");
        let c = registry.register("outer");

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_from_names_round_trip() {
        let registry = NameRegistry::from_names(vec!["a".into(), "b".into()]);
        assert_eq!(registry.resolve(0), Some("a"));
        assert_eq!(registry.resolve(1), Some("b"));

        let mut registry = NameRegistry::from_names(vec!["a".into()]);
        assert_eq!(registry.register("a"), 0);
        assert_eq!(registry.register("b"), 1);
    }

    #[test]
    fn test_location_key_rendering() {
        let mut registry = NameRegistry::new();
        let outer = registry.register("outer");
        let work = registry.register("work");

        let location = Location::root().child_iteration(outer, 3).child(work);
        assert_eq!(location_key(&registry, &location), "outer~00000003/work");
    }

    #[test]
    fn test_iteration_keys_sort_numerically() {
        let mut registry = NameRegistry::new();
        let batch = registry.register("batch");

        let k2 = location_key(&registry, &Location::root().child_iteration(batch, 2));
        let k10 = location_key(&registry, &Location::root().child_iteration(batch, 10));
        let k100 = location_key(&registry, &Location::root().child_iteration(batch, 100));

        assert!(k2 < k10);
        assert!(k10 < k100);
    }

    #[test]
    fn test_location_keys_distinct_paths() {
        let mut registry = NameRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");

        let left = location_key(&registry, &Location::root().child(a).child(b));
        let right = location_key(&registry, &Location::root().child(b).child(a));
        let iter = location_key(&registry, &Location::root().child_iteration(a, 0));
        let plain = location_key(&registry, &Location::root().child(a));

        assert_ne!(left, right);
        assert_ne!(iter, plain);
    }

    #[test]
    fn test_prefix_matching() {
        let mut registry = NameRegistry::new();
        let outer = registry.register("outer");
        let inner = registry.register("inner");

        let root = Location::root();
        let base = root.child(outer);
        let iteration = base.child_iteration(inner, 1);
        let deep = iteration.child(inner);

        assert!(root.is_prefix_of(&deep));
        assert!(base.is_prefix_of(&iteration));
        assert!(iteration.is_prefix_of(&deep));
        assert!(!deep.is_prefix_of(&iteration));

        // An equal-name loop marker at a different iteration does not match.
        let other_iteration = base.child_iteration(inner, 2);
        assert!(!iteration.is_prefix_of(&other_iteration.child(inner)));
    }
}
