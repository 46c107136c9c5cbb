//! Element registry
//!
//! Maps parameter names and indices to discovered elements. Only discovery
//! writes it; everyone else reads cloned elements.
//!
//! The wire identifier always follows from the index. The extended id is the
//! controller's own identity for an element, so a rediscovered table whose
//! extended id differs for a name at the same index is reported as a change
//! too.
//!
//! Static default indices may be registered as placeholders so that index
//! changes against them are logged, but lookups never serve a placeholder:
//! a parameter absent from the applied table is unavailable.

use super::parser::DiscoveredElement;
use crate::core::frame::response_id;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the registry contents came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrySource {
    /// Fresh transfer from the controller
    Discovery,
    /// Loaded from the discovery cache
    Cache,
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => write!(f, "discovery"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// An element whose index or extended id differs from what the registry held before
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    /// Parameter name
    pub name: String,
    /// Previous index (discovered, cached or placeholder)
    pub old_index: u16,
    /// New index
    pub new_index: u16,
    /// Wire identifier for the new index
    pub can_id: u32,
    /// Extended id differs from the previously applied element
    pub extid_changed: bool,
}

impl IndexChange {
    /// True when the element moved to another index
    pub fn is_relocation(&self) -> bool {
        self.old_index != self.new_index
    }
}

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, DiscoveredElement>,
    by_index: HashMap<u16, DiscoveredElement>,
    placeholders: HashMap<String, u16>,
    source: Option<RegistrySource>,
}

/// Shared name/index table
#[derive(Clone, Default)]
pub struct ElementRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ElementRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register static default indices used only for change logging
    pub fn with_placeholders<I, S>(self, placeholders: I) -> Self
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        {
            let mut inner = self.inner.write();
            for (name, index) in placeholders {
                inner.placeholders.insert(name.into(), index);
            }
        }
        self
    }

    /// Element by name
    pub fn lookup_by_name(&self, name: &str) -> Option<DiscoveredElement> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// Element by index
    pub fn lookup_by_index(&self, index: u16) -> Option<DiscoveredElement> {
        self.inner.read().by_index.get(&index).cloned()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    /// True before any table was applied
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_name.is_empty()
    }

    /// Source of the current contents
    pub fn source(&self) -> Option<RegistrySource> {
        self.inner.read().source
    }

    /// All elements sorted by index
    pub fn elements(&self) -> Vec<DiscoveredElement> {
        let mut elements: Vec<_> = self.inner.read().by_name.values().cloned().collect();
        elements.sort_by_key(|e| e.index);
        elements
    }

    /// Replace the table.
    ///
    /// Elements not in `elements` become unavailable. Every index that
    /// differs from the previous entry or placeholder is logged and returned.
    pub fn apply(&self, elements: Vec<DiscoveredElement>, source: RegistrySource) -> Vec<IndexChange> {
        let mut inner = self.inner.write();
        let mut by_name = HashMap::with_capacity(elements.len());
        let mut by_index = HashMap::with_capacity(elements.len());
        let mut changes = Vec::new();

        for element in elements {
            let known = inner.by_name.get(&element.name);
            let extid_changed = known.is_some_and(|e| e.extid != element.extid);
            let previous = known
                .map(|e| e.index)
                .or_else(|| inner.placeholders.get(&element.name).copied());

            if let Some(old_index) = previous.filter(|&old| old != element.index || extid_changed) {
                let change = IndexChange {
                    name: element.name.clone(),
                    old_index,
                    new_index: element.index,
                    can_id: response_id(element.index),
                    extid_changed,
                };
                if change.is_relocation() {
                    warn!(
                        name = %change.name,
                        old_index,
                        new_index = change.new_index,
                        can_id = format_args!("{:#010X}", change.can_id),
                        %source,
                        "element index changed"
                    );
                } else {
                    warn!(
                        name = %change.name,
                        index = change.new_index,
                        old_extid = %known.map(DiscoveredElement::extid_hex).unwrap_or_default(),
                        new_extid = %element.extid_hex(),
                        %source,
                        "element extended id changed at unchanged index"
                    );
                }
                changes.push(change);
            }

            by_index.insert(element.index, element.clone());
            by_name.insert(element.name.clone(), element);
        }

        let dropped = inner.by_name.keys().filter(|name| !by_name.contains_key(*name)).count();
        if dropped > 0 {
            debug!(dropped, "elements no longer present");
        }

        info!(elements = by_name.len(), changes = changes.len(), %source, "element registry updated");
        inner.by_name = by_name;
        inner.by_index = by_index;
        inner.source = Some(source);
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(name: &str, index: u16) -> DiscoveredElement {
        DiscoveredElement {
            index,
            extid: [0; 7],
            max: 100,
            min: 0,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_placeholders_are_never_served() {
        let registry = ElementRegistry::new().with_placeholders([("GT1_T", 1u16)]);
        assert!(registry.lookup_by_name("GT1_T").is_none());
        assert!(registry.lookup_by_index(1).is_none());

        let changes = registry.apply(vec![element("GT1_T", 5)], RegistrySource::Discovery);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_index, 1);
        assert_eq!(changes[0].new_index, 5);
        assert_eq!(changes[0].can_id, 0x0C01_7FE0);
        assert_eq!(registry.lookup_by_name("GT1_T").unwrap().index, 5);
        assert_eq!(registry.lookup_by_index(5).unwrap().name, "GT1_T");
    }

    #[test]
    fn test_reapply_reports_only_changes() {
        let registry = ElementRegistry::new();
        assert!(registry.apply(vec![element("A", 1), element("B", 2)], RegistrySource::Cache).is_empty());

        let changes = registry.apply(vec![element("A", 1), element("B", 3)], RegistrySource::Discovery);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "B");
        assert!(registry.lookup_by_index(2).is_none());
        assert_eq!(registry.source(), Some(RegistrySource::Discovery));
    }

    #[test]
    fn test_extid_drift_at_same_index_is_a_change() {
        let registry = ElementRegistry::new();
        registry.apply(vec![element("A", 1), element("B", 2)], RegistrySource::Discovery);

        let mut drifted = element("B", 2);
        drifted.extid = [0, 0, 0, 0, 0, 0x40, 0x02];
        let changes = registry.apply(vec![element("A", 1), drifted], RegistrySource::Discovery);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "B");
        assert!(changes[0].extid_changed);
        assert!(!changes[0].is_relocation());
        assert_eq!(registry.lookup_by_index(2).unwrap().extid[5], 0x40);

        // placeholders carry no extended id to compare against
        let registry = ElementRegistry::new().with_placeholders([("C", 3u16)]);
        let changes = registry.apply(vec![element("C", 3)], RegistrySource::Cache);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_missing_element_becomes_unavailable() {
        let registry = ElementRegistry::new();
        registry.apply(vec![element("A", 1), element("B", 2)], RegistrySource::Discovery);
        registry.apply(vec![element("A", 1)], RegistrySource::Discovery);
        assert!(registry.lookup_by_name("B").is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.elements()[0].name, "A");
    }
}
