use std::collections::{BTreeMap, BTreeSet};

/// Child → parent links with the reverse parent → children lookup.
///
/// Derivations keep one of these in their output so a change to a parent
/// record can be mapped to the derived entries that read it, without
/// guessing one key from another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignKeyIndex {
    parent_of: BTreeMap<String, String>,
    children_of: BTreeMap<String, BTreeSet<String>>,
}

impl ForeignKeyIndex {
    /// Point `child` at `parent`. Returns the previous parent, if any.
    pub fn link(&mut self, child: &str, parent: &str) -> Option<String> {
        let previous = self.unlink(child);
        self.parent_of.insert(child.to_string(), parent.to_string());
        self.children_of
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        previous
    }

    /// Remove `child`. Parents left without children are dropped.
    pub fn unlink(&mut self, child: &str) -> Option<String> {
        let parent = self.parent_of.remove(child)?;
        if let Some(children) = self.children_of.get_mut(&parent) {
            children.remove(child);
            if children.is_empty() {
                self.children_of.remove(&parent);
            }
        }
        Some(parent)
    }

    pub fn parent(&self, child: &str) -> Option<&str> {
        self.parent_of.get(child).map(String::as_str)
    }

    pub fn children<'a>(&'a self, parent: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.children_of
            .get(parent)
            .into_iter()
            .flat_map(|children| children.iter().map(String::as_str))
    }

    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.children_of.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parent_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_of.is_empty()
    }
}
