//! Tags stamped on every cloud resource the controller creates
//!
//! Tags mark ownership and carry enough identity (namespace, ingress name,
//! backend service) to rebuild an aggregate from live cloud state.

use serde::{Deserialize, Serialize};

/// Namespace of the owning Ingress
pub const NAMESPACE_TAG: &str = "Namespace";
/// Name of the owning Ingress
pub const INGRESS_NAME_TAG: &str = "IngressName";
/// Backend service a target group forwards to
pub const SERVICE_NAME_TAG: &str = "ServiceName";
/// Service port (number or name) a target group forwards to
pub const SERVICE_PORT_TAG: &str = "ServicePort";
/// Value of the cluster tag on resources the controller owns outright
pub const CLUSTER_TAG_OWNED: &str = "owned";

/// Key of the cluster tag, `kubernetes.io/cluster/<cluster>`
pub fn cluster_tag(cluster_name: &str) -> String {
    format!("kubernetes.io/cluster/{cluster_name}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered tag collection.
///
/// Key uniqueness is not enforced by `push`; `set` replaces every entry
/// with the same key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(Vec<Tag>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first tag with `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|t| t.key == key)
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(Tag::new(key, value));
    }

    /// Drop every entry with `key`, then append `key=value`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.remove(&key);
        self.0.push(Tag::new(key, value));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|t| t.key != key);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|t| t.key.as_str())
    }

    /// Tags in `self` that are missing from `other` or carry a different value there
    pub fn changed_from(&self, other: &Tags) -> Tags {
        self.0
            .iter()
            .filter(|t| other.get(&t.key) != Some(t.value.as_str()))
            .cloned()
            .collect()
    }

    /// Keys present in `other` but absent from `self`
    pub fn keys_removed_from(&self, other: &Tags) -> Vec<String> {
        let mut removed: Vec<String> = other
            .keys()
            .filter(|k| !self.contains_key(k))
            .map(str::to_string)
            .collect();
        removed.dedup();
        removed
    }

    /// Order-insensitive comparison
    pub fn same_as(&self, other: &Tags) -> bool {
        self.changed_from(other).is_empty() && other.changed_from(self).is_empty()
    }
}

impl FromIterator<Tag> for Tags {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Tags(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Tags {
    type Item = Tag;
    type IntoIter = std::vec::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
