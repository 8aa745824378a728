//! Resource id → address resolution, supplied by the resource catalog.

use std::collections::HashMap;

use crate::types::ResourceId;

pub trait Resolver: Send + Sync {
    /// Network address (`host:port`) for `resource`, or `None` if the
    /// catalog does not know it.
    fn resolve(&self, resource: &ResourceId) -> Option<String>;
}

/// Fixed table, typically loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<ResourceId, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: impl Into<ResourceId>, address: impl Into<String>) {
        self.entries.insert(resource.into(), address.into());
    }

    pub fn with(mut self, resource: impl Into<ResourceId>, address: impl Into<String>) -> Self {
        self.insert(resource, address);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, resource: &ResourceId) -> Option<String> {
        self.entries.get(resource).cloned()
    }
}

impl<R: Into<ResourceId>, A: Into<String>> FromIterator<(R, A)> for StaticResolver {
    fn from_iter<I: IntoIterator<Item = (R, A)>>(iter: I) -> Self {
        let mut resolver = Self::new();
        for (r, a) in iter {
            resolver.insert(r, a);
        }
        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let resolver: StaticResolver = [("res-1", "10.0.0.5:7400")].into_iter().collect();
        assert_eq!(
            resolver.resolve(&"res-1".into()).as_deref(),
            Some("10.0.0.5:7400")
        );
        assert!(resolver.resolve(&"res-2".into()).is_none());
    }
}
