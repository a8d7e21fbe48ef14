//! Process-wide shared metadata.
//!
//! Executors that choose their output at runtime (concatenate, run, clip)
//! publish it here keyed by `VAR:global_output_<gurn>`; consumers resolve
//! the value after the producing node reaches `Processed`. Happens-before
//! is established by dependency ordering, so the map only needs atomic
//! insert semantics.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::node::{Urn, global_output_key};

/// Concurrent key/value map shared by all executors.
#[derive(Debug, Clone, Default)]
pub struct SharedVars {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl SharedVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the dynamic output for a global resource. The first writer
    /// wins; clones of the same resource publish identical values, so a
    /// repeat insert is a no-op rather than an error.
    pub fn publish_output(&self, global_urn: Urn, value: impl Into<String>) {
        let mut map = self.inner.lock().expect("vars mutex poisoned");
        map.entry(global_output_key(global_urn)).or_insert(value.into());
    }

    /// Resolve a raw `VAR:` key.
    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.inner.lock().expect("vars mutex poisoned");
        map.get(key).cloned()
    }

    /// Resolve the published output for a global resource.
    pub fn resolve_output(&self, global_urn: Urn) -> Option<String> {
        self.get(&global_output_key(global_urn))
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().expect("vars mutex poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_resolve_roundtrip() {
        let vars = SharedVars::new();
        vars.publish_output(7, "/build/downloads/osm/osm_config_abc.yml");
        assert_eq!(
            vars.resolve_output(7).as_deref(),
            Some("/build/downloads/osm/osm_config_abc.yml")
        );
        assert_eq!(
            vars.get("VAR:global_output_7").as_deref(),
            Some("/build/downloads/osm/osm_config_abc.yml")
        );
    }

    #[test]
    fn first_writer_wins() {
        let vars = SharedVars::new();
        vars.publish_output(3, "first");
        vars.publish_output(3, "second");
        assert_eq!(vars.resolve_output(3).as_deref(), Some("first"));
    }

    #[test]
    fn missing_keys_resolve_to_none() {
        let vars = SharedVars::new();
        assert!(vars.resolve_output(99).is_none());
    }

    #[test]
    fn clones_share_the_map() {
        let vars = SharedVars::new();
        let clone = vars.clone();
        clone.publish_output(1, "value");
        assert_eq!(vars.resolve_output(1).as_deref(), Some("value"));
    }
}
