//! Label selectors for scoping list and watch calls
//!
//! Supports the two requirement shapes the orchestrator needs: equality
//! (`key=value`) and set membership (`key in (a,b)`). The `Display` impl
//! renders the Kubernetes selector syntax used by list/watch calls.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label selector for filtering resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Match a label against a set of accepted values
    #[serde(rename = "matchIn")]
    #[serde(default)]
    pub match_in: BTreeMap<String, Vec<String>>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new().with_label(key, value)
    }

    /// Add an equality requirement
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Add a set-based requirement (`key in (values)`)
    pub fn with_label_in<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.match_in
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_in.is_empty()
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let exact = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        exact
            && self.match_in.iter().all(|(k, accepted)| {
                labels
                    .get(k)
                    .map(|v| accepted.iter().any(|a| a == v))
                    .unwrap_or(false)
            })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        for (k, values) in &self.match_in {
            parts.push(format!("{} in ({})", k, values.join(",")));
        }

        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_label_selector_matches() {
        let selector = LabelSelector::matching("env", "prod");

        assert!(selector.matches(&labels(&[("env", "prod"), ("app", "web")])));
    }

    #[test]
    fn test_label_selector_no_match() {
        let selector = LabelSelector::matching("env", "prod");

        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_set_requirement() {
        let selector = LabelSelector::matching("product-id", "p1")
            .with_label_in("type", ["node", "entrypoint"]);

        assert!(selector.matches(&labels(&[("product-id", "p1"), ("type", "node")])));
        assert!(selector.matches(&labels(&[("product-id", "p1"), ("type", "entrypoint")])));
        assert!(!selector.matches(&labels(&[("product-id", "p1"), ("type", "config")])));
        assert!(!selector.matches(&labels(&[("product-id", "p1")])));
    }

    #[test]
    fn test_display_renders_kubernetes_syntax() {
        let selector = LabelSelector::matching("product-id", "p1")
            .with_label("version-name", "v1")
            .with_label_in("type", ["node", "entrypoint"]);

        assert_eq!(
            selector.to_string(),
            "product-id=p1,version-name=v1,type in (node,entrypoint)"
        );
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::new();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("a", "b")])));
        assert_eq!(selector.to_string(), "");
    }
}
