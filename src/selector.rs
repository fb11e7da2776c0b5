//! Label selection for lister reads

use std::collections::BTreeMap;

/// Equality-based label selector applied by listers.
///
/// An empty selector matches everything, mirroring the wire convention of
/// an absent `labelSelector`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: BTreeMap<String, String>,
}

impl Selector {
    /// Selector matching every object.
    pub fn everything() -> Self {
        Selector::default()
    }

    /// Adds an equality requirement.
    pub fn eq(mut self, label: &str, value: &str) -> Self {
        self.requirements
            .insert(label.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// True when every requirement is present in `labels`.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        if self.requirements.is_empty() {
            return true;
        }
        let labels = match labels {
            Some(labels) => labels,
            None => return false,
        };
        self.requirements
            .iter()
            .all(|(label, value)| labels.get(label) == Some(value))
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
    fn everything_matches_everything() {
        let sel = Selector::everything();
        assert!(sel.matches(None));
        assert!(sel.matches(Some(&labels(&[("app", "web")]))));
    }

    #[test]
    fn equality_requirements_are_conjunctive() {
        let sel = Selector::everything().eq("app", "web").eq("tier", "front");
        assert!(sel.matches(Some(&labels(&[("app", "web"), ("tier", "front"), ("extra", "x")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("tier", "back")]))));
        assert!(!sel.matches(None));
    }
}
