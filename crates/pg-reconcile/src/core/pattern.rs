//! Deterministic string transforms for identity renames.

use serde::{Deserialize, Serialize};

use super::selector::Condition;
use crate::error::{ReconcileError, Result};

/// How [`RenamePattern::from`] is matched against the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Replace every occurrence anywhere in the value.
    #[default]
    Contains,
    /// Replace a trailing occurrence only.
    Suffix,
    /// Replace the whole value.
    Exact,
}

/// An `from -> to` substitution on a uniquely constrained column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePattern {
    pub from: String,
    pub to: String,
    #[serde(default, rename = "match")]
    pub mode: MatchMode,
}

impl RenamePattern {
    pub fn new(from: impl Into<String>, to: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            mode,
        }
    }

    /// Reject patterns whose output would match again on the next run.
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(ReconcileError::Config(
                "rename pattern 'from' cannot be empty".to_string(),
            ));
        }
        if self.from == self.to {
            return Err(ReconcileError::Config(format!(
                "rename pattern maps '{}' to itself",
                self.from
            )));
        }
        if self.mode != MatchMode::Exact && self.to.contains(&self.from) {
            return Err(ReconcileError::Config(format!(
                "rename pattern target '{}' contains its source '{}' and would match again on re-run",
                self.to, self.from
            )));
        }
        Ok(())
    }

    /// Transform a value, or `None` when it does not match.
    pub fn apply(&self, value: &str) -> Option<String> {
        match self.mode {
            MatchMode::Contains => value
                .contains(&self.from)
                .then(|| value.replace(&self.from, &self.to)),
            MatchMode::Suffix => value
                .strip_suffix(&self.from)
                .map(|head| format!("{}{}", head, self.to)),
            MatchMode::Exact => (value == self.from).then(|| self.to.clone()),
        }
    }

    /// Whether applying the pattern to its own output is a no-op.
    ///
    /// A replacement can splice a fresh match together (`ab -> a` on
    /// `aabb`), so [`RenamePattern::validate`] alone does not guarantee it.
    pub fn is_settled(&self, value: &str) -> bool {
        self.apply(value).is_none()
    }

    /// Store-side predicate selecting candidate rows.
    pub fn condition(&self, column: &str) -> Condition {
        match self.mode {
            MatchMode::Contains => Condition::Contains {
                column: column.to_string(),
                needle: self.from.clone(),
            },
            MatchMode::Suffix => Condition::EndsWith {
                column: column.to_string(),
                suffix: self.from.clone(),
            },
            MatchMode::Exact => Condition::Equals {
                column: column.to_string(),
                value: super::record::FieldValue::text(self.from.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_replaces_every_occurrence() {
        let p = RenamePattern::new("@portal.tejaskp.com", "@tejaskp.com", MatchMode::Contains);
        assert_eq!(
            p.apply("ajay@portal.tejaskp.com").as_deref(),
            Some("ajay@tejaskp.com")
        );
        assert_eq!(p.apply("ajay@tejaskp.com"), None);

        let p = RenamePattern::new("old", "new", MatchMode::Contains);
        let once = p.apply("old-old").unwrap();
        assert_eq!(once, "new-new");
        assert!(p.is_settled(&once));
    }

    #[test]
    fn test_spliced_matches_are_not_settled() {
        let contains = RenamePattern::new("ab", "a", MatchMode::Contains);
        assert!(contains.validate().is_ok());
        let once = contains.apply("aabb").unwrap();
        assert_eq!(once, "aab");
        assert!(!contains.is_settled(&once));

        let suffix = RenamePattern::new("ab", "b", MatchMode::Suffix);
        let once = suffix.apply("aab").unwrap();
        assert_eq!(once, "ab");
        assert!(!suffix.is_settled(&once));
    }

    #[test]
    fn test_suffix_only_matches_tail() {
        let p = RenamePattern::new("@old.com", "@new.com", MatchMode::Suffix);
        assert_eq!(p.apply("a@old.com").as_deref(), Some("a@new.com"));
        assert_eq!(p.apply("a@old.com.au"), None);
    }

    #[test]
    fn test_exact_mode() {
        let p = RenamePattern::new("ajay@old.com", "kumar@new.com", MatchMode::Exact);
        assert_eq!(p.apply("ajay@old.com").as_deref(), Some("kumar@new.com"));
        assert_eq!(p.apply("xajay@old.com"), None);
    }

    #[test]
    fn test_validate_rejects_self_matching_target() {
        assert!(RenamePattern::new("@a.com", "@a.com.au", MatchMode::Contains)
            .validate()
            .is_err());
        assert!(RenamePattern::new("", "x", MatchMode::Contains).validate().is_err());
        assert!(RenamePattern::new("x", "x", MatchMode::Exact).validate().is_err());
        assert!(RenamePattern::new("@old.com", "@new.com", MatchMode::Suffix)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_second_application_is_a_no_op() {
        let p = RenamePattern::new("@old.com", "@new.com", MatchMode::Contains);
        let once = p.apply("a@old.com").unwrap();
        assert_eq!(p.apply(&once), None);
    }

    #[test]
    fn test_default_mode_from_yaml() {
        let p: RenamePattern = serde_yaml::from_str("from: '@old.com'\nto: '@new.com'\n").unwrap();
        assert_eq!(p.mode, MatchMode::Contains);
    }
}
