use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerRole {
    SuperAdmin,
    Admin,
    #[default]
    Reviewer,
}

impl ReviewerRole {
    pub fn can_review_escalated(self) -> bool {
        matches!(self, ReviewerRole::SuperAdmin | ReviewerRole::Admin)
    }
}

/// Reviewer roles and trainer pod allow-lists. Emails are compared
/// lowercased and trimmed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    roles: HashMap<String, ReviewerRole>,
    #[serde(default)]
    pods: HashMap<String, Vec<String>>,
}

impl TeamConfig {
    pub fn from_entries<'a>(
        roles: impl IntoIterator<Item = (&'a str, &'a str)>,
        pods: impl IntoIterator<Item = (&'a str, Vec<&'a str>)>,
    ) -> Self {
        let roles = roles
            .into_iter()
            .map(|(email, role)| {
                let role = match role {
                    "super_admin" => ReviewerRole::SuperAdmin,
                    "admin" => ReviewerRole::Admin,
                    _ => ReviewerRole::Reviewer,
                };
                (normalize(email), role)
            })
            .collect();
        let pods = pods
            .into_iter()
            .map(|(email, trainers)| {
                (
                    normalize(email),
                    trainers.into_iter().map(normalize).collect(),
                )
            })
            .collect();
        Self { roles, pods }
    }

    pub fn role(&self, email: &str) -> ReviewerRole {
        self.roles
            .get(&normalize(email))
            .copied()
            .unwrap_or_default()
    }

    /// `None` means unrestricted: super admins always, and any reviewer
    /// with no pod entry configured. An explicitly configured pod restricts
    /// to exactly its trainers, even when it is empty.
    pub fn allowed_trainers(&self, email: &str) -> Option<HashSet<String>> {
        let email = normalize(email);
        if self.roles.get(&email) == Some(&ReviewerRole::SuperAdmin) {
            return None;
        }
        self.pods
            .get(&email)
            .map(|trainers| trainers.iter().cloned().collect())
    }
}

fn normalize(email: impl AsRef<str>) -> String {
    email.as_ref().trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_admin_is_unrestricted() {
        let team = TeamConfig::from_entries([("boss@example.com", "super_admin")], []);
        assert!(team.allowed_trainers("boss@example.com").is_none());
        assert!(team.role("boss@example.com").can_review_escalated());
    }

    #[test]
    fn reviewer_sees_only_pod_trainers() {
        let team = TeamConfig::from_entries(
            [("rev@example.com", "reviewer")],
            [("rev@example.com", vec!["a@example.com", "b@example.com"])],
        );
        let allowed = team.allowed_trainers("REV@example.com ").unwrap();
        assert!(allowed.contains("a@example.com"));
        assert!(!allowed.contains("c@example.com"));
        assert!(!team.role("rev@example.com").can_review_escalated());
    }

    #[test]
    fn no_pod_entry_means_unrestricted() {
        let team = TeamConfig::from_entries([("admin@example.com", "admin")], []);
        assert!(team.allowed_trainers("admin@example.com").is_none());
        assert!(team.allowed_trainers("nobody@example.com").is_none());
    }

    #[test]
    fn empty_configured_pod_restricts_to_nothing() {
        let team = TeamConfig::from_entries(
            [("rev@example.com", "reviewer")],
            [("rev@example.com", vec![])],
        );
        assert_eq!(team.allowed_trainers("rev@example.com").unwrap().len(), 0);
    }
}
