//! Admitted identity and the topic naming conventions derived from it.
//!
//! The relay never authenticates anyone itself. An upstream collaborator
//! resolves the caller and hands over an [`Identity`]; the relay only checks
//! that it is non-empty and derives the initial topic set from it.

use serde::{Deserialize, Serialize};

/// Topic prefix for per-user broadcasts.
pub const USER_TOPIC_PREFIX: &str = "user:";

/// Topic prefix for per-organization broadcasts.
pub const ORG_TOPIC_PREFIX: &str = "org:";

/// An authenticated caller, as supplied by the auth layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Owning user ID.
    pub user_id: String,
    /// Organizations the user belongs to.
    #[serde(default)]
    pub org_ids: Vec<String>,
}

impl Identity {
    /// Identity for a user with no organizations.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            org_ids: Vec::new(),
        }
    }

    /// Attach organization memberships.
    #[must_use]
    pub fn with_orgs<I, S>(mut self, orgs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.org_ids.extend(orgs.into_iter().map(Into::into));
        self
    }

    /// Whether the identity carries no usable user ID.
    pub fn is_empty(&self) -> bool {
        self.user_id.trim().is_empty()
    }

    /// Topics a fresh connection for this identity starts subscribed to:
    /// `user:<id>` followed by `org:<id>` for each distinct, non-blank org.
    pub fn default_topics(&self) -> Vec<String> {
        let mut topics = vec![user_topic(&self.user_id)];
        for org in &self.org_ids {
            let org = org.trim();
            if org.is_empty() {
                continue;
            }
            let topic = org_topic(org);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }
}

/// `user:<id>`
pub fn user_topic(user_id: &str) -> String {
    format!("{USER_TOPIC_PREFIX}{user_id}")
}

/// `org:<id>`
pub fn org_topic(org_id: &str) -> String {
    format!("{ORG_TOPIC_PREFIX}{org_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_user_id_is_empty() {
        assert!(Identity::new("").is_empty());
        assert!(Identity::new("   ").is_empty());
        assert!(!Identity::new("u1").is_empty());
    }

    #[test]
    fn default_topics_user_only() {
        let id = Identity::new("u1");
        assert_eq!(id.default_topics(), vec!["user:u1".to_string()]);
    }

    #[test]
    fn default_topics_with_orgs() {
        let id = Identity::new("u1").with_orgs(["o1", "o2"]);
        assert_eq!(
            id.default_topics(),
            vec!["user:u1".to_string(), "org:o1".into(), "org:o2".into()]
        );
    }

    #[test]
    fn default_topics_skip_blank_and_duplicate_orgs() {
        let id = Identity::new("u1").with_orgs(["o1", "", "o1", "  "]);
        assert_eq!(id.default_topics(), vec!["user:u1".to_string(), "org:o1".into()]);
    }

    #[test]
    fn deserialize_without_orgs() {
        let id: Identity = serde_json::from_str(r#"{"userId":"u9"}"#).unwrap();
        assert_eq!(id.user_id, "u9");
        assert!(id.org_ids.is_empty());
    }
}
