//! Nickname policy.

/// Rejects nicknames containing any banned fragment.
#[derive(Debug, Clone, Default)]
pub struct NicknamePolicy {
    banned: Vec<String>,
}

impl NicknamePolicy {
    /// Create a policy from a list of banned fragments. Empty entries are
    /// ignored.
    #[must_use]
    pub fn new(banned: impl IntoIterator<Item = String>) -> Self {
        Self {
            banned: banned.into_iter().filter(|b| !b.is_empty()).collect(),
        }
    }

    /// Whether `nickname` contains a banned fragment (case-sensitive).
    #[must_use]
    pub fn is_banned(&self, nickname: &str) -> bool {
        self.banned.iter().any(|b| nickname.contains(b.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match() {
        let policy = NicknamePolicy::new(vec!["admin".to_string(), "mod".to_string()]);
        assert!(policy.is_banned("admin"));
        assert!(policy.is_banned("the_admin_42"));
        assert!(policy.is_banned("moderator"));
        assert!(!policy.is_banned("Admin"));
        assert!(!policy.is_banned("alice"));
    }

    #[test]
    fn test_empty_entries_ban_nothing() {
        let policy = NicknamePolicy::new(vec![String::new()]);
        assert!(!policy.is_banned("alice"));
        assert!(!NicknamePolicy::default().is_banned("anyone"));
    }
}
