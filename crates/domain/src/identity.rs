use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Client,
    Expert,
    Advisor,
    Admin,
}

impl RecipientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientRole::Client => "client",
            RecipientRole::Expert => "expert",
            RecipientRole::Advisor => "advisor",
            RecipientRole::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Some(RecipientRole::Client),
            "expert" => Some(RecipientRole::Expert),
            "advisor" | "apporteur" => Some(RecipientRole::Advisor),
            "admin" => Some(RecipientRole::Admin),
            _ => None,
        }
    }
}

/// A notification recipient: the platform user a row belongs to, qualified by
/// the role they hold. The same person can act as a client on one case and an
/// expert on another; rows never leak across roles.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub user_id: String,
    pub role: RecipientRole,
}

impl Recipient {
    pub fn new(user_id: impl Into<String>, role: RecipientRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_accepts_legacy_spelling() {
        assert_eq!(
            RecipientRole::parse("apporteur"),
            Some(RecipientRole::Advisor)
        );
        assert_eq!(RecipientRole::parse(" Client "), Some(RecipientRole::Client));
        assert_eq!(RecipientRole::parse("guest"), None);
    }
}
