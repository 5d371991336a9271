use super::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Development,
    Gift,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Development => "development",
            AccountType::Gift => "gift",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" => Ok(AccountType::Development),
            "gift" => Ok(AccountType::Gift),
            _ => Err(format!(
                "Invalid account type '{}'. Must be one of: development, gift",
                s
            )),
        }
    }
}

/// Complimentary account granted by an admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialAccount {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    pub account_type: AccountType,
    pub tier: Plan,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_by: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
