use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered plan tiers: free < pro < premium < family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Premium,
    Family,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Free, Plan::Pro, Plan::Premium, Plan::Family];

    pub fn level(&self) -> u8 {
        match self {
            Plan::Free => 0,
            Plan::Pro => 1,
            Plan::Premium => 2,
            Plan::Family => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Premium => "premium",
            Plan::Family => "family",
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != Plan::Free
    }

    /// True when this plan grants everything `required` grants.
    pub fn satisfies(&self, required: Plan) -> bool {
        self.level() >= required.level()
    }

    pub fn max(self, other: Plan) -> Plan {
        if other.level() > self.level() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid plan '{0}'. Must be one of: free, pro, premium, family")]
pub struct PlanParseError(pub String);

impl FromStr for Plan {
    type Err = PlanParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "premium" => Ok(Plan::Premium),
            "family" => Ok(Plan::Family),
            _ => Err(PlanParseError(s.to_string())),
        }
    }
}
