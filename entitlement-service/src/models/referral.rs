use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Referral progression. A row never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    SignedUp,
    Subscribed,
    Rewarded,
}

impl ReferralStatus {
    pub fn rank(&self) -> u8 {
        match self {
            ReferralStatus::Pending => 0,
            ReferralStatus::SignedUp => 1,
            ReferralStatus::Subscribed => 2,
            ReferralStatus::Rewarded => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::SignedUp => "signed_up",
            ReferralStatus::Subscribed => "subscribed",
            ReferralStatus::Rewarded => "rewarded",
        }
    }
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BonusType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "free_month")]
    FreeMonth,
    #[serde(rename = "credit_5")]
    Credit5,
}

impl BonusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BonusType::None => "none",
            BonusType::FreeMonth => "free_month",
            BonusType::Credit5 => "credit_5",
        }
    }
}

impl fmt::Display for BonusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A referrer's code anchor (`referred_email == None`) or one
/// (referrer, referred) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    #[serde(rename = "_id")]
    pub id: String,
    pub referrer_email: String,
    pub referral_code: String,
    pub referred_email: Option<String>,
    pub status: ReferralStatus,
    pub bonus_type: BonusType,
    pub bonus_applied: bool,
    pub created_at: DateTime<Utc>,
    pub signed_up_at: Option<DateTime<Utc>>,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub rewarded_at: Option<DateTime<Utc>>,
    pub bonus_applied_at: Option<DateTime<Utc>>,
}

impl Referral {
    pub fn is_anchor(&self) -> bool {
        self.referred_email.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub referral_code: Option<String>,
    pub total_referrals: u32,
    pub signed_up: u32,
    pub rewarded: u32,
    pub bonuses_pending: u32,
    pub bonuses_applied: u32,
}
