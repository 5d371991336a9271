//! Business logic for entitlements, rate limiting, trials and referrals.

pub mod email;
pub mod entitlements;
pub mod error;
pub mod hit_counter;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod rate_limiter;
pub mod referrals;
pub mod repository;
pub mod special_accounts;
pub mod trials;
pub mod webhook;

pub use email::{EmailProvider, EmailService, MockEmailService};
pub use entitlements::{AccessDecision, AccessRequest, DenialReason, EntitlementFacade};
pub use error::EntitlementError;
pub use hit_counter::{HitCounter, InMemoryHitCounter, RedisHitCounter};
pub use ledger::SubscriptionLedger;
pub use memory::InMemoryRepository;
pub use metrics::{get_metrics, init_metrics};
pub use mongo::MongoRepository;
pub use rate_limiter::RateLimiter;
pub use referrals::{AppliedBonus, BonusPicker, ReferralRewardEngine};
pub use repository::{EntitlementRepository, InsertOutcome, RateLimitAuditSink};
pub use special_accounts::{NewSpecialAccount, SpecialAccountService};
pub use trials::TrialLifecycleManager;
pub use webhook::{PaymentWebhookProcessor, WebhookOutcome, SIGNATURE_HEADER};
