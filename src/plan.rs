use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::types::{PlanTier, User, UserRole};

/// Tools a plan may grant access to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
    Veo,
    Bulk,
    Script,
    TextToImage,
    ImageToVideo,
}

/// Bulk generation shape for a tier: how many submissions go out per batch,
/// the pause between batches, and the per-request prompt ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkConfig {
    pub max_batch: i32,
    pub delay_seconds: u64,
    pub max_prompts: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct PlanLimits {
    pub daily_limit: i32,
    pub allowed_tools: &'static [Tool],
    pub bulk: BulkConfig,
}

const FREE_LIMITS: PlanLimits = PlanLimits {
    daily_limit: 0,
    allowed_tools: &[Tool::Veo],
    bulk: BulkConfig {
        max_batch: 0,
        delay_seconds: 0,
        max_prompts: 0,
    },
};

const SCALE_LIMITS: PlanLimits = PlanLimits {
    daily_limit: 1000,
    allowed_tools: &[Tool::Veo, Tool::Bulk],
    bulk: BulkConfig {
        max_batch: 7,
        delay_seconds: 30,
        max_prompts: 50,
    },
};

const EMPIRE_LIMITS: PlanLimits = PlanLimits {
    daily_limit: 2000,
    allowed_tools: &[
        Tool::Veo,
        Tool::Bulk,
        Tool::Script,
        Tool::TextToImage,
        Tool::ImageToVideo,
    ],
    bulk: BulkConfig {
        max_batch: 10,
        delay_seconds: 10,
        max_prompts: 100,
    },
};

#[must_use]
pub fn limits(tier: PlanTier) -> PlanLimits {
    match tier {
        PlanTier::Free => FREE_LIMITS,
        PlanTier::Scale => SCALE_LIMITS,
        PlanTier::Empire => EMPIRE_LIMITS,
    }
}

/// Outcome of a plan check. Denials carry a human-readable reason instead of
/// being raised as errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_videos: Option<i32>,
}

impl PlanDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_videos: None,
        }
    }

    fn allow_remaining(remaining: i32) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_videos: Some(remaining),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            remaining_videos: None,
        }
    }
}

pub struct PlanEnforcer;

impl PlanEnforcer {
    /// Admins and free-tier users never expire; paid tiers expire strictly
    /// after `plan_expires_at`.
    #[must_use]
    pub fn is_plan_expired(user: &User, now: DateTime<Utc>) -> bool {
        if user.role == UserRole::Admin || user.plan_tier == PlanTier::Free {
            return false;
        }

        match user.plan_expires_at {
            Some(expiry) => now > expiry,
            None => false,
        }
    }

    #[must_use]
    pub fn can_access_tool(user: &User, tool: Tool, now: DateTime<Utc>) -> PlanDecision {
        if user.role == UserRole::Admin {
            return PlanDecision::allow();
        }

        if Self::is_plan_expired(user, now) {
            return PlanDecision::deny("Your plan has expired. Please renew to continue.");
        }

        if !limits(user.plan_tier).allowed_tools.contains(&tool) {
            return PlanDecision::deny(format!(
                "Your plan does not include access to {tool:?}. Upgrade to unlock it."
            ));
        }

        PlanDecision::allow()
    }

    #[must_use]
    pub fn can_generate_video(user: &User, now: DateTime<Utc>) -> PlanDecision {
        if user.role == UserRole::Admin {
            return PlanDecision::allow();
        }

        if Self::is_plan_expired(user, now) {
            return PlanDecision::deny("Your plan has expired. Please renew to continue.");
        }

        let limits = limits(user.plan_tier);
        let remaining = limits.daily_limit - user.daily_videos_generated;

        if remaining <= 0 {
            return PlanDecision::deny(format!(
                "Daily limit of {} videos reached. The counter resets at midnight.",
                limits.daily_limit
            ));
        }

        PlanDecision::allow_remaining(remaining)
    }

    #[must_use]
    pub fn can_bulk_generate(user: &User, prompt_count: usize, now: DateTime<Utc>) -> PlanDecision {
        if user.role == UserRole::Admin {
            return PlanDecision::allow();
        }

        let tool_check = Self::can_access_tool(user, Tool::Bulk, now);
        if !tool_check.allowed {
            return tool_check;
        }

        let limits = limits(user.plan_tier);

        if prompt_count > limits.bulk.max_prompts {
            return PlanDecision::deny(format!(
                "Your plan allows at most {} prompts per bulk request.",
                limits.bulk.max_prompts
            ));
        }

        let remaining = limits.daily_limit - user.daily_videos_generated;
        if prompt_count as i32 > remaining {
            return PlanDecision::deny(format!(
                "Only {} videos left on your daily limit.",
                remaining.max(0)
            ));
        }

        PlanDecision::allow_remaining(remaining)
    }

    /// Bulk pacing for the user's tier. Admins get the widest shape.
    #[must_use]
    pub fn batch_config(user: &User) -> BulkConfig {
        if user.role == UserRole::Admin {
            return EMPIRE_LIMITS.bulk;
        }

        limits(user.plan_tier).bulk
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone};
    use test_case::test_case;

    use super::*;

    fn user(role: UserRole, tier: PlanTier, daily: i32, expires_in_days: Option<i64>) -> User {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();

        User {
            id: 1,
            email: "user@example.com".to_string(),
            role,
            plan_tier: tier,
            plan_started_at: Some(now - Duration::days(10)),
            plan_expires_at: expires_in_days.map(|d| now + Duration::days(d)),
            daily_videos_generated: daily,
            last_reset_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            created_at: now - Duration::days(100),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn expired_plan_is_detected() {
        let expired = user(UserRole::Regular, PlanTier::Scale, 0, Some(-1));
        assert!(PlanEnforcer::is_plan_expired(&expired, now()));

        let active = user(UserRole::Regular, PlanTier::Scale, 0, Some(1));
        assert!(!PlanEnforcer::is_plan_expired(&active, now()));
    }

    #[test]
    fn admin_and_free_never_expire() {
        let admin = user(UserRole::Admin, PlanTier::Empire, 0, Some(-30));
        assert!(!PlanEnforcer::is_plan_expired(&admin, now()));

        let free = user(UserRole::Regular, PlanTier::Free, 0, None);
        assert!(!PlanEnforcer::is_plan_expired(&free, now()));
    }

    #[test_case(PlanTier::Free, Tool::Veo => true)]
    #[test_case(PlanTier::Free, Tool::Bulk => false)]
    #[test_case(PlanTier::Scale, Tool::Bulk => true)]
    #[test_case(PlanTier::Scale, Tool::Script => false)]
    #[test_case(PlanTier::Empire, Tool::ImageToVideo => true)]
    fn tool_access_by_tier(tier: PlanTier, tool: Tool) -> bool {
        let user = user(UserRole::Regular, tier, 0, Some(10));

        PlanEnforcer::can_access_tool(&user, tool, now()).allowed
    }

    #[test]
    fn admin_bypasses_tool_checks() {
        let admin = user(UserRole::Admin, PlanTier::Free, 0, None);

        assert!(PlanEnforcer::can_access_tool(&admin, Tool::ImageToVideo, now()).allowed);
        assert!(PlanEnforcer::can_bulk_generate(&admin, 100, now()).allowed);
    }

    #[test]
    fn expired_plan_denies_tools() {
        let expired = user(UserRole::Regular, PlanTier::Empire, 0, Some(-1));
        let decision = PlanEnforcer::can_access_tool(&expired, Tool::Veo, now());

        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("expired"));
    }

    #[test]
    fn daily_limit_is_enforced() {
        let at_limit = user(UserRole::Regular, PlanTier::Scale, 1000, Some(10));
        let decision = PlanEnforcer::can_generate_video(&at_limit, now());

        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("Daily limit"));

        let below = user(UserRole::Regular, PlanTier::Scale, 999, Some(10));
        let decision = PlanEnforcer::can_generate_video(&below, now());

        assert!(decision.allowed);
        assert_eq!(decision.remaining_videos, Some(1));
    }

    #[test]
    fn free_tier_cannot_generate() {
        let free = user(UserRole::Regular, PlanTier::Free, 0, None);

        assert!(!PlanEnforcer::can_generate_video(&free, now()).allowed);
    }

    #[test]
    fn bulk_rejects_over_prompt_cap() {
        let scale = user(UserRole::Regular, PlanTier::Scale, 0, Some(10));
        let decision = PlanEnforcer::can_bulk_generate(&scale, 51, now());

        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("at most 50"));
    }

    #[test]
    fn bulk_rejects_when_quota_insufficient() {
        let nearly_spent = user(UserRole::Regular, PlanTier::Empire, 1995, Some(10));
        let decision = PlanEnforcer::can_bulk_generate(&nearly_spent, 10, now());

        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("5 videos left"));
    }

    #[test]
    fn bulk_allows_within_limits() {
        let empire = user(UserRole::Regular, PlanTier::Empire, 100, Some(10));
        let decision = PlanEnforcer::can_bulk_generate(&empire, 100, now());

        assert!(decision.allowed);
        assert_eq!(decision.remaining_videos, Some(1900));
    }

    #[test]
    fn batch_config_matches_tier_table() {
        let scale = user(UserRole::Regular, PlanTier::Scale, 0, Some(10));
        assert_eq!(
            PlanEnforcer::batch_config(&scale),
            BulkConfig {
                max_batch: 7,
                delay_seconds: 30,
                max_prompts: 50
            }
        );

        let admin = user(UserRole::Admin, PlanTier::Free, 0, None);
        assert_eq!(PlanEnforcer::batch_config(&admin), EMPIRE_LIMITS.bulk);
    }
}
