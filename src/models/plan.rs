use core::fmt;

use serde::{Deserialize, Serialize};

use crate::models::payment::BillingInterval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Basic,
    Pro,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Pro => "pro",
            PlanTier::Premium => "premium",
        }
    }

    /// Accepts the bare tier name as well as provider-side ids such as
    /// `plan_pro_monthly` or `prod_premium`.
    pub fn parse(value: &str) -> Option<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        [
            PlanTier::Premium,
            PlanTier::Basic,
            PlanTier::Pro,
            PlanTier::Free,
        ]
        .into_iter()
        .find(|tier| {
            lowered == tier.as_str()
                || lowered
                    .split(|c: char| c == '_' || c == '-' || c == ':')
                    .any(|part| part == tier.as_str())
        })
    }

    pub fn rank(&self) -> u8 {
        match self {
            PlanTier::Free => 0,
            PlanTier::Basic => 1,
            PlanTier::Pro => 2,
            PlanTier::Premium => 3,
        }
    }

    pub fn monthly_credits(&self) -> i64 {
        match self {
            PlanTier::Free => 0,
            PlanTier::Basic => 200,
            PlanTier::Pro => 600,
            PlanTier::Premium => 1500,
        }
    }

    /// Credits granted for one paid billing period.
    pub fn credits_for_interval(&self, interval: BillingInterval) -> i64 {
        match interval {
            BillingInterval::Monthly => self.monthly_credits(),
            BillingInterval::Yearly => self.monthly_credits() * 12,
            BillingInterval::None => 0,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierChange {
    Upgrade,
    Downgrade,
    Unchanged,
}

/// Compares two provider plan ids by tier rank. Unknown ids compare as a change
/// whenever the raw ids differ, classified as an upgrade.
pub fn classify_tier_change(previous: Option<&str>, next: &str) -> TierChange {
    let Some(previous) = previous else {
        return TierChange::Unchanged;
    };
    if previous == next {
        return TierChange::Unchanged;
    }
    match (PlanTier::parse(previous), PlanTier::parse(next)) {
        (Some(old), Some(new)) if new.rank() > old.rank() => TierChange::Upgrade,
        (Some(old), Some(new)) if new.rank() < old.rank() => TierChange::Downgrade,
        (Some(_), Some(_)) => TierChange::Unchanged,
        _ => TierChange::Upgrade,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_prefixed_ids() {
        assert_eq!(PlanTier::parse("pro"), Some(PlanTier::Pro));
        assert_eq!(PlanTier::parse("PLAN_PREMIUM_yearly"), Some(PlanTier::Premium));
        assert_eq!(PlanTier::parse("prod-basic"), Some(PlanTier::Basic));
        assert_eq!(PlanTier::parse("enterprise"), None);
    }

    #[test]
    fn yearly_interval_grants_twelve_periods() {
        assert_eq!(
            PlanTier::Pro.credits_for_interval(BillingInterval::Yearly),
            PlanTier::Pro.monthly_credits() * 12
        );
        assert_eq!(PlanTier::Pro.credits_for_interval(BillingInterval::None), 0);
    }

    #[test]
    fn tier_change_uses_rank() {
        assert_eq!(classify_tier_change(Some("basic"), "pro"), TierChange::Upgrade);
        assert_eq!(classify_tier_change(Some("premium"), "pro"), TierChange::Downgrade);
        assert_eq!(classify_tier_change(Some("pro"), "pro"), TierChange::Unchanged);
        assert_eq!(classify_tier_change(None, "pro"), TierChange::Unchanged);
        assert_eq!(
            classify_tier_change(Some("pro"), "plan_pro_monthly"),
            TierChange::Unchanged
        );
    }
}
