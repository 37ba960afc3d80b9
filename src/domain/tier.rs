use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TierId {
    Free,
    Pro,
}

/// A monthly or per-comparison allowance. `Unlimited` means the tier imposes
/// no cap for that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quota {
    Limited(u32),
    Unlimited,
}

impl Quota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    /// Whether one more unit is allowed given `used` units already consumed.
    pub fn allows(&self, used: u32) -> bool {
        match self {
            Quota::Unlimited => true,
            Quota::Limited(cap) => used < *cap,
        }
    }

    /// Clamp a requested count to this quota.
    pub fn cap(&self, requested: usize) -> usize {
        match self {
            Quota::Unlimited => requested,
            Quota::Limited(cap) => requested.min(*cap as usize),
        }
    }

    /// Percentage of the quota consumed, `None` for unlimited quotas.
    pub fn percent_used(&self, used: u32) -> Option<f32> {
        match self {
            Quota::Unlimited => None,
            Quota::Limited(0) => Some(100.0),
            Quota::Limited(cap) => Some((used as f32 / *cap as f32) * 100.0),
        }
    }
}

/// Color bucket for usage meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    Low,
    Moderate,
    High,
    Exhausted,
}

impl UsageLevel {
    pub fn from_quota(quota: Quota, used: u32) -> Self {
        match quota.percent_used(used) {
            None => UsageLevel::Low,
            Some(pct) if pct >= 100.0 => UsageLevel::Exhausted,
            Some(pct) if pct >= 80.0 => UsageLevel::High,
            Some(pct) if pct >= 50.0 => UsageLevel::Moderate,
            Some(_) => UsageLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierDefinition {
    pub id: TierId,
    pub display_name: &'static str,
    pub monthly_conversation_quota: Quota,
    pub max_providers_per_comparison: Quota,
    pub price_cents: u32,
    pub features: &'static [&'static str],
}

const FREE_TIER: TierDefinition = TierDefinition {
    id: TierId::Free,
    display_name: "Free",
    monthly_conversation_quota: Quota::Limited(50),
    max_providers_per_comparison: Quota::Limited(3),
    price_cents: 0,
    features: &[
        "50 conversations per month",
        "Compare up to 3 providers side by side",
        "Response selection and provider stats",
    ],
};

const PRO_TIER: TierDefinition = TierDefinition {
    id: TierId::Pro,
    display_name: "Pro",
    monthly_conversation_quota: Quota::Unlimited,
    max_providers_per_comparison: Quota::Unlimited,
    price_cents: 1900,
    features: &[
        "Unlimited conversations",
        "Compare every configured provider at once",
        "Personal API keys per provider",
        "Priority model access",
    ],
};

const ALL_TIERS: [TierDefinition; 2] = [FREE_TIER, PRO_TIER];

/// Static lookup; there is exactly one definition per tier id.
pub fn tier(id: TierId) -> &'static TierDefinition {
    match id {
        TierId::Free => &FREE_TIER,
        TierId::Pro => &PRO_TIER,
    }
}

pub fn all_tiers() -> &'static [TierDefinition] {
    &ALL_TIERS
}

/// "Free" for zero-cost tiers, otherwise dollars per month.
pub fn format_price(price_cents: u32) -> String {
    if price_cents == 0 {
        "Free".to_string()
    } else if price_cents % 100 == 0 {
        format!("${}/mo", price_cents / 100)
    } else {
        format!("${}.{:02}/mo", price_cents / 100, price_cents % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_tier_limits_dominate_free_tier() {
        let free = tier(TierId::Free);
        let pro = tier(TierId::Pro);

        // Unlimited dominates any finite cap.
        assert!(pro.monthly_conversation_quota.is_unlimited());
        assert!(pro.max_providers_per_comparison.is_unlimited());
        assert!(!free.monthly_conversation_quota.is_unlimited());
        assert_eq!(free.monthly_conversation_quota, Quota::Limited(50));
    }

    #[test]
    fn quota_allows_below_cap_only() {
        let q = Quota::Limited(50);
        assert!(q.allows(0));
        assert!(q.allows(49));
        assert!(!q.allows(50));
        assert!(!q.allows(51));
        assert!(Quota::Unlimited.allows(u32::MAX));
    }

    #[test]
    fn quota_cap_truncates_requests() {
        assert_eq!(Quota::Limited(3).cap(5), 3);
        assert_eq!(Quota::Limited(3).cap(2), 2);
        assert_eq!(Quota::Unlimited.cap(12), 12);
    }

    #[test]
    fn usage_level_buckets() {
        let q = Quota::Limited(50);
        assert_eq!(UsageLevel::from_quota(q, 0), UsageLevel::Low);
        assert_eq!(UsageLevel::from_quota(q, 24), UsageLevel::Low);
        assert_eq!(UsageLevel::from_quota(q, 25), UsageLevel::Moderate);
        assert_eq!(UsageLevel::from_quota(q, 40), UsageLevel::High);
        assert_eq!(UsageLevel::from_quota(q, 50), UsageLevel::Exhausted);
        assert_eq!(UsageLevel::from_quota(Quota::Unlimited, 9999), UsageLevel::Low);
    }

    #[test]
    fn price_formatting() {
        assert_eq!(format_price(0), "Free");
        assert_eq!(format_price(1900), "$19/mo");
        assert_eq!(format_price(1950), "$19.50/mo");
    }

    #[test]
    fn tier_id_round_trips_as_text() {
        use std::str::FromStr;
        assert_eq!(TierId::Free.to_string(), "free");
        assert_eq!(TierId::Pro.to_string(), "pro");
        assert_eq!(TierId::from_str("pro").unwrap(), TierId::Pro);
        assert!(TierId::from_str("enterprise").is_err());
    }
}
