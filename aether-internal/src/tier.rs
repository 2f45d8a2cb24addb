use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};

/// Service level controlling resource limits.
///
/// `Legendary` is a historical alias for `Legend` that still appears in
/// stored user records; it is accepted at every parse boundary and
/// canonicalized here.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Standard,
    #[serde(alias = "legendary")]
    #[strum(to_string = "legend", serialize = "legendary")]
    Legend,
    Vip,
}

impl Tier {
    /// Parse a tier name from an untrusted source.
    ///
    /// Unknown names fall back to `Standard` (the most restrictive tier)
    /// rather than failing the request.
    pub fn parse_lossy(raw: &str) -> Tier {
        match Tier::from_str(raw.trim().to_ascii_lowercase().as_str()) {
            Ok(tier) => tier,
            Err(_) => {
                tracing::warn!(tier = raw, "Unknown tier name, defaulting to standard");
                Tier::Standard
            }
        }
    }
}

/// A rate-limited resource.
///
/// The two kinds deliberately use different period bucketing: general
/// responses accumulate over an epoch-anchored bi-weekly window, premium
/// model calls over the calendar month.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Response,
    PremiumCall,
}

/// Limit for one (tier, resource kind) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Limited(u32),
    Unlimited,
}

impl QuotaLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, QuotaLimit::Unlimited)
    }

    /// The numeric limit, or `None` for unlimited
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            QuotaLimit::Limited(n) => Some(*n),
            QuotaLimit::Unlimited => None,
        }
    }

    fn from_option(limit: Option<u32>) -> QuotaLimit {
        match limit {
            Some(n) => QuotaLimit::Limited(n),
            None => QuotaLimit::Unlimited,
        }
    }
}

/// Per-tier limits for each resource kind. `None` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    pub responses_per_period: Option<u32>,
    pub premium_calls_per_month: Option<u32>,
}

impl TierLimits {
    pub const UNLIMITED: TierLimits = TierLimits {
        responses_per_period: None,
        premium_calls_per_month: None,
    };
}

/// Static tier policy table.
///
/// Immutable after startup; every limit lookup goes through `limit_for`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierPolicy {
    #[serde(default = "default_standard_limits")]
    pub standard: TierLimits,
    #[serde(default = "default_legend_limits")]
    pub legend: TierLimits,
    #[serde(default = "default_vip_limits")]
    pub vip: TierLimits,
}

fn default_standard_limits() -> TierLimits {
    TierLimits {
        responses_per_period: Some(150),
        premium_calls_per_month: Some(10),
    }
}

fn default_legend_limits() -> TierLimits {
    TierLimits {
        responses_per_period: Some(500),
        premium_calls_per_month: Some(50),
    }
}

fn default_vip_limits() -> TierLimits {
    TierLimits::UNLIMITED
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            standard: default_standard_limits(),
            legend: default_legend_limits(),
            vip: default_vip_limits(),
        }
    }
}

impl TierPolicy {
    pub fn limit_for(&self, tier: Tier, kind: ResourceKind) -> QuotaLimit {
        let limits = match tier {
            Tier::Standard => &self.standard,
            Tier::Legend => &self.legend,
            Tier::Vip => &self.vip,
        };
        match kind {
            ResourceKind::Response => QuotaLimit::from_option(limits.responses_per_period),
            ResourceKind::PremiumCall => QuotaLimit::from_option(limits.premium_calls_per_month),
        }
    }
}
