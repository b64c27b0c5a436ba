//! Leverage tier distribution over a window of liquidation events.
//!
//! Tiers bucket the `estimated_leverage` heuristic, and percentages are each
//! tier's share of window notional. The tier list always carries all five
//! tiers so the payload shape is stable even for empty windows.

use serde::Serialize;

use crate::models::LiquidationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeverageTier {
    Low,
    Medium,
    High,
    VeryHigh,
    Extreme,
}

impl LeverageTier {
    pub const ALL: [LeverageTier; 5] = [
        LeverageTier::Low,
        LeverageTier::Medium,
        LeverageTier::High,
        LeverageTier::VeryHigh,
        LeverageTier::Extreme,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeverageTier::Low => "low",
            LeverageTier::Medium => "medium",
            LeverageTier::High => "high",
            LeverageTier::VeryHigh => "very_high",
            LeverageTier::Extreme => "extreme",
        }
    }

    /// Tier for an estimated leverage multiple.
    pub fn for_leverage(leverage: u32) -> Self {
        match leverage {
            l if l >= 100 => LeverageTier::Extreme,
            l if l >= 50 => LeverageTier::VeryHigh,
            l if l >= 20 => LeverageTier::High,
            l if l >= 10 => LeverageTier::Medium,
            _ => LeverageTier::Low,
        }
    }

    fn index(&self) -> usize {
        match self {
            LeverageTier::Low => 0,
            LeverageTier::Medium => 1,
            LeverageTier::High => 2,
            LeverageTier::VeryHigh => 3,
            LeverageTier::Extreme => 4,
        }
    }
}

impl std::fmt::Display for LeverageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageTierStat {
    pub tier: LeverageTier,
    pub count: usize,
    /// Share of window notional in percent. All zeros for an empty window.
    pub percentage: f64,
}

/// Distribution of events across leverage tiers by notional share.
///
/// Percentages over a nonzero window sum to 100 up to rounding; an empty
/// window yields all-zero tiers rather than NaN.
pub fn distribution(events: &[LiquidationEvent]) -> Vec<LeverageTierStat> {
    let mut counts = [0usize; 5];
    let mut notionals = [0.0f64; 5];

    for event in events {
        let idx = LeverageTier::for_leverage(event.estimated_leverage).index();
        counts[idx] += 1;
        notionals[idx] += event.notional_value;
    }

    let total: f64 = notionals.iter().sum();

    LeverageTier::ALL
        .iter()
        .map(|tier| {
            let idx = tier.index();
            LeverageTierStat {
                tier: *tier,
                count: counts[idx],
                percentage: if total > 0.0 {
                    notionals[idx] / total * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;

    fn event(price: f64, qty: f64) -> LiquidationEvent {
        LiquidationEvent::new("BTCUSDT", Side::Sell, price, qty, Utc::now())
    }

    #[test]
    fn tier_mapping_covers_every_estimate_bracket() {
        assert_eq!(LeverageTier::for_leverage(125), LeverageTier::Extreme);
        assert_eq!(LeverageTier::for_leverage(100), LeverageTier::Extreme);
        assert_eq!(LeverageTier::for_leverage(50), LeverageTier::VeryHigh);
        assert_eq!(LeverageTier::for_leverage(20), LeverageTier::High);
        assert_eq!(LeverageTier::for_leverage(10), LeverageTier::Medium);
        assert_eq!(LeverageTier::for_leverage(5), LeverageTier::Low);
    }

    #[test]
    fn percentages_sum_to_one_hundred_for_nonzero_volume() {
        let events = vec![
            event(40_000.0, 0.5),  // 20k notional -> 125x -> extreme
            event(40_000.0, 2.5),  // 100k -> 100x -> extreme
            event(40_000.0, 12.5), // 500k -> 50x -> very_high
            event(40_000.0, 50.0), // 2M -> 20x -> high
            event(40_000.0, 250.0), // 10M -> 10x -> medium
            event(40_000.0, 750.0), // 30M -> 5x -> low
        ];
        let dist = distribution(&events);

        assert_eq!(dist.len(), 5);
        let sum: f64 = dist.iter().map(|t| t.percentage).sum();
        assert!((sum - 100.0).abs() < 1e-9, "sum = {sum}");

        let by_tier = |tier: LeverageTier| dist.iter().find(|t| t.tier == tier).unwrap();
        assert_eq!(by_tier(LeverageTier::Extreme).count, 2);
        assert_eq!(by_tier(LeverageTier::VeryHigh).count, 1);
        assert_eq!(by_tier(LeverageTier::High).count, 1);
        assert_eq!(by_tier(LeverageTier::Medium).count, 1);
        assert_eq!(by_tier(LeverageTier::Low).count, 1);

        // Low tier carries the bulk of the notional
        assert!(by_tier(LeverageTier::Low).percentage > 50.0);
    }

    #[test]
    fn empty_window_yields_all_zero_tiers() {
        let dist = distribution(&[]);
        assert_eq!(dist.len(), 5);
        for stat in &dist {
            assert_eq!(stat.count, 0);
            assert_eq!(stat.percentage, 0.0);
            assert!(stat.percentage.is_finite());
        }
    }

    #[test]
    fn single_event_takes_the_full_share() {
        let dist = distribution(&[event(50_000.0, 2.0)]); // 100k -> extreme
        let extreme = dist
            .iter()
            .find(|t| t.tier == LeverageTier::Extreme)
            .unwrap();
        assert_eq!(extreme.count, 1);
        assert!((extreme.percentage - 100.0).abs() < 1e-9);
    }
}
