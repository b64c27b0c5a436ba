//! Price-density heatmap over a window of liquidation events.
//!
//! Events are spread across fixed-width buckets with a triangular kernel
//! (weight falls off linearly to zero at `bandwidth`), so one liquidation
//! lights up a price band rather than a single tick. Intensity is each
//! bucket's share of the hottest bucket, and risk classes fall out of fixed
//! intensity thresholds. The whole pass is pure arithmetic over the
//! snapshot: same events + same params = identical output.

use serde::Serialize;

use crate::models::{LiquidationEvent, Side};

/// Buckets at or above this share of the hottest bucket are high risk.
const HIGH_INTENSITY: f64 = 0.75;
/// Buckets at or above this share are elevated.
const ELEVATED_INTENSITY: f64 = 0.4;
/// More high-risk zones than this flips the cascade alert.
const CASCADE_ZONE_THRESHOLD: usize = 3;
/// Hard cap on buckets either side of the reference; requests whose
/// range/bandwidth ratio asks for more get a truncated grid.
pub(crate) const MAX_BUCKETS_PER_SIDE: i64 = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct HeatmapParams {
    /// Kernel radius in price units. Bucket width is half of this.
    pub bandwidth: f64,
    /// Half-width of the bucket grid around the reference price.
    pub price_range: f64,
    /// Reference price override; defaults to the most recent event price.
    pub reference_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Elevated,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Elevated => "elevated",
            RiskLevel::High => "high",
        }
    }

    fn from_intensity(intensity: f64) -> Self {
        if intensity >= HIGH_INTENSITY {
            RiskLevel::High
        } else if intensity >= ELEVATED_INTENSITY {
            RiskLevel::Elevated
        } else {
            RiskLevel::Low
        }
    }
}

/// One price-range slice of the heatmap.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapBucket {
    /// Bucket center price.
    pub price: f64,
    /// Kernel-weighted liquidation volume (base-asset units).
    pub volume: f64,
    /// Share of the hottest bucket, in `[0, 1]`.
    pub intensity: f64,
    pub risk: RiskLevel,
    /// Signed offset of the bucket center from the reference price.
    pub distance_from_reference: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapStatistics {
    pub high_risk_zones: usize,
    pub cascade_alert: bool,
    /// Sum of in-window event quantities (unweighted).
    pub total_volume: f64,
    /// Side with the larger share of volume; `None` when empty or tied.
    pub dominant_side: Option<Side>,
    pub reference_price: Option<f64>,
    pub event_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heatmap {
    pub buckets: Vec<HeatmapBucket>,
    pub statistics: HeatmapStatistics,
}

/// Build the heatmap for one window snapshot.
///
/// Degrades instead of failing: an empty window, a missing reference price,
/// or params that are not strictly positive produce an empty bucket list
/// with whatever statistics are still well-defined, and the grid never
/// exceeds [`MAX_BUCKETS_PER_SIDE`] buckets per side no matter what ratio
/// the params ask for.
pub fn generate(events: &[LiquidationEvent], params: &HeatmapParams) -> Heatmap {
    let total_volume: f64 = events.iter().map(|e| e.quantity).sum();
    let buy_volume: f64 = events
        .iter()
        .filter(|e| e.side == Side::Buy)
        .map(|e| e.quantity)
        .sum();
    let sell_volume = total_volume - buy_volume;

    let dominant_side = if buy_volume > sell_volume {
        Some(Side::Buy)
    } else if sell_volume > buy_volume {
        Some(Side::Sell)
    } else {
        None
    };

    let reference_price = params
        .reference_price
        .or_else(|| events.last().map(|e| e.price));

    let mut statistics = HeatmapStatistics {
        high_risk_zones: 0,
        cascade_alert: false,
        total_volume,
        dominant_side,
        reference_price,
        event_count: events.len(),
    };

    let Some(reference) = reference_price else {
        return Heatmap {
            buckets: Vec::new(),
            statistics,
        };
    };
    // Negated comparisons so NaN params take the empty path too
    if events.is_empty() || !(params.bandwidth > 0.0) || !(params.price_range > 0.0) {
        return Heatmap {
            buckets: Vec::new(),
            statistics,
        };
    }

    let bucket_width = params.bandwidth / 2.0;
    // Clamp while still in f64: an extreme ratio saturates the i64 cast
    // and the bucket count below would overflow.
    let n_side = (params.price_range / bucket_width)
        .ceil()
        .min(MAX_BUCKETS_PER_SIDE as f64) as i64;
    let bucket_count = (2 * n_side + 1) as usize;

    let mut volumes = vec![0.0f64; bucket_count];

    for event in events {
        // Only buckets whose centers lie within `bandwidth` of the event
        // price receive weight; everything else is skipped up front.
        let k_min = ((event.price - params.bandwidth - reference) / bucket_width).ceil() as i64;
        let k_max = ((event.price + params.bandwidth - reference) / bucket_width).floor() as i64;

        for k in k_min.max(-n_side)..=k_max.min(n_side) {
            let center = reference + k as f64 * bucket_width;
            let distance = (center - event.price).abs();
            if distance < params.bandwidth {
                let weight = 1.0 - distance / params.bandwidth;
                volumes[(k + n_side) as usize] += event.quantity * weight;
            }
        }
    }

    let max_volume = volumes.iter().cloned().fold(0.0f64, f64::max);

    let buckets: Vec<HeatmapBucket> = volumes
        .iter()
        .enumerate()
        .map(|(idx, &volume)| {
            let k = idx as i64 - n_side;
            let price = reference + k as f64 * bucket_width;
            let intensity = if max_volume > 0.0 {
                volume / max_volume
            } else {
                0.0
            };
            HeatmapBucket {
                price,
                volume,
                intensity,
                risk: RiskLevel::from_intensity(intensity),
                distance_from_reference: price - reference,
            }
        })
        .collect();

    // Zero-volume buckets classify as low but are not risk zones.
    statistics.high_risk_zones = buckets
        .iter()
        .filter(|b| b.volume > 0.0 && b.risk == RiskLevel::High)
        .count();
    statistics.cascade_alert = statistics.high_risk_zones > CASCADE_ZONE_THRESHOLD;

    Heatmap {
        buckets,
        statistics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn event(price: f64, qty: f64, side: Side, minutes_ago: i64) -> LiquidationEvent {
        LiquidationEvent::new(
            "SOLUSDT",
            side,
            price,
            qty,
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }

    fn params(bandwidth: f64, price_range: f64) -> HeatmapParams {
        HeatmapParams {
            bandwidth,
            price_range,
            reference_price: None,
        }
    }

    #[test]
    fn clustered_events_produce_one_dominant_bucket() {
        // Three liquidations within one bandwidth of each other
        let events = vec![
            event(100.0, 50.0, Side::Sell, 3),
            event(100.1, 30.0, Side::Sell, 2),
            event(100.2, 20.0, Side::Sell, 1),
        ];
        let hm = generate(&events, &params(1.0, 2.0));

        assert_eq!(hm.statistics.total_volume, 100.0);
        assert_eq!(hm.statistics.event_count, 3);
        assert_eq!(hm.statistics.dominant_side, Some(Side::Sell));
        assert_eq!(hm.statistics.reference_price, Some(100.2));

        let dominant: Vec<&HeatmapBucket> =
            hm.buckets.iter().filter(|b| b.intensity == 1.0).collect();
        assert_eq!(dominant.len(), 1, "exactly one hottest bucket");
        // The hottest bucket sits on the cluster's weighted center
        let bucket_width = 0.5;
        assert!((dominant[0].price - 100.1).abs() <= bucket_width);
        assert_eq!(dominant[0].risk, RiskLevel::High);
    }

    #[test]
    fn output_is_deterministic_for_fixed_inputs() {
        let events = vec![
            event(100.0, 50.0, Side::Sell, 3),
            event(100.4, 10.0, Side::Buy, 2),
            event(99.6, 25.0, Side::Sell, 1),
        ];
        let p = params(0.8, 3.0);

        let a = generate(&events, &p);
        let b = generate(&events, &p);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_window_degrades_to_zeroed_statistics() {
        let hm = generate(&[], &params(1.0, 5.0));
        assert!(hm.buckets.is_empty());
        assert_eq!(hm.statistics.total_volume, 0.0);
        assert_eq!(hm.statistics.high_risk_zones, 0);
        assert!(!hm.statistics.cascade_alert);
        assert_eq!(hm.statistics.dominant_side, None);
        assert_eq!(hm.statistics.reference_price, None);
    }

    #[test]
    fn non_positive_params_yield_no_buckets_but_real_statistics() {
        let events = vec![event(100.0, 10.0, Side::Buy, 1)];
        let hm = generate(&events, &params(0.0, 5.0));
        assert!(hm.buckets.is_empty());
        assert_eq!(hm.statistics.total_volume, 10.0);
        assert_eq!(hm.statistics.dominant_side, Some(Side::Buy));

        let nan = generate(&events, &params(f64::NAN, 5.0));
        assert!(nan.buckets.is_empty());
    }

    #[test]
    fn degenerate_bandwidth_ratio_truncates_the_grid() {
        // Ratio of range to bucket width is ~2e300; the grid clamps
        // instead of overflowing the bucket count.
        let events = vec![event(100.0, 10.0, Side::Sell, 1)];
        let hm = generate(&events, &params(1e-300, 1.0));

        assert_eq!(hm.buckets.len(), 2 * MAX_BUCKETS_PER_SIDE as usize + 1);
        assert_eq!(hm.statistics.total_volume, 10.0);
        assert_eq!(hm.statistics.high_risk_zones, 1);
    }

    #[test]
    fn wide_range_with_fine_bandwidth_keeps_the_grid_bounded() {
        // Finite but absurd ratio: 20k of range at 0.001-wide buckets
        // would be twenty million buckets per side uncapped.
        let events = vec![event(50_000.0, 5.0, Side::Buy, 1)];
        let hm = generate(&events, &params(0.002, 20_000.0));

        assert!(hm.buckets.len() <= 2 * MAX_BUCKETS_PER_SIDE as usize + 1);
        assert_eq!(hm.statistics.event_count, 1);
        assert_eq!(hm.statistics.total_volume, 5.0);
    }

    #[test]
    fn reference_override_recenters_the_grid() {
        let events = vec![event(100.0, 10.0, Side::Sell, 1)];
        let hm = generate(
            &events,
            &HeatmapParams {
                bandwidth: 1.0,
                price_range: 2.0,
                reference_price: Some(105.0),
            },
        );

        assert_eq!(hm.statistics.reference_price, Some(105.0));
        // Event lies outside reference ± (range + bandwidth): nothing lights up
        assert!(hm.buckets.iter().all(|b| b.volume == 0.0));
        assert_eq!(hm.statistics.high_risk_zones, 0);
    }

    #[test]
    fn kernel_weight_decays_with_distance() {
        let events = vec![event(100.0, 40.0, Side::Sell, 1)];
        let hm = generate(&events, &params(1.0, 2.0));

        let at = |price: f64| {
            hm.buckets
                .iter()
                .find(|b| (b.price - price).abs() < 1e-9)
                .unwrap()
        };

        let center = at(100.0);
        assert!((center.volume - 40.0).abs() < 1e-9);
        assert_eq!(center.risk, RiskLevel::High);

        let near = at(100.5);
        assert!((near.volume - 20.0).abs() < 1e-9);

        // One full bandwidth away the weight has decayed to zero
        let far = at(101.0);
        assert_eq!(far.volume, 0.0);
        assert_eq!(far.risk, RiskLevel::Low);
    }

    #[test]
    fn cascade_alert_requires_many_high_risk_zones() {
        // Four separated clusters of similar size produce four hottest zones
        let mut events = Vec::new();
        for (i, center) in [95.0, 100.0, 105.0, 110.0].iter().enumerate() {
            events.push(event(*center, 50.0, Side::Sell, 10 - i as i64));
        }
        let hm = generate(
            &events,
            &HeatmapParams {
                bandwidth: 1.0,
                price_range: 10.0,
                reference_price: Some(102.5),
            },
        );

        assert_eq!(hm.statistics.high_risk_zones, 4);
        assert!(hm.statistics.cascade_alert);
    }
}
