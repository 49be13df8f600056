// Convert irregular upstream samples into a fixed hourly grid.
// Pure functions of (samples, now): no clock reads in here.

use itertools::Itertools;

use crate::market_data::types::{PricePoint, COMPACT_STEP, HOURS_PER_WEEK, HOUR_MS};

/// A feed whose newest sample is older than this is treated as stale and the
/// grid is anchored at `now` instead.
pub const STALE_FEED_MS: i64 = 6 * HOUR_MS;

/// Samples outside [epoch, year 3000) are upstream garbage.
pub const MAX_TS_MS: i64 = 32_503_680_000_000;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum NormaliseError {
    #[error("no valid samples to normalise")]
    Empty,
}

pub fn floor_to_hour(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

/// Drop unusable samples, sort ascending and collapse duplicate timestamps.
/// For duplicates the last reported price wins.
pub fn sanitize(samples: &[PricePoint]) -> Vec<PricePoint> {
    let mut clean: Vec<PricePoint> = samples
        .iter()
        .copied()
        .filter(|p| p.price.is_finite() && p.price >= 0.0)
        .filter(|p| (0..MAX_TS_MS).contains(&p.ts_ms))
        .collect();
    // stable, so input order survives among equal timestamps
    clean.sort_by_key(|p| p.ts_ms);
    clean
        .into_iter()
        .coalesce(|prev, next| {
            if prev.ts_ms == next.ts_ms {
                Ok(next)
            } else {
                Err((prev, next))
            }
        })
        .collect()
}

/// Last grid boundary: the newest sample, or `now` when the feed is stale,
/// floored to the hour.
pub fn end_boundary(latest_ts_ms: i64, now_ms: i64) -> i64 {
    let end = if latest_ts_ms < now_ms - STALE_FEED_MS {
        now_ms
    } else {
        latest_ts_ms
    };
    floor_to_hour(end)
}

// Sample closest to `target` in an ascending slice. Ties go to the earlier one.
fn nearest(sorted: &[PricePoint], target: i64) -> Option<&PricePoint> {
    let idx = sorted.partition_point(|p| p.ts_ms < target);
    let before = idx.checked_sub(1).and_then(|i| sorted.get(i));
    let after = sorted.get(idx);
    match (before, after) {
        (Some(b), Some(a)) => {
            if a.ts_ms.abs_diff(target) < target.abs_diff(b.ts_ms) {
                Some(a)
            } else {
                Some(b)
            }
        }
        (b, a) => b.or(a),
    }
}

/// Exactly `HOURS_PER_WEEK` points spaced one hour apart, oldest first.
pub fn normalise_hourly(samples: &[PricePoint], now_ms: i64) -> Result<Vec<PricePoint>, NormaliseError> {
    let clean = sanitize(samples);
    let latest = clean.last().ok_or(NormaliseError::Empty)?.ts_ms;
    let end = end_boundary(latest, now_ms);
    let start = end - (HOURS_PER_WEEK as i64 - 1) * HOUR_MS;

    let mut points = vec![PricePoint::new(0, 0.0); HOURS_PER_WEEK];
    let mut carry: Option<f64> = None;
    // walk backward from the newest boundary; gaps take the newer resolved price
    for i in (0..HOURS_PER_WEEK).rev() {
        let target = start + i as i64 * HOUR_MS;
        let price = match nearest(&clean, target) {
            Some(sample) => sample.price,
            None => carry.ok_or(NormaliseError::Empty)?,
        };
        carry = Some(price);
        points[i] = PricePoint::new(target, price);
    }
    Ok(points)
}

/// Every `COMPACT_STEP`th point, starting with the first.
pub fn downsample(points: &[PricePoint]) -> Vec<PricePoint> {
    points.iter().step_by(COMPACT_STEP).copied().collect()
}
