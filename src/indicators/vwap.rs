use crate::models::Candle;

/// Volume-Weighted Average Price of the last `period` candles, using close prices
///
/// None when fewer than `period` candles exist or the window traded no volume.
pub fn calculate_vwap(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let (price_volume, volume) = candles[candles.len() - period..]
        .iter()
        .fold((0.0, 0.0), |(pv, v), c| (pv + c.close * c.volume, v + c.volume));

    if volume <= 0.0 {
        return None;
    }

    Some(price_volume / volume)
}
