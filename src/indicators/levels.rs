/// Recent support/resistance band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub support: f64,
    pub resistance: f64,
}

/// Lowest and highest close over the last `lookback` closes (needs at least 10)
pub fn support_resistance(closes: &[f64], lookback: usize) -> Option<Levels> {
    if closes.len() < 10 || lookback < 10 {
        return None;
    }

    let window = &closes[closes.len().saturating_sub(lookback)..];
    let support = window.iter().copied().fold(f64::INFINITY, f64::min);
    let resistance = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some(Levels {
        support,
        resistance,
    })
}
