use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

fn to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
}

/// Round a quantity DOWN to a multiple of `step` (never sends more than was sized)
pub fn floor_to_step(qty: f64, step: f64) -> f64 {
    match (to_decimal(qty), to_decimal(step)) {
        (Some(q), Some(s)) if !s.is_zero() => {
            ((q / s).floor() * s).normalize().to_f64().unwrap_or(0.0)
        }
        _ => qty,
    }
}

/// Round a price to the NEAREST multiple of `tick`
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    match (to_decimal(price), to_decimal(tick)) {
        (Some(p), Some(t)) if !t.is_zero() => {
            ((p / t).round() * t).normalize().to_f64().unwrap_or(price)
        }
        _ => price,
    }
}

/// Render a number for the exchange without float noise ("0.4", not "0.39999999999999997")
pub fn format_decimal(value: f64) -> String {
    match to_decimal(value) {
        Some(d) => d.round_dp(10).normalize().to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(0.4567, 0.001), 0.456);
        assert_eq!(floor_to_step(10.999, 1.0), 10.0);
        assert_eq!(floor_to_step(0.0009, 0.001), 0.0);
        assert_eq!(floor_to_step(125.0, 100.0), 100.0);
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(100.16, 0.1), 100.2);
        assert_eq!(round_to_tick(30139.6049, 0.01), 30139.6);
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(0.1 + 0.2), "0.3");
        assert_eq!(format_decimal(30000.0), "30000");
        assert_eq!(format_decimal(0.001), "0.001");
    }
}
