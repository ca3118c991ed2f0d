//! Per-capture sampling decision.

/// Decide whether a capture should be forwarded.
///
/// `0.0` never samples, `1.0` always does; anything in between forwards
/// roughly that fraction of calls.
pub fn should_sample(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 || rate.is_nan() {
        return false;
    }
    rand::random::<f64>() < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_deterministic() {
        for _ in 0..1000 {
            assert!(!should_sample(0.0));
            assert!(should_sample(1.0));
        }
        assert!(!should_sample(-1.0));
        assert!(should_sample(2.0));
        assert!(!should_sample(f64::NAN));
    }

    #[test]
    fn test_intermediate_rate_approximates_target() {
        let trials = 20_000;
        let hits = (0..trials).filter(|_| should_sample(0.25)).count();
        let ratio = hits as f64 / trials as f64;
        // ~0.003 standard deviation at this sample size
        assert!((0.22..0.28).contains(&ratio), "ratio was {ratio}");
    }
}
