use std::cmp::min;
use std::time::Duration;


/// Recommended back-off for a reliable channel whose send rate exceeds its cap. Dropping data
///  is not an option there, so the connection is asked to slow down instead.
///
/// While the channel stays over its cap, every flush grows the recommendation by a fixed
///  factor up to a maximum - the sequence of recommendations is monotonically non-decreasing.
///  As soon as a flush finds the rate below the cap, the back-off resets.
#[derive(Debug, Clone)]
pub struct ThrottleBackoff {
    current: Option<Duration>,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl Default for ThrottleBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(500))
    }
}

impl ThrottleBackoff {
    pub fn new(initial: Duration, max: Duration) -> ThrottleBackoff {
        let result = ThrottleBackoff {
            current: None,
            config_initial: initial,
            config_max: max,
            config_factor_eighths: 8*2,
        };
        assert!(result.config_factor_eighths >= 8);
        assert!(initial <= max);
        result
    }

    /// records the outcome of a rate check, returning the new recommendation
    pub fn on_rate_check(&mut self, over_cap: bool) -> Option<Duration> {
        if !over_cap {
            self.current = None;
            return None;
        }

        let next = match self.current {
            None => self.config_initial,
            Some(prev) => min(prev * self.config_factor_eighths / 8, self.config_max),
        };
        self.current = Some(next);
        self.current
    }

    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::initial(None, 16, true, Some(ms(5)))]
    #[case::second(Some(ms(5)), 16, true, Some(ms(10)))]
    #[case::later(Some(ms(160)), 16, true, Some(ms(320)))]
    #[case::capped(Some(ms(320)), 16, true, Some(ms(500)))]
    #[case::at_max(Some(ms(500)), 16, true, Some(ms(500)))]
    #[case::factor_1_5(Some(ms(10)), 12, true, Some(ms(15)))]
    #[case::reset_initial(None, 16, false, None)]
    #[case::reset_later(Some(ms(160)), 16, false, None)]
    #[case::reset_max(Some(ms(500)), 16, false, None)]
    fn test_on_rate_check(
        #[case] current: Option<Duration>,
        #[case] factor: u32,
        #[case] over_cap: bool,
        #[case] expected: Option<Duration>,
    ) {
        let mut backoff = ThrottleBackoff {
            current,
            config_initial: ms(5),
            config_max: ms(500),
            config_factor_eighths: factor,
        };
        assert_eq!(backoff.on_rate_check(over_cap), expected);
        assert_eq!(backoff.current(), expected);
    }

    #[test]
    fn test_monotonic_while_over_cap() {
        let mut backoff = ThrottleBackoff::default();
        let mut prev = Duration::ZERO;
        for _ in 0..100 {
            let next = backoff.on_rate_check(true).unwrap();
            assert!(next >= prev);
            prev = next;
        }
        assert_eq!(prev, ms(500));
    }
}
