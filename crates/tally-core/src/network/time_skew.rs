/// Offset between the server clock and the local clock, estimated from
/// request round trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSkew {
    skew_ms: i64,
    observed: bool,
}

impl TimeSkew {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously stored offset.
    pub fn from_skew(skew_ms: i64) -> Self {
        Self {
            skew_ms,
            observed: true,
        }
    }

    /// Record one round trip. The server time is assumed to be taken at the
    /// midpoint between sending the request and receiving the response.
    pub fn observe(&mut self, request_start_ms: u64, response_end_ms: u64, server_time_ms: u64) -> i64 {
        let end = response_end_ms.max(request_start_ms);
        let midpoint = request_start_ms + (end - request_start_ms) / 2;
        self.skew_ms = saturating_diff(server_time_ms, midpoint);
        self.observed = true;
        self.skew_ms
    }

    pub fn skew_ms(&self) -> i64 {
        self.skew_ms
    }

    pub fn has_observation(&self) -> bool {
        self.observed
    }

    /// Local time shifted onto the server clock.
    pub fn corrected_now_ms(&self, local_now_ms: u64) -> u64 {
        local_now_ms.saturating_add_signed(self.skew_ms)
    }
}

fn saturating_diff(a: u64, b: u64) -> i64 {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map_or(i64::MIN, |d| -d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_ahead() {
        let mut skew = TimeSkew::new();
        // Round trip 1000..1200, midpoint 1100
        assert_eq!(skew.observe(1_000, 1_200, 1_600), 500);
        assert_eq!(skew.corrected_now_ms(2_000), 2_500);
    }

    #[test]
    fn server_behind() {
        let mut skew = TimeSkew::new();
        assert_eq!(skew.observe(1_000, 1_000, 400), -600);
        assert_eq!(skew.corrected_now_ms(1_000), 400);
        assert_eq!(skew.corrected_now_ms(100), 0);
    }

    #[test]
    fn latest_observation_wins() {
        let mut skew = TimeSkew::new();
        assert!(!skew.has_observation());
        skew.observe(0, 100, 1_050);
        skew.observe(0, 100, 50);
        assert_eq!(skew.skew_ms(), 0);
        assert!(skew.has_observation());
    }

    #[test]
    fn end_before_start_is_treated_as_zero_duration() {
        let mut skew = TimeSkew::new();
        assert_eq!(skew.observe(1_000, 900, 1_010), 10);
    }

    #[test]
    fn extreme_values_saturate() {
        let mut skew = TimeSkew::new();
        assert_eq!(skew.observe(0, 0, u64::MAX), i64::MAX);
        assert_eq!(skew.corrected_now_ms(u64::MAX), u64::MAX);
    }
}
