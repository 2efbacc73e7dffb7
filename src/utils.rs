use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};

pub fn time_in_ms() -> Result<u128, SystemTimeError> {
    let current_system_time = SystemTime::now();
    let duration_since_epoch = current_system_time.duration_since(UNIX_EPOCH)?;
    let milliseconds_timestamp = duration_since_epoch.as_millis();

    Ok(milliseconds_timestamp)
}

/// Tokens per second over `tokens` steps that took `start..end` milliseconds.
pub fn tokens_per_sec(tokens: usize, start: u128, end: u128) -> f64 {
    if end <= start {
        return 0.0;
    }
    tokens as f64 / (end - start) as f64 * 1000f64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tokens_per_sec() {
        assert_eq!(tokens_per_sec(10, 1000, 3000), 5.0);
        assert_eq!(tokens_per_sec(10, 1000, 1000), 0.0);
    }
}
