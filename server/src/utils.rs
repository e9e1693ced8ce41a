use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::{Duration, Instant};

pub use shared::get_timestamp;

// Generate a prefixed random identifier, e.g. `room_k3J9xQ`
pub fn generate_id<R: Rng>(rng: &mut R, prefix: &str, len: usize) -> String {
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, suffix)
}

// Generate a numeric code of exactly `digits` digits without a leading zero
pub fn generate_numeric_code<R: Rng>(rng: &mut R, digits: u32) -> String {
    let digits = digits.clamp(1, 9);
    let low = 10u32.pow(digits - 1);
    let high = 10u32.pow(digits);
    rng.gen_range(low..high).to_string()
}

// Whether `instant` lies further in the past than `limit`
pub fn is_older_than(instant: Instant, limit: Duration, now: Instant) -> bool {
    now.saturating_duration_since(instant) > limit
}
