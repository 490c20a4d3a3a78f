use tokio::time::Instant;

#[inline]
pub fn since_s(epoch: Instant, t: Instant) -> f64 {
    t.duration_since(epoch).as_secs_f64()
}

#[inline]
pub fn s_to_us(s: f64) -> u64 {
    if s <= 0.0 {
        0
    } else {
        (s * 1_000_000.0).round() as u64
    }
}
