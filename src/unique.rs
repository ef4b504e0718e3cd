use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::TryRngCore;

/// Returns a short identifier for naming transient resources (leases, snapshots).
///
/// Combines the nanosecond part of the wall clock with three random bytes encoded as
/// URL-safe base64, with `_` swapped for `-` so the result is usable in resource names.
/// Never fails: if the entropy source is unavailable the suffix is built from zeroes,
/// which only reduces uniqueness.
pub fn unique_part() -> String {
    let nanos = Utc::now().timestamp_subsec_nanos();
    let mut b = [0u8; 3];
    if let Err(e) = OsRng.try_fill_bytes(&mut b) {
        log::debug!("entropy source unavailable, unique suffix degraded: {}", e);
    }
    format!("{}-{}", nanos, URL_SAFE.encode(b).replace('_', "-"))
}
