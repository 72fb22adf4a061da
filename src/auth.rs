//! Pre-shared token authentication for the WebSocket upgrade.
//!
//! The bridge exposes a single client entry point (`GET /api/ws?token=<key>`),
//! and browsers can't set headers on WebSocket upgrades, so the token rides
//! as a query parameter and is checked before the upgrade completes.

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected key length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}
