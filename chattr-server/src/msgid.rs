//! ULID-based identifiers for users and messages.
//!
//! Every persisted record gets a globally unique, time-sortable id.
//! Format: 26-character Crockford base32 string.
//!
//! Structure: 48 bits timestamp (ms since epoch) + 80 bits random.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a new ULID string.
pub fn generate() -> String {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut out = String::with_capacity(26);

    // Timestamp: 10 chars, most significant first
    for i in (0..10).rev() {
        let idx = (now_ms >> (i * 5)) & 0x1F;
        out.push(CROCKFORD[idx as usize] as char);
    }

    // Randomness: 80 bits → 16 chars
    let r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for i in (0..16).rev() {
        let idx = (r >> (i * 5)) & 0x1F;
        out.push(CROCKFORD[idx as usize] as char);
    }

    out
}

/// Cheap shape check used before hitting the store with client-supplied ids.
pub fn looks_valid(id: &str) -> bool {
    id.len() == 26 && id.bytes().all(|b| CROCKFORD.contains(&b))
}
