//! Monotonic, sortable, globally-unique event identifiers.
//!
//! Each id is 26 characters: the first 10 encode the current millisecond
//! Unix timestamp (48 bits), the last 16 encode 80 bits of randomness, both
//! in Crockford base32. Lexicographic order matches time order within a
//! given millisecond; the random suffix breaks ties between ids minted in
//! the same millisecond.
//!
//! # Example
//!
//! ```
//! use agent_bridge::id::generate_id;
//!
//! let a = generate_id();
//! let b = generate_id();
//! assert_eq!(a.len(), 26);
//! assert_eq!(b.len(), 26);
//! assert!(a <= b);
//! ```

use rand::RngCore;

/// Crockford base32 alphabet (excludes `I`, `L`, `O`, `U` to avoid confusion with digits).
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Number of characters used to encode the millisecond timestamp.
const TIME_CHARS: usize = 10;
/// Number of characters used to encode the random suffix.
const RANDOM_CHARS: usize = 16;

/// Generate a new 26-character sortable identifier.
///
/// The timestamp component is the current system time in milliseconds since
/// the Unix epoch, clamped to 48 bits (the format has no representation for
/// timestamps beyond roughly the year 10889, so clamping is never observed
/// in practice). The random component is drawn fresh on every call.
pub fn generate_id() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut random_bytes = [0u8; 10];
    rand::rng().fill_bytes(&mut random_bytes);
    encode(now_ms, &random_bytes)
}

/// Encode a 48-bit millisecond timestamp and 80 bits of randomness
/// (supplied as 10 bytes) into the 26-character wire format.
///
/// Split out from [`generate_id`] so the encoding itself can be tested
/// against fixed inputs without depending on the system clock or RNG.
fn encode(now_ms: u64, random_bytes: &[u8; 10]) -> String {
    let mut out = String::with_capacity(TIME_CHARS + RANDOM_CHARS);

    // 48-bit timestamp, 10 base32 symbols, most significant symbol first.
    let ts = now_ms & 0x0000_FFFF_FFFF_FFFF;
    for i in (0..TIME_CHARS).rev() {
        let shift = i * 5;
        let idx = ((ts >> shift) & 0x1F) as usize;
        out.push(ALPHABET[idx] as char);
    }

    // 80 random bits packed as 16 base32 symbols, 5 bits at a time.
    let mut bitbuf: u64 = 0;
    let mut bitcount: u32 = 0;
    let mut byte_iter = random_bytes.iter();
    for _ in 0..RANDOM_CHARS {
        while bitcount < 5 {
            let byte = *byte_iter.next().unwrap_or(&0);
            bitbuf = (bitbuf << 8) | byte as u64;
            bitcount += 8;
        }
        let shift = bitcount - 5;
        let idx = ((bitbuf >> shift) & 0x1F) as usize;
        out.push(ALPHABET[idx] as char);
        bitcount -= 5;
        bitbuf &= (1 << bitcount) - 1;
    }

    out
}
