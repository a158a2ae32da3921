//! Identity hashes: short, stable identifiers for episodes, channels, artwork and lyrics.
//! Not cryptographic. Every value here is visible on the wire, so the encodings
//! (8-hex for episodes/channels, unsigned decimal for artwork/lyrics) must not change.

/// Maximum channel id length passed through unchanged by [`channel_hash`].
pub const SHORT_CHANNEL_ID_LEN: usize = 8;

/// CRC-32 (IEEE) of a byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn hex8(value: u32) -> String {
    format!("{value:08x}")
}

/// Episode identity: CRC-32 over `feed_url|pub_seconds|duration_seconds`, 8 lowercase hex chars.
/// Milliseconds are floored to whole seconds. No case folding on the feed URL.
pub fn episode_hash(feed_url: &str, pub_date_ms: i64, duration_ms: i64) -> String {
    let key = format!(
        "{}|{}|{}",
        feed_url,
        pub_date_ms.div_euclid(1000),
        duration_ms.div_euclid(1000)
    );
    hex8(crc32(key.as_bytes()))
}

/// Channel identity: short ids pass through, longer ones become 8 hex chars.
pub fn channel_hash(channel_id: &str) -> String {
    if channel_id.len() <= SHORT_CHANNEL_ID_LEN {
        channel_id.to_string()
    } else {
        hex8(crc32(channel_id.as_bytes()))
    }
}

/// Trim and ASCII-only lowercase, so the result never depends on the host locale.
fn normalize(part: &str) -> String {
    part.trim().to_ascii_lowercase()
}

fn pair_hash(primary: &str, secondary: &str) -> String {
    let key = format!("{}|{}", normalize(primary), normalize(secondary));
    crc32(key.as_bytes()).to_string()
}

/// Artwork identity (e.g. artist + album), unsigned decimal.
pub fn artwork_hash(primary_key: &str, secondary_key: &str) -> String {
    pair_hash(primary_key, secondary_key)
}

/// Lyrics identity (e.g. title + artist), unsigned decimal. Same scheme as artwork.
pub fn text_hash(a: &str, b: &str) -> String {
    pair_hash(a, b)
}

/// Numeric form of an identity hash, as carried in the 32-bit `contentHash` header field.
/// Decimal and 8-hex identities map back to their CRC value; anything else is CRC'd.
pub fn content_id(key: &str) -> u32 {
    if let Ok(v) = key.parse::<u32>() {
        return v;
    }
    if key.len() == 8 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(v) = u32::from_str_radix(key, 16) {
            return v;
        }
    }
    crc32(key.as_bytes())
}
