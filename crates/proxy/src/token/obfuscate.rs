use sha2::{Digest, Sha256};

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Obfuscates a bearer token for logging/event attributes: a short prefix,
/// a short suffix, and a length-preserving hash of the middle — enough for
/// an operator to correlate log lines without the full secret ever being
/// written anywhere (spec.md §3's Event attribute rule).
pub fn obfuscate_bearer(bearer: &str) -> String {
	const VISIBLE: usize = 4;
	let chars: Vec<char> = bearer.chars().collect();
	let mut hasher = Sha256::new();
	hasher.update(bearer.as_bytes());
	let digest = hasher.finalize();
	let short_hash = hex(&digest[..4]);

	if chars.len() <= VISIBLE * 2 {
		return format!("***{short_hash}(len={})", chars.len());
	}
	let prefix: String = chars[..VISIBLE].iter().collect();
	let suffix: String = chars[chars.len() - VISIBLE..].iter().collect();
	format!("{prefix}…{suffix}(len={},sha={short_hash})", chars.len())
}
