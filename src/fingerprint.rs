//! Deterministic request fingerprints, used as the cache key and the
//! single-flight key.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Hash of the normalized (provider, model, agent, prompt) tuple. Provider
/// and model are lowercased, the prompt is trimmed, and all parts are put
/// into NFC so visually identical submissions coalesce.
pub fn fingerprint(
    provider: &str,
    model: Option<&str>,
    agent: Option<&str>,
    prompt: &str,
) -> String {
    let provider = normalize(&provider.to_lowercase());
    let model = normalize(&model.unwrap_or("").to_lowercase());
    let agent = normalize(agent.unwrap_or(""));
    let prompt = normalize(prompt.trim());

    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0x1f]);
    hasher.update(model.as_bytes());
    hasher.update([0x1f]);
    hasher.update(agent.as_bytes());
    hasher.update([0x1f]);
    hasher.update(prompt.as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn normalize(value: &str) -> String {
    value.nfc().collect()
}
