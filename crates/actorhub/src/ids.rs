//! IRI minting and unguessable random tokens.

use rand::{rngs::OsRng, RngCore};

/// A random, hex-encoded token with at least 128 bits of entropy.
pub fn random_token() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

/// Mints a fresh object IRI of the form `base/type_lowercase/random_token`.
pub fn mint_object_iri(base_url: &str, object_type: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ty = object_type.to_ascii_lowercase();
    format!("{base}/{ty}/{}", random_token())
}

/// Mints a fresh actor IRI of the form `base/person/random_token`.
pub fn mint_actor_iri(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/person/{}", random_token())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_is_32_hex_chars() {
        let t = random_token();
        assert_eq!(t.len(), 32);
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(random_token(), random_token());
    }

    #[test]
    fn mint_object_iri_lowercases_type() {
        let iri = mint_object_iri("https://example.com/", "Note");
        assert!(iri.starts_with("https://example.com/note/"));
    }
}
