//! Per-actor RSA keypair generation. Generalizes the teacher's single
//! instance-wide `load_or_generate_identity` into a fresh keypair minted for
//! every newly registered actor.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};

pub struct Keypair {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

/// Generates a fresh 2048-bit RSA keypair, PKCS#8 PEM encoded.
pub fn generate_keypair() -> Result<Keypair> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).context("generate rsa keypair")?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encode private key")?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .context("encode public key")?;

    Ok(Keypair {
        private_key_pem,
        public_key_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_valid_pem_pair() {
        let kp = generate_keypair().unwrap();
        assert!(kp.private_key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(kp.public_key_pem.contains("BEGIN PUBLIC KEY"));
        RsaPrivateKey::from_pkcs8_pem(&kp.private_key_pem).unwrap();
    }
}
