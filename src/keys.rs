//! SSH host key handling: a single Ed25519 key persisted as PKCS#8 PEM.
//! Missing or unparseable key material is regenerated and written back;
//! if the file cannot be written we still serve with an ephemeral key
//! rather than refuse to start.

use std::io::ErrorKind;
use std::path::Path;

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::SigningKey;
use pkcs8::LineEnding;
use rand::Rng;
use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData};
use russh::keys::PrivateKey;

pub fn load_or_generate(path: &Path) -> PrivateKey {
    match std::fs::read_to_string(path) {
        Ok(pem) => match SigningKey::from_pkcs8_pem(&pem) {
            Ok(key) => {
                log::debug!("loaded host key from {}", path.display());
                to_host_key(&key)
            }
            Err(err) => {
                log::warn!(
                    "host key at {} is unparseable ({err}); generating a new one",
                    path.display()
                );
                generate_and_persist(path)
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::info!("no host key at {}; generating", path.display());
            generate_and_persist(path)
        }
        Err(err) => {
            log::warn!(
                "cannot read host key at {} ({err}); using an ephemeral key",
                path.display()
            );
            to_host_key(&fresh_key())
        }
    }
}

fn fresh_key() -> SigningKey {
    let seed: [u8; 32] = rand::rng().random();
    SigningKey::from_bytes(&seed)
}

fn generate_and_persist(path: &Path) -> PrivateKey {
    let key = fresh_key();
    match key.to_pkcs8_pem(LineEnding::LF) {
        Ok(pem) => {
            if let Err(err) = std::fs::write(path, pem.as_bytes()) {
                log::warn!("failed to persist host key to {}: {err}", path.display());
            } else {
                log::debug!("wrote host key to {}", path.display());
            }
        }
        Err(err) => log::warn!("failed to encode host key: {err}"),
    }
    to_host_key(&key)
}

fn to_host_key(key: &SigningKey) -> PrivateKey {
    let pair = Ed25519Keypair::from_seed(&key.to_bytes());
    PrivateKey::new(KeypairData::Ed25519(pair), "")
        .expect("an ed25519 keypair is always representable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_persist_reload_round_trip() {
        let dir = std::env::temp_dir().join(format!("fakeserver-key-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ssh_host_ed25519_key");

        let first = load_or_generate(&path);
        let pem = std::fs::read_to_string(&path).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        let second = load_or_generate(&path);
        assert_eq!(
            first.public_key().key_data(),
            second.public_key().key_data()
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_garbage_key_file_is_replaced() {
        let dir = std::env::temp_dir().join(format!("fakeserver-badkey-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ssh_host_ed25519_key");
        std::fs::write(&path, "not a pem at all").unwrap();

        let _key = load_or_generate(&path);
        let pem = std::fs::read_to_string(&path).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
