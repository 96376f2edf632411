//! Key material and cipher primitives.
//!
//! Every agent owns one Ed25519 signing key. The X25519 key used for key
//! wrapping is derived from the signing secret, so a single 32-byte secret is
//! all that is ever sealed or wrapped. Symmetric encryption is ChaCha20-Poly1305
//! throughout; passphrases go through Argon2id, key wrapping through an
//! ephemeral X25519 exchange expanded with HKDF-SHA256.

use crate::error::CryptoError;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

const ENCRYPTION_KEY_DOMAIN: &[u8] = b"agentmesh/x25519-from-ed25519/v1";
const WRAP_INFO: &[u8] = b"agentmesh/key-wrap/v1";

/// Public half of an agent's key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKeys {
    /// Ed25519 verifying key
    pub signing: [u8; KEY_LEN],
    /// X25519 public key used as key-wrap recipient
    pub encryption: [u8; KEY_LEN],
}

/// Private key material of an unlocked agent
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.signing.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; KEY_LEN]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn public_keys(&self) -> PublicKeys {
        let encryption = PublicKey::from(&self.encryption_secret());
        PublicKeys {
            signing: self.signing.verifying_key().to_bytes(),
            encryption: encryption.to_bytes(),
        }
    }

    fn encryption_secret(&self) -> StaticSecret {
        let mut hasher = Sha256::new();
        hasher.update(ENCRYPTION_KEY_DOMAIN);
        hasher.update(self.signing.to_bytes());
        let digest: [u8; KEY_LEN] = hasher.finalize().into();
        StaticSecret::from(digest)
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Recover a key wrapped for this key pair with [`wrap_key`].
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        let ephemeral = PublicKey::from(wrapped.ephemeral);
        let shared = self.encryption_secret().diffie_hellman(&ephemeral);
        let recipient = PublicKey::from(&self.encryption_secret());
        let wrap_key = derive_wrap_key(shared.as_bytes(), &wrapped.ephemeral, recipient.as_bytes())?;
        let plain = decrypt(&wrap_key, &wrapped.sealed)?;
        secret_from_vec(plain)
    }

    pub fn open_box(&self, sealed: &RecipientBox) -> Result<Vec<u8>, CryptoError> {
        let key = self.unwrap_key(&sealed.key)?;
        decrypt(&key, &sealed.body)
    }
}

/// Verify an Ed25519 signature made by the holder of `public`.
pub fn verify(public: &PublicKeys, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(&public.signing)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::BadSignature)?;
    key.verify(message, &Signature::from_bytes(&bytes))
        .map_err(|_| CryptoError::BadSignature)
}

/// Argon2id cost parameters stored alongside a sealed key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(19 * 1024, 2, 1)
    }
}

/// ChaCha20-Poly1305 ciphertext with its nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// A private key sealed under a passphrase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub sealed: SealedBox,
}

/// A symmetric key wrapped for one recipient's X25519 key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub ephemeral: [u8; KEY_LEN],
    pub sealed: SealedBox,
}

pub fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut());
    key
}

pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(SealedBox { nonce, ciphertext })
}

pub fn decrypt(key: &[u8; KEY_LEN], sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decrypt)
}

fn passphrase_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

pub fn seal_with_passphrase(
    secret: &[u8; KEY_LEN],
    passphrase: &str,
    kdf: KdfParams,
) -> Result<SealedKey, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = passphrase_key(passphrase, &salt, &kdf)?;
    let sealed = encrypt(&key, secret)?;
    Ok(SealedKey { kdf, salt, sealed })
}

pub fn open_with_passphrase(
    sealed: &SealedKey,
    passphrase: &str,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let key = passphrase_key(passphrase, &sealed.salt, &sealed.kdf)?;
    let plain = decrypt(&key, &sealed.sealed)?;
    secret_from_vec(plain)
}

/// Wrap `key` so that only the holder of `recipient`'s private key can read it.
pub fn wrap_key(key: &[u8; KEY_LEN], recipient: &PublicKeys) -> Result<WrappedKey, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.encryption));
    let wrap_key = derive_wrap_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        &recipient.encryption,
    )?;
    Ok(WrappedKey {
        ephemeral: ephemeral_public.to_bytes(),
        sealed: encrypt(&wrap_key, key)?,
    })
}

/// Arbitrary bytes sealed for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientBox {
    pub key: WrappedKey,
    pub body: SealedBox,
}

pub fn seal_for(recipient: &PublicKeys, plaintext: &[u8]) -> Result<RecipientBox, CryptoError> {
    let key = random_key();
    Ok(RecipientBox {
        key: wrap_key(&key, recipient)?,
        body: encrypt(&key, plaintext)?,
    })
}

fn derive_wrap_key(
    shared: &[u8; KEY_LEN],
    ephemeral: &[u8; KEY_LEN],
    recipient: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut info = Vec::with_capacity(WRAP_INFO.len() + 2 * KEY_LEN);
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn secret_from_vec(plain: Vec<u8>) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let plain = Zeroizing::new(plain);
    if plain.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_LEN,
            plain.len()
        )));
    }
    let mut secret = Zeroizing::new([0u8; KEY_LEN]);
    secret.copy_from_slice(&plain);
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_kdf() -> KdfParams {
        KdfParams::new(256, 1, 1)
    }

    #[test]
    fn test_sign_and_verify() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"hello");
        assert!(verify(&pair.public_keys(), b"hello", &sig).is_ok());
        assert!(verify(&pair.public_keys(), b"hullo", &sig).is_err());
    }

    #[test]
    fn test_passphrase_seal_rejects_wrong_passphrase() {
        let pair = KeyPair::generate();
        let sealed = seal_with_passphrase(&pair.secret_bytes(), "correct", light_kdf()).unwrap();
        let opened = open_with_passphrase(&sealed, "correct").unwrap();
        assert_eq!(*opened, *pair.secret_bytes());
        assert!(matches!(
            open_with_passphrase(&sealed, "wrong"),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_wrapped_key_only_opens_for_recipient() {
        let recipient = KeyPair::generate();
        let other = KeyPair::generate();
        let key = random_key();
        let wrapped = wrap_key(&key, &recipient.public_keys()).unwrap();
        assert_eq!(*recipient.unwrap_key(&wrapped).unwrap(), *key);
        assert!(other.unwrap_key(&wrapped).is_err());
    }

    #[test]
    fn test_recipient_box() {
        let recipient = KeyPair::generate();
        let sealed = seal_for(&recipient.public_keys(), b"passphrase").unwrap();
        assert_eq!(recipient.open_box(&sealed).unwrap(), b"passphrase");
        assert!(KeyPair::generate().open_box(&sealed).is_err());
    }

    #[test]
    fn test_encryption_key_survives_secret_round_trip() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&pair.secret_bytes());
        assert_eq!(pair.public_keys(), restored.public_keys());
    }
}
