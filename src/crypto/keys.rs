//! Ed25519 identity keys.
//!
//! A visor is identified by an Ed25519 public key. The same identity drives
//! Noise handshakes: the X25519 static secret is the signing key's scalar and
//! the X25519 public key is the Montgomery form of the verifying key, so peers
//! that know each other's [`PubKey`] need no second key exchange.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::core::{CryptoError, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE};

/// A visor public key (Ed25519 verifying key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PubKey([u8; PUBLIC_KEY_SIZE]);

impl PubKey {
    /// Create from raw bytes, checking they encode a curve point.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Create from a byte slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(arr)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Whether this is the all-zero placeholder key.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_SIZE]
    }

    /// Verify `sig` over `msg`.
    pub fn verify(&self, msg: &[u8], sig: &Sig) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        key.verify_strict(msg, &Signature::from_bytes(&sig.0))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// X25519 public key used as this visor's Noise static key.
    pub fn noise_public(&self) -> Result<[u8; 32], CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(key.to_montgomery().to_bytes())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(self.0))
    }
}

impl FromStr for PubKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A visor secret key (Ed25519 seed). Zeroized on drop.
#[derive(Clone)]
pub struct SecKey([u8; SECRET_KEY_SIZE]);

impl SecKey {
    /// Create from raw seed bytes.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw seed.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.0)
    }

    /// Public key belonging to this secret key.
    pub fn public_key(&self) -> PubKey {
        PubKey(self.signing_key().verifying_key().to_bytes())
    }

    /// Sign `msg`.
    pub fn sign(&self, msg: &[u8]) -> Sig {
        Sig(self.signing_key().sign(msg).to_bytes())
    }

    /// X25519 static secret used for Noise handshakes.
    pub fn noise_private(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key().to_scalar_bytes())
    }
}

impl fmt::Debug for SecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecKey(..)")
    }
}

impl Drop for SecKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl FromStr for SecKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = Zeroizing::new(hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?);
        let arr: [u8; SECRET_KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(arr))
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sig([u8; SIGNATURE_SIZE]);

impl Sig {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for Sig {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidSignature)?;
        let arr: [u8; SIGNATURE_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(arr))
    }
}

impl Serialize for Sig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A visor's long-term identity.
#[derive(Clone, Debug)]
pub struct Keypair {
    pk: PubKey,
    sk: SecKey,
}

impl Keypair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_secret(SecKey(signing.to_bytes()))
    }

    /// Rebuild an identity from its secret key.
    pub fn from_secret(sk: SecKey) -> Self {
        Self {
            pk: sk.public_key(),
            sk,
        }
    }

    /// Public key.
    pub fn pk(&self) -> PubKey {
        self.pk
    }

    /// Secret key.
    pub fn sk(&self) -> &SecKey {
        &self.sk
    }

    /// Sign `msg` with the secret key.
    pub fn sign(&self, msg: &[u8]) -> Sig {
        self.sk.sign(msg)
    }

    /// X25519 public key matching [`SecKey::noise_private`].
    pub fn noise_public(&self) -> [u8; 32] {
        let secret = StaticSecret::from(*self.sk.noise_private());
        X25519Public::from(&secret).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.pk(), kp2.pk());
        assert_eq!(kp1.sk().public_key(), kp1.pk());
    }

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"payload");

        assert!(kp.pk().verify(b"payload", &sig).is_ok());
        assert!(matches!(
            kp.pk().verify(b"other", &sig),
            Err(CryptoError::InvalidSignature)
        ));
        assert!(Keypair::generate().pk().verify(b"payload", &sig).is_err());
    }

    #[test]
    fn test_noise_keys_agree() {
        // Montgomery form of the verifying key must match the X25519 key
        // derived from the signing scalar.
        let kp = Keypair::generate();
        assert_eq!(kp.pk().noise_public().unwrap(), kp.noise_public());
    }

    #[test]
    fn test_pubkey_hex_roundtrip() {
        let pk = Keypair::generate().pk();
        let parsed: PubKey = pk.to_string().parse().unwrap();
        assert_eq!(parsed, pk);

        assert!("zz".parse::<PubKey>().is_err());
        assert!("abcd".parse::<PubKey>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"x");

        let json = serde_json::to_string(&(kp.pk(), sig)).unwrap();
        let (pk, back): (PubKey, Sig) = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, kp.pk());
        assert_eq!(back, sig);
    }

    #[test]
    fn test_secret_key_from_hex() {
        let kp = Keypair::generate();
        let sk: SecKey = hex::encode(kp.sk().as_bytes()).parse().unwrap();
        assert_eq!(Keypair::from_secret(sk).pk(), kp.pk());
    }
}
