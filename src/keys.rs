//! Relay identity and onion key rotation
//!
//! A relay has two kinds of long-lived key:
//! - an **identity key** (ed25519) that names the relay; its SHA-1 digest is
//!   the 20-byte fingerprint clients put in CREATE2 onionskins
//! - a medium-term **onion key** (x25519) used by the ntor handshake
//!
//! The onion key rotates on an external schedule. After a rotation the
//! previous key stays usable for a configured overlap, so a client that built
//! its onionskin from an older descriptor still completes its handshake.
//!
//! Every replaced key is honoured until its own overlap ends, so rotating
//! twice inside one overlap does not strand clients of the older descriptor.
//!
//! SECURITY: secrets live only in `SigningKey` / `StaticSecret`, both of which
//! zeroize on drop. Lookups refuse a retired key once its overlap ends; the
//! key itself is dropped by the next rotation or maintenance purge.

use crate::error::{RelayError, Result};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// The relay's long-term identity
pub struct RelayIdentity {
    signing_key: SigningKey,
    fingerprint: [u8; 20],
}

impl RelayIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild an identity from its 32-byte secret
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let digest = Sha1::digest(signing_key.verifying_key().as_bytes());
        let mut fingerprint = [0u8; 20];
        fingerprint.copy_from_slice(&digest);
        Self {
            signing_key,
            fingerprint,
        }
    }

    /// 20-byte identity fingerprint
    pub fn fingerprint(&self) -> &[u8; 20] {
        &self.fingerprint
    }

    /// Fingerprint as uppercase hex, the way directories print it
    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(self.fingerprint)
    }

    pub fn ed25519_public(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// ed25519 identity, base64 without padding
    pub fn ed25519_base64(&self) -> String {
        general_purpose::STANDARD_NO_PAD.encode(self.ed25519_public().as_bytes())
    }
}

impl fmt::Debug for RelayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayIdentity")
            .field("fingerprint", &self.fingerprint_hex())
            .finish_non_exhaustive()
    }
}

/// What a rotation publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKeyDescriptor {
    /// New ntor onion key, base64
    pub ntor_onion_key: String,
    /// Unix seconds when the key was generated
    pub generated_at: u64,
    /// Unix seconds after which the replaced key stops working
    pub previous_expires_at: Option<u64>,
}

struct OnionKeyPair {
    secret: StaticSecret,
    public: [u8; 32],
    generated_at: SystemTime,
}

struct RetiredKey {
    pair: OnionKeyPair,
    expires: Instant,
}

struct KeyRing {
    current: OnionKeyPair,
    /// Oldest first
    retired: Vec<RetiredKey>,
}

impl KeyRing {
    fn has_expired(&self, now: Instant) -> bool {
        self.retired.iter().any(|old| old.expires <= now)
    }

    /// Drop retired keys whose overlap has ended; returns how many went
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.retired.len();
        self.retired.retain(|old| old.expires > now);
        before - self.retired.len()
    }
}

/// Current and retired onion keys
///
/// Read by every CREATE2 handshake, written only by [`KeyRotator::rotate`]
/// and [`KeyRotator::purge_expired`].
pub struct KeyRotator {
    ring: RwLock<KeyRing>,
    overlap: Duration,
}

impl KeyRotator {
    /// Create a rotator holding a freshly generated onion key
    pub fn new(overlap: Duration) -> Result<Self> {
        Ok(Self {
            ring: RwLock::new(KeyRing {
                current: generate_onion_key()?,
                retired: Vec::new(),
            }),
            overlap,
        })
    }

    /// Replace the onion key, keeping the old one for the overlap period
    ///
    /// A failure leaves the current key in place; handshakes keep working
    /// and the next scheduled rotation tries again.
    pub fn rotate(&self) -> Result<NewKeyDescriptor> {
        let fresh = generate_onion_key()?;
        let now = Instant::now();

        let mut ring = self.write()?;
        let expired = ring.prune(now);
        if expired > 0 {
            log::debug!("Dropped {} onion key(s) past their overlap", expired);
        }

        let replaced = std::mem::replace(&mut ring.current, fresh);
        let previous_expires_at = unix_secs(SystemTime::now() + self.overlap);
        ring.retired.push(RetiredKey {
            pair: replaced,
            expires: now + self.overlap,
        });

        let descriptor = NewKeyDescriptor {
            ntor_onion_key: general_purpose::STANDARD_NO_PAD.encode(ring.current.public),
            generated_at: unix_secs(ring.current.generated_at),
            previous_expires_at: Some(previous_expires_at),
        };
        log::info!("🔑 Rotated onion key to {}", descriptor.ntor_onion_key);
        Ok(descriptor)
    }

    /// Public half of the current onion key
    pub fn current_public(&self) -> Result<[u8; 32]> {
        Ok(self.read()?.current.public)
    }

    /// Public half of the most recently replaced onion key, if still inside its overlap
    pub fn previous_public(&self) -> Result<Option<[u8; 32]>> {
        let now = Instant::now();
        Ok(self
            .read()?
            .retired
            .iter()
            .rev()
            .find(|old| old.expires > now)
            .map(|old| old.pair.public))
    }

    /// Secret for the onion key a client named, if this relay still honours it
    pub fn secret_for(&self, onion_key: &[u8; 32]) -> Result<Option<StaticSecret>> {
        let now = Instant::now();
        let ring = self.read()?;
        if &ring.current.public == onion_key {
            return Ok(Some(ring.current.secret.clone()));
        }
        Ok(ring
            .retired
            .iter()
            .find(|old| old.expires > now && &old.pair.public == onion_key)
            .map(|old| old.pair.secret.clone()))
    }

    /// Drop retired keys whose overlap has ended; returns how many went
    ///
    /// Takes the write lock only when something has actually expired.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        if !self.read()?.has_expired(now) {
            return Ok(0);
        }
        let expired = self.write()?.prune(now);
        if expired > 0 {
            log::debug!("Dropped {} onion key(s) past their overlap", expired);
        }
        Ok(expired)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KeyRing>> {
        self.ring
            .read()
            .map_err(|_| RelayError::KeyRotation("key ring lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KeyRing>> {
        self.ring
            .write()
            .map_err(|_| RelayError::KeyRotation("key ring lock poisoned".into()))
    }
}

impl fmt::Debug for KeyRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotator")
            .field("overlap", &self.overlap)
            .finish_non_exhaustive()
    }
}

fn generate_onion_key() -> Result<OnionKeyPair> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| RelayError::KeyRotation(format!("OS randomness unavailable: {}", e)))?;

    if let Err(e) = validate_entropy(&bytes) {
        bytes.zeroize();
        return Err(e);
    }

    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    let public = PublicKey::from(&secret).to_bytes();

    Ok(OnionKeyPair {
        secret,
        public,
        generated_at: SystemTime::now(),
    })
}

/// Validate that random bytes have sufficient entropy
///
/// SECURITY: Detects obvious RNG failures (all zeros, all ones, repeated patterns)
fn validate_entropy(bytes: &[u8]) -> Result<()> {
    if bytes.iter().all(|&b| b == 0) {
        return Err(RelayError::KeyRotation("RNG failure: all zeros".into()));
    }

    if bytes.iter().all(|&b| b == 0xFF) {
        return Err(RelayError::KeyRotation("RNG failure: all ones".into()));
    }

    let unique_bytes: HashSet<u8> = bytes.iter().copied().collect();
    if unique_bytes.len() < 8 {
        return Err(RelayError::KeyRotation(format!(
            "RNG failure: low entropy ({} unique bytes)",
            unique_bytes.len()
        )));
    }

    Ok(())
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fingerprint_is_sha1_of_key() {
        let identity = RelayIdentity::from_secret_bytes(&[9u8; 32]);
        let expected = Sha1::digest(identity.ed25519_public().as_bytes());
        assert_eq!(identity.fingerprint().as_slice(), expected.as_slice());
        assert_eq!(identity.fingerprint_hex().len(), 40);
        assert_eq!(
            identity.fingerprint_hex(),
            identity.fingerprint_hex().to_uppercase()
        );

        let again = RelayIdentity::from_secret_bytes(&[9u8; 32]);
        assert_eq!(identity.fingerprint(), again.fingerprint());
    }

    #[test]
    fn test_rotation_keeps_previous_within_overlap() {
        let rotator = KeyRotator::new(Duration::from_secs(3600)).unwrap();
        let first = rotator.current_public().unwrap();

        let descriptor = rotator.rotate().unwrap();
        let second = rotator.current_public().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            descriptor.ntor_onion_key,
            general_purpose::STANDARD_NO_PAD.encode(second)
        );
        assert!(descriptor.previous_expires_at.is_some());

        assert!(rotator.secret_for(&first).unwrap().is_some());
        assert!(rotator.secret_for(&second).unwrap().is_some());
        assert_eq!(rotator.previous_public().unwrap(), Some(first));
    }

    #[test]
    fn test_expired_previous_key_is_refused() {
        let rotator = KeyRotator::new(Duration::ZERO).unwrap();
        let first = rotator.current_public().unwrap();
        rotator.rotate().unwrap();

        assert!(rotator.secret_for(&first).unwrap().is_none());
        assert_eq!(rotator.previous_public().unwrap(), None);
    }

    #[test]
    fn test_two_rotations_inside_overlap_keep_both_old_keys() {
        let rotator = KeyRotator::new(Duration::from_secs(3600)).unwrap();
        let first = rotator.current_public().unwrap();
        let descriptor = rotator.rotate().unwrap();
        let second = rotator.current_public().unwrap();
        rotator.rotate().unwrap();
        let third = rotator.current_public().unwrap();

        // The first descriptor promised `first` until this time
        assert!(descriptor.previous_expires_at.is_some());
        assert!(rotator.secret_for(&first).unwrap().is_some());
        assert!(rotator.secret_for(&second).unwrap().is_some());
        assert!(rotator.secret_for(&third).unwrap().is_some());
        assert_eq!(rotator.previous_public().unwrap(), Some(second));
        assert_eq!(rotator.purge_expired().unwrap(), 0);
        assert_eq!(rotator.ring.read().unwrap().retired.len(), 2);
    }

    #[test]
    fn test_retired_keys_are_purged_after_overlap() {
        let rotator = KeyRotator::new(Duration::from_millis(50)).unwrap();
        let first = rotator.current_public().unwrap();
        rotator.rotate().unwrap();
        let second = rotator.current_public().unwrap();
        assert!(rotator.secret_for(&first).unwrap().is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert!(rotator.secret_for(&first).unwrap().is_none());
        assert_eq!(rotator.purge_expired().unwrap(), 1);
        assert!(rotator.ring.read().unwrap().retired.is_empty());
        assert_eq!(rotator.purge_expired().unwrap(), 0);
        assert!(rotator.secret_for(&second).unwrap().is_some());

        // Rotation also clears whatever has lapsed
        rotator.rotate().unwrap();
        std::thread::sleep(Duration::from_millis(80));
        rotator.rotate().unwrap();
        assert_eq!(rotator.ring.read().unwrap().retired.len(), 1);
    }

    #[test]
    fn test_secret_matches_public() {
        let rotator = KeyRotator::new(Duration::from_secs(60)).unwrap();
        let public = rotator.current_public().unwrap();
        let secret = rotator.secret_for(&public).unwrap().unwrap();
        assert_eq!(PublicKey::from(&secret).to_bytes(), public);
    }

    #[test]
    fn test_entropy_validation() {
        assert!(validate_entropy(&[0u8; 32]).is_err());
        assert!(validate_entropy(&[0xFFu8; 32]).is_err());
        assert!(validate_entropy(&[1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3]).is_err());

        let good: Vec<u8> = (0u8..32).collect();
        assert!(validate_entropy(&good).is_ok());
    }
}
