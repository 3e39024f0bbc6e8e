//! Relay cryptography
//!
//! Implements the per-hop transform a relay applies to relay cells:
//! - AES-128-CTR stream encryption, keystream continuing across cells
//! - SHA-1 running digests (Tor spec requirement)
//! - HKDF-SHA256 key expansion for ntor, KDF-TOR for CREATE_FAST
//!
//! ## Directions
//!
//! A relay holds one [`LayerCipher`] per direction of each circuit. Cells
//! travelling away from the client are *peeled* with the forward layer;
//! cells travelling toward the client are *sealed* (when this hop originates
//! them) or *applied* (when relaying them) with the backward layer.
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use crate::error::{RelayError, Result};
use crate::protocol::cell::{RelayCell, PAYLOAD_SIZE};
use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// ntor key expansion label
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// SHA-1 output length, also the KH / digest seed length
pub const HASH_LEN: usize = 20;

/// Circuit keys for one hop
///
/// Each circuit has separate keys for:
/// - Forward encryption (client → relay)
/// - Backward encryption (relay → client)
/// - Forward digest seed (integrity)
/// - Backward digest seed (integrity)
///
/// SECURITY: Keys are automatically zeroized when dropped to prevent
/// memory leakage of sensitive cryptographic material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward encryption key (client → relay)
    pub forward_key: [u8; 16], // AES-128

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; 16], // AES-128

    /// Forward digest seed (Df)
    pub forward_digest: [u8; HASH_LEN], // SHA-1

    /// Backward digest seed (Db)
    pub backward_digest: [u8; HASH_LEN], // SHA-1
}

impl CircuitKeys {
    /// Df | Db | Kf | Kb
    pub const KEY_MATERIAL_LEN: usize = 2 * HASH_LEN + 2 * 16;

    /// Derive circuit keys from an ntor KEY_SEED
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(PRK = KEY_SEED, m_expand)
    ///
    /// Output: Df (20) | Db (20) | Kf (16) | Kb (16) = 72 bytes
    /// ```
    ///
    /// KEY_SEED is already the output of HMAC-SHA256, so it is used directly
    /// as the PRK and the Extract step is skipped.
    pub fn derive_from_secret(key_seed: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| RelayError::KeyDerivationFailed("invalid PRK length".into()))?;

        let mut okm = [0u8; Self::KEY_MATERIAL_LEN];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| RelayError::KeyDerivationFailed("HKDF expand failed".into()))?;

        let keys = Self::from_key_material(&okm);
        okm.zeroize();
        keys
    }

    /// Split 72 bytes of key material into Df | Db | Kf | Kb
    pub fn from_key_material(okm: &[u8]) -> Result<Self> {
        if okm.len() < Self::KEY_MATERIAL_LEN {
            return Err(RelayError::KeyDerivationFailed(format!(
                "need {} bytes of key material, got {}",
                Self::KEY_MATERIAL_LEN,
                okm.len()
            )));
        }

        let mut keys = Self {
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
            forward_digest: [0u8; HASH_LEN],
            backward_digest: [0u8; HASH_LEN],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        Ok(keys)
    }

    /// Derive keys for a CREATE_FAST circuit
    ///
    /// K0 = X | Y, expanded with KDF-TOR into KH | Df | Db | Kf | Kb.
    /// Returns the keys and KH, the value both sides use to prove they
    /// derived the same material.
    pub fn from_create_fast(x: &[u8; HASH_LEN], y: &[u8; HASH_LEN]) -> Result<(Self, [u8; HASH_LEN])> {
        let mut k0 = [0u8; 2 * HASH_LEN];
        k0[..HASH_LEN].copy_from_slice(x);
        k0[HASH_LEN..].copy_from_slice(y);

        let mut okm = [0u8; HASH_LEN + Self::KEY_MATERIAL_LEN];
        let derived = kdf_tor(&k0, &mut okm);
        k0.zeroize();
        derived?;

        let mut kh = [0u8; HASH_LEN];
        kh.copy_from_slice(&okm[..HASH_LEN]);
        let keys = Self::from_key_material(&okm[HASH_LEN..]);
        okm.zeroize();
        Ok((keys?, kh))
    }
}

impl fmt::Debug for CircuitKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CircuitKeys { .. }")
    }
}

/// KDF-TOR: K = H(K0 | [00]) | H(K0 | [01]) | H(K0 | [02]) | ...
pub fn kdf_tor(k0: &[u8], out: &mut [u8]) -> Result<()> {
    if out.len() > 256 * HASH_LEN {
        return Err(RelayError::KeyDerivationFailed(
            "KDF-TOR output limited to 256 blocks".into(),
        ));
    }

    for (counter, chunk) in out.chunks_mut(HASH_LEN).enumerate() {
        let mut hasher = Sha1::new();
        hasher.update(k0);
        hasher.update([counter as u8]);
        let block = hasher.finalize();
        chunk.copy_from_slice(&block[..chunk.len()]);
    }
    Ok(())
}

/// One direction of one circuit's onion layer
///
/// Holds the AES-CTR keystream and the running SHA-1 digest. Both advance
/// with every cell and are never reset, so cells must be processed in
/// arrival order.
pub struct LayerCipher {
    cipher: Aes128Ctr,
    digest: Sha1,
    cells: u64,
}

impl LayerCipher {
    /// Create a layer from its AES key and digest seed (IV starts at zero)
    pub fn new(key: &[u8; 16], digest_seed: &[u8; HASH_LEN]) -> Self {
        let iv = [0u8; 16];
        let cipher = Aes128Ctr::new(key.into(), (&iv).into());

        let mut digest = Sha1::new();
        digest.update(digest_seed);

        Self {
            cipher,
            digest,
            cells: 0,
        }
    }

    /// Run the keystream over a payload without touching the digest
    pub fn apply(&mut self, payload: &mut [u8; PAYLOAD_SIZE]) {
        self.cipher.apply_keystream(payload);
        self.cells += 1;
    }

    /// Remove this layer and report whether the cell is addressed to this hop
    ///
    /// The digest is checked on a copy of the running state; the copy is
    /// committed only when the cell is recognized, so cells passing through
    /// do not disturb this hop's digest.
    pub fn peel(&mut self, payload: &mut [u8; PAYLOAD_SIZE]) -> bool {
        self.apply(payload);

        if payload[RelayCell::RECOGNIZED_RANGE] != [0, 0] {
            return false;
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&payload[RelayCell::DIGEST_RANGE]);

        let mut candidate = self.digest.clone();
        payload[RelayCell::DIGEST_RANGE].fill(0);
        candidate.update(&payload[..]);
        payload[RelayCell::DIGEST_RANGE].copy_from_slice(&received);

        let expected = candidate.clone().finalize();
        let recognized: bool = expected[..4].ct_eq(&received[..]).into();
        if recognized {
            self.digest = candidate;
        }
        recognized
    }

    /// Stamp the running digest into a relay payload and encrypt it
    pub fn seal(&mut self, payload: &mut [u8; PAYLOAD_SIZE]) {
        payload[RelayCell::DIGEST_RANGE].fill(0);
        self.digest.update(&payload[..]);
        let digest = self.digest.clone().finalize();
        payload[RelayCell::DIGEST_RANGE].copy_from_slice(&digest[..4]);
        self.apply(payload);
    }

    /// Number of cells this layer has transformed
    pub fn cells_processed(&self) -> u64 {
        self.cells
    }

    /// Current value of the running digest
    pub fn running_digest(&self) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&self.digest.clone().finalize());
        out
    }
}

impl Drop for LayerCipher {
    fn drop(&mut self) {
        // The AES key schedule wipes itself; the seeded digest state does not.
        Digest::reset(&mut self.digest);
        self.cells = 0;
    }
}

impl fmt::Debug for LayerCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerCipher")
            .field("cells", &self.cells)
            .finish_non_exhaustive()
    }
}

/// Both directions of a circuit's onion layer at this relay
#[derive(Debug)]
pub struct CircuitCrypto {
    /// Peels cells arriving from the client side
    pub forward: LayerCipher,
    /// Seals or applies cells heading back to the client
    pub backward: LayerCipher,
}

impl CircuitCrypto {
    pub fn new(keys: &CircuitKeys) -> Self {
        Self {
            forward: LayerCipher::new(&keys.forward_key, &keys.forward_digest),
            backward: LayerCipher::new(&keys.backward_key, &keys.backward_digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::RelayCommand;

    fn relay_payload(command: RelayCommand, data: &[u8]) -> [u8; PAYLOAD_SIZE] {
        RelayCell::new(command, 0, data.to_vec())
            .unwrap()
            .to_payload()
            .unwrap()
    }

    fn keys() -> CircuitKeys {
        CircuitKeys::derive_from_secret(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_key_derivation() {
        let secret = [0x5Cu8; 32];
        let keys = CircuitKeys::derive_from_secret(&secret).unwrap();

        // Keys should be non-zero
        assert_ne!(keys.forward_key, [0u8; 16]);
        assert_ne!(keys.backward_key, [0u8; 16]);
        assert_ne!(keys.forward_digest, [0u8; 20]);
        assert_ne!(keys.backward_digest, [0u8; 20]);

        // Derive again - should be deterministic
        let keys2 = CircuitKeys::derive_from_secret(&secret).unwrap();
        assert_eq!(keys.forward_key, keys2.forward_key);
        assert_eq!(keys.backward_key, keys2.backward_key);
    }

    #[test]
    fn test_kdf_tor_blocks() {
        let mut out = [0u8; 45];
        kdf_tor(b"k0", &mut out).unwrap();

        let mut first = Sha1::new();
        first.update(b"k0");
        first.update([0u8]);
        assert_eq!(&out[..20], first.finalize().as_slice());

        let mut third = Sha1::new();
        third.update(b"k0");
        third.update([2u8]);
        assert_eq!(&out[40..], &third.finalize()[..5]);
    }

    #[test]
    fn test_create_fast_both_sides_agree() {
        let x = [0x11u8; 20];
        let y = [0x22u8; 20];
        let (relay_keys, kh) = CircuitKeys::from_create_fast(&x, &y).unwrap();
        let (client_keys, client_kh) = CircuitKeys::from_create_fast(&x, &y).unwrap();

        assert_eq!(kh, client_kh);
        assert_eq!(relay_keys.forward_key, client_keys.forward_key);
        assert_ne!(relay_keys.forward_key, relay_keys.backward_key);
    }

    #[test]
    fn test_seal_then_peel_is_recognized() {
        let keys = keys();
        let mut client = LayerCipher::new(&keys.forward_key, &keys.forward_digest);
        let mut relay = LayerCipher::new(&keys.forward_key, &keys.forward_digest);

        for i in 0..5u8 {
            let original = relay_payload(RelayCommand::Data, &[i; 40]);
            let mut wire = original;
            client.seal(&mut wire);
            assert_ne!(wire, original);

            assert!(relay.peel(&mut wire), "cell {i} not recognized");
            assert_eq!(RelayCell::from_payload(&wire).unwrap().data, vec![i; 40]);
        }
        assert_eq!(relay.running_digest(), client.running_digest());
        assert_eq!(relay.cells_processed(), 5);
    }

    #[test]
    fn test_peel_inverts_apply() {
        let keys = keys();
        let mut sender = LayerCipher::new(&keys.backward_key, &keys.backward_digest);
        let mut receiver = LayerCipher::new(&keys.backward_key, &keys.backward_digest);

        let mut original = [0u8; PAYLOAD_SIZE];
        original[1] = 0xEE; // nonzero recognized: not for this hop
        original[100] = 42;

        let mut wire = original;
        sender.apply(&mut wire);
        assert!(!receiver.peel(&mut wire));
        assert_eq!(wire, original);
    }

    #[test]
    fn test_keystream_continues_across_cells() {
        let keys = keys();
        let mut layer = LayerCipher::new(&keys.forward_key, &keys.forward_digest);

        let mut first = [0u8; PAYLOAD_SIZE];
        let mut second = [0u8; PAYLOAD_SIZE];
        layer.apply(&mut first);
        layer.apply(&mut second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_reordered_cells_fail_digest() {
        let keys = keys();
        let mut client = LayerCipher::new(&keys.forward_key, &keys.forward_digest);

        let a = relay_payload(RelayCommand::Data, b"first");
        let b = relay_payload(RelayCommand::Data, b"second");

        // Digest only (same keystream position for both runs)
        let mut in_order = LayerCipher::new(&keys.forward_key, &keys.forward_digest);
        let mut swapped = LayerCipher::new(&keys.forward_key, &keys.forward_digest);
        let (mut a1, mut b1, mut b2, mut a2) = (a, b, b, a);
        in_order.seal(&mut a1);
        in_order.seal(&mut b1);
        swapped.seal(&mut b2);
        swapped.seal(&mut a2);
        assert_ne!(in_order.running_digest(), swapped.running_digest());

        // A relay that sees the second cell first rejects it
        let mut wire_a = a;
        let mut wire_b = b;
        client.seal(&mut wire_a);
        client.seal(&mut wire_b);
        let mut relay = LayerCipher::new(&keys.forward_key, &keys.forward_digest);
        assert!(!relay.peel(&mut wire_b));
    }

    #[test]
    fn test_tampered_cell_is_not_recognized() {
        let keys = keys();
        let mut client = LayerCipher::new(&keys.forward_key, &keys.forward_digest);
        let mut relay = LayerCipher::new(&keys.forward_key, &keys.forward_digest);
        let before = relay.running_digest();

        let mut wire = relay_payload(RelayCommand::Begin, b"example.com:80");
        client.seal(&mut wire);
        wire[20] ^= 0x01;

        assert!(!relay.peel(&mut wire));
        assert_eq!(relay.running_digest(), before, "rejected cell must not advance digest");
    }

    #[test]
    fn test_circuit_keys_zeroize() {
        let mut keys = keys();
        keys.zeroize();
        assert_eq!(keys.forward_key, [0u8; 16]);
        assert_eq!(keys.backward_digest, [0u8; 20]);
        assert_eq!(format!("{keys:?}"), "CircuitKeys { .. }");
    }
}
