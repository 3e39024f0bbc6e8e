//! ntor handshake implementation (server side)
//!
//! Implements the relay's half of the ntor (ntor1) key exchange used by Tor
//! for circuit creation. Based on X25519 Elliptic Curve Diffie-Hellman.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//! - ntor paper: https://www.torproject.org/svn/trunk/doc/spec/proposals/216-ntor-handshake.txt
//!
//! ```text
//! client → relay:  ID (20) | B (32) | X (32)
//! relay  → client: Y (32) | AUTH (32)
//!
//! secret_input = EXP(X,y) | EXP(X,b) | ID | B | X | Y | PROTOID
//! KEY_SEED     = H(secret_input, t_key)
//! verify       = H(secret_input, t_verify)
//! auth_input   = verify | ID | B | Y | X | PROTOID | "Server"
//! AUTH         = H(auth_input, t_mac)
//! ```

use crate::error::{RelayError, Result};
use crate::protocol::crypto::CircuitKeys;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// Client handshake data length: ID | B | X
pub const ONIONSKIN_LEN: usize = 20 + 32 + 32;

/// Server reply length: Y | AUTH
pub const REPLY_LEN: usize = 32 + 32;

/// Parsed client half of an ntor handshake
#[derive(Debug, Clone)]
pub struct NtorOnionSkin {
    /// Identity fingerprint the client expects (20 bytes)
    pub identity: [u8; 20],
    /// Onion key the client encrypted to (B)
    pub onion_key: [u8; 32],
    /// Client's ephemeral public key (X)
    pub client_public: PublicKey,
}

impl NtorOnionSkin {
    /// Parse CREATE2 / EXTEND2 handshake data
    pub fn parse(hdata: &[u8]) -> Result<Self> {
        if hdata.len() != ONIONSKIN_LEN {
            return Err(RelayError::HandshakeFailed(format!(
                "ntor onionskin must be {} bytes, got {}",
                ONIONSKIN_LEN,
                hdata.len()
            )));
        }

        let mut identity = [0u8; 20];
        let mut onion_key = [0u8; 32];
        let mut client_public = [0u8; 32];
        identity.copy_from_slice(&hdata[0..20]);
        onion_key.copy_from_slice(&hdata[20..52]);
        client_public.copy_from_slice(&hdata[52..84]);

        Ok(Self {
            identity,
            onion_key,
            client_public: PublicKey::from(client_public),
        })
    }
}

/// Server's answer to an ntor handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtorReply {
    /// Server's ephemeral public key (Y)
    pub server_public: [u8; 32],
    /// Proof that the server holds the onion key (AUTH)
    pub auth: [u8; 32],
}

impl NtorReply {
    pub fn to_bytes(&self) -> [u8; REPLY_LEN] {
        let mut out = [0u8; REPLY_LEN];
        out[..32].copy_from_slice(&self.server_public);
        out[32..].copy_from_slice(&self.auth);
        out
    }
}

/// Complete the server half of ntor
///
/// `onion_secret` must be the private half of `skin.onion_key`; the caller
/// selects it from the key rotator.
///
/// SECURITY: rejects non-contributory Diffie-Hellman results, so a client
/// sending a low-order point cannot force a predictable KEY_SEED.
pub fn server_handshake(
    skin: &NtorOnionSkin,
    identity: &[u8; 20],
    onion_secret: &StaticSecret,
) -> Result<(NtorReply, CircuitKeys)> {
    let identity_matches: bool = skin.identity[..].ct_eq(&identity[..]).into();
    if !identity_matches {
        return Err(RelayError::HandshakeFailed(
            "onionskin addressed to a different relay".into(),
        ));
    }

    let onion_public = PublicKey::from(onion_secret);
    if onion_public.as_bytes() != &skin.onion_key {
        return Err(RelayError::HandshakeFailed(
            "onion secret does not match requested key".into(),
        ));
    }

    let server_secret = EphemeralSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&server_secret);

    // EXP(X,y) - server ephemeral with client's ephemeral
    let shared_xy = server_secret.diffie_hellman(&skin.client_public);
    // EXP(X,b) - onion key with client's ephemeral
    let shared_xb = onion_secret.diffie_hellman(&skin.client_public);

    if !shared_xy.was_contributory() || !shared_xb.was_contributory() {
        return Err(RelayError::HandshakeFailed(
            "non-contributory client key".into(),
        ));
    }

    let mut secret_input = Vec::with_capacity(32 * 5 + 20 + PROTOID.len());
    secret_input.extend_from_slice(shared_xy.as_bytes()); // EXP(X,y) - 32 bytes
    secret_input.extend_from_slice(shared_xb.as_bytes()); // EXP(X,b) - 32 bytes
    secret_input.extend_from_slice(identity); // ID - 20 bytes
    secret_input.extend_from_slice(&skin.onion_key); // B - 32 bytes
    secret_input.extend_from_slice(skin.client_public.as_bytes()); // X - 32 bytes
    secret_input.extend_from_slice(server_public.as_bytes()); // Y - 32 bytes
    secret_input.extend_from_slice(PROTOID);

    let derived = derive(&secret_input, identity, &skin.onion_key, &server_public, &skin.client_public);
    secret_input.zeroize();
    let (mut key_seed, auth) = derived?;

    let keys = CircuitKeys::derive_from_secret(&key_seed);
    key_seed.zeroize();

    Ok((
        NtorReply {
            server_public: server_public.to_bytes(),
            auth,
        },
        keys?,
    ))
}

/// KEY_SEED and AUTH from secret_input
fn derive(
    secret_input: &[u8],
    identity: &[u8; 20],
    onion_key: &[u8; 32],
    server_public: &PublicKey,
    client_public: &PublicKey,
) -> Result<([u8; 32], [u8; 32])> {
    let key_seed = hmac_sha256(T_KEY, &[secret_input])?;
    let mut verify = hmac_sha256(T_VERIFY, &[secret_input])?;

    let auth = hmac_sha256(
        T_MAC,
        &[
            &verify,
            identity,
            onion_key,
            server_public.as_bytes(),
            client_public.as_bytes(),
            PROTOID,
            b"Server",
        ],
    );
    verify.zeroize();

    Ok((key_seed, auth?))
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| RelayError::Crypto("HMAC key rejected".into()))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Client half, for exercising the relay in tests
#[cfg(test)]
pub(crate) struct NtorClient {
    secret: StaticSecret,
    public: PublicKey,
    identity: [u8; 20],
    onion_key: PublicKey,
}

#[cfg(test)]
impl NtorClient {
    pub(crate) fn new(identity: [u8; 20], onion_key: [u8; 32]) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            identity,
            onion_key: PublicKey::from(onion_key),
        }
    }

    /// ID | B | X
    pub(crate) fn onionskin(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(ONIONSKIN_LEN);
        data.extend_from_slice(&self.identity);
        data.extend_from_slice(self.onion_key.as_bytes());
        data.extend_from_slice(self.public.as_bytes());
        data
    }

    /// Verify the server's reply and derive the same circuit keys
    pub(crate) fn complete(&self, reply: &[u8]) -> Result<CircuitKeys> {
        let mut y = [0u8; 32];
        y.copy_from_slice(&reply[..32]);
        let server_public = PublicKey::from(y);

        let shared_yx = self.secret.diffie_hellman(&server_public);
        let shared_bx = self.secret.diffie_hellman(&self.onion_key);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.identity);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let (key_seed, auth) = derive(
            &secret_input,
            &self.identity,
            self.onion_key.as_bytes(),
            &server_public,
            &self.public,
        )?;

        let auth_valid: bool = auth[..].ct_eq(&reply[32..64]).into();
        if !auth_valid {
            return Err(RelayError::Crypto("Server AUTH verification failed".into()));
        }
        CircuitKeys::derive_from_secret(&key_seed)
    }
}
