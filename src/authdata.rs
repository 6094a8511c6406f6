//! authData construction (§4.5): rpIdHash, flags, signCount, and the optional
//! attestedCredentialData block (AAGUID, credentialId, COSE public key).

use ciborium::value::Value;
use sha2::{Digest, Sha256};

/// bit 0: user presence was verified for this response.
pub const FLAG_UP: u8 = 1 << 0;
/// bit 6: attestedCredentialData is present.
pub const FLAG_AT: u8 = 1 << 6;

pub struct AttestedCredentialData {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    /// Uncompressed P-256 public key coordinates.
    pub public_key_x: [u8; 32],
    pub public_key_y: [u8; 32],
}

/// Encodes a P-256 public key as a COSE_Key CBOR map:
/// `{1: 2 (EC2), 3: -7 (ES256), -1: 1 (P-256), -2: x, -3: y}`.
pub fn encode_cose_key(x: &[u8; 32], y: &[u8; 32]) -> Vec<u8> {
    let map = Value::Map(vec![
        (Value::Integer(1.into()), Value::Integer(2.into())),
        (Value::Integer(3.into()), Value::Integer((-7).into())),
        (Value::Integer((-1).into()), Value::Integer(1.into())),
        (Value::Integer((-2).into()), Value::Bytes(x.to_vec())),
        (Value::Integer((-3).into()), Value::Bytes(y.to_vec())),
    ]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&map, &mut out).expect("COSE key map always serialises");
    out
}

pub fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    Sha256::digest(rp_id.as_bytes()).into()
}

/// Builds an authData blob: `rpIdHash(32) || flags(1) || signCount(4, BE)`, optionally
/// followed by `attestedCredentialData = aaguid(16) || credIdLen(2, BE) || credId || coseKey`.
pub fn build_auth_data(rp_id: &str, sign_count: u32, attested: Option<&AttestedCredentialData>) -> Vec<u8> {
    let mut out = Vec::with_capacity(37);
    out.extend_from_slice(&rp_id_hash(rp_id));

    let mut flags = FLAG_UP;
    if attested.is_some() {
        flags |= FLAG_AT;
    }
    out.push(flags);
    out.extend_from_slice(&sign_count.to_be_bytes());

    if let Some(attested) = attested {
        out.extend_from_slice(&attested.aaguid);
        let cred_len = attested.credential_id.len() as u16;
        out.extend_from_slice(&cred_len.to_be_bytes());
        out.extend_from_slice(&attested.credential_id);
        out.extend_from_slice(&encode_cose_key(&attested.public_key_x, &attested.public_key_y));
    }

    out
}
