//! Compile-time-baked attestation material (§3, §4.3, §6): the AAGUID and the
//! device-wide attestation key pair / certificate used to sign registration
//! attestations. Not per-credential.

use p256::ecdsa::SigningKey;

/// 16-byte authenticator model identifier, advertised in getInfo and in every
/// makeCredential's attestedCredentialData.
pub const AAGUID: [u8; 16] = *b"CTAPAuthCoreDemo";

/// Raw P-256 scalar for the attestation signing key. A real device bakes this in at
/// manufacturing time; here it is a fixed demo constant (never derived from the
/// per-credential wrapping key).
const ATTESTATION_PRIVATE_KEY: [u8; 32] = [
    0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18, 0x29, 0x3A, 0x4B, 0x5C, 0x6D, 0x7E, 0x8F, 0x90,
    0x01, 0x12, 0x23, 0x34, 0x45, 0x56, 0x67, 0x78, 0x89, 0x9A, 0xAB, 0xBC, 0xCD, 0xDE, 0xEF, 0x10,
];

/// A placeholder self-attestation certificate. Real X.509 issuance is out of scope
/// for this core (see DESIGN.md); the bytes below are opaque as far as the protocol
/// is concerned, appended verbatim to the REGISTER/attStmt response.
pub const ATTESTATION_CERTIFICATE: &[u8] = &[
    0x30, 0x81, 0x80, 0x02, 0x01, 0x01, 0x30, 0x0A, 0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04,
    0x03, 0x02, 0x30, 0x1B, 0x31, 0x19, 0x30, 0x17, 0x06, 0x03, 0x55, 0x04, 0x03, 0x0C, 0x10, 0x43,
    0x54, 0x41, 0x50, 0x20, 0x44, 0x65, 0x6D, 0x6F, 0x20, 0x41, 0x74, 0x74, 0x65, 0x73, 0x74, 0x1E,
    0x17, 0x0D, 0x32, 0x30, 0x30, 0x31, 0x30, 0x31, 0x30, 0x30, 0x30, 0x30, 0x30, 0x30, 0x5A, 0x17,
    0x0D, 0x33, 0x30, 0x30, 0x31, 0x30, 0x31, 0x30, 0x30, 0x30, 0x30, 0x30, 0x30, 0x5A, 0x30, 0x1B,
    0x31, 0x19, 0x30, 0x17, 0x06, 0x03, 0x55, 0x04, 0x03, 0x0C, 0x10, 0x43, 0x54, 0x41, 0x50, 0x20,
    0x44, 0x65, 0x6D, 0x6F, 0x20, 0x41, 0x74, 0x74, 0x65, 0x73, 0x74,
];

/// Returns the attestation signing key, reconstructed from the baked raw scalar.
pub fn attestation_signing_key() -> SigningKey {
    SigningKey::from_slice(&ATTESTATION_PRIVATE_KEY)
        .expect("baked attestation private key must be a valid P-256 scalar")
}
