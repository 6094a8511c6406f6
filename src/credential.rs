//! Credential sealing scheme (§3): turning a relying-party-scoped key pair into a
//! sealed, stateless CredentialID, and recovering it later.

use aes::cipher::{KeyIvInit, StreamCipher};
use anyhow::{anyhow, Result};
use rand::RngCore;

pub const CRED_TYPE_PUBLIC_KEY: u8 = 1;

const RP_ID_FIELD_SIZE: usize = 254;
const USER_HANDLE_SIZE: usize = 64;
/// `{ type(1), privateKey(32), rpId(254), userHandle(64) }`
pub const CRED_SOURCE_SIZE: usize = 1 + 32 + RP_ID_FIELD_SIZE + USER_HANDLE_SIZE;
/// `iv(16) || AES-CTR-128(CredentialSource)`
pub const CREDENTIAL_ID_SIZE: usize = 16 + CRED_SOURCE_SIZE;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// The authenticator's per-credential secret bundle (§3).
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSource {
    pub cred_type: u8,
    pub private_key: [u8; 32],
    rp_id_field: [u8; RP_ID_FIELD_SIZE],
    pub user_handle: [u8; USER_HANDLE_SIZE],
}

/// Encodes an rpId string into the fixed, NUL-terminated field used inside a
/// CredentialSource. Longer ids are truncated to fit, matching the reference
/// parser's "it's okay to truncate" handling of oversized rp.id/rp.name fields.
fn encode_rp_id_field(rp_id: &str) -> [u8; RP_ID_FIELD_SIZE] {
    let mut field = [0u8; RP_ID_FIELD_SIZE];
    let bytes = rp_id.as_bytes();
    let len = bytes.len().min(RP_ID_FIELD_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

impl CredentialSource {
    pub fn new(rp_id: &str, user_handle: &[u8], private_key: [u8; 32]) -> Self {
        let mut user_handle_field = [0u8; USER_HANDLE_SIZE];
        let len = user_handle.len().min(USER_HANDLE_SIZE);
        user_handle_field[..len].copy_from_slice(&user_handle[..len]);
        Self {
            cred_type: CRED_TYPE_PUBLIC_KEY,
            private_key,
            rp_id_field: encode_rp_id_field(rp_id),
            user_handle: user_handle_field,
        }
    }

    /// Whether this source's rpId field matches the given rpId, under the same
    /// truncation rule applied at creation time.
    pub fn rp_id_matches(&self, rp_id: &str) -> bool {
        self.rp_id_field == encode_rp_id_field(rp_id)
    }

    fn to_bytes(&self) -> [u8; CRED_SOURCE_SIZE] {
        let mut out = [0u8; CRED_SOURCE_SIZE];
        out[0] = self.cred_type;
        out[1..33].copy_from_slice(&self.private_key);
        out[33..33 + RP_ID_FIELD_SIZE].copy_from_slice(&self.rp_id_field);
        out[33 + RP_ID_FIELD_SIZE..].copy_from_slice(&self.user_handle);
        out
    }

    fn from_bytes(bytes: &[u8; CRED_SOURCE_SIZE]) -> Self {
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&bytes[1..33]);
        let mut rp_id_field = [0u8; RP_ID_FIELD_SIZE];
        rp_id_field.copy_from_slice(&bytes[33..33 + RP_ID_FIELD_SIZE]);
        let mut user_handle = [0u8; USER_HANDLE_SIZE];
        user_handle.copy_from_slice(&bytes[33 + RP_ID_FIELD_SIZE..]);
        Self { cred_type: bytes[0], private_key, rp_id_field, user_handle }
    }
}

/// Seals a CredentialSource into its on-the-wire CredentialID: `iv || AES-CTR-128(key, iv, source)`.
/// Non-deterministic: the low 8 bytes of the IV are a fresh random nonce on every call.
pub fn seal(wrapping_key: &[u8; 16], source: &CredentialSource) -> Vec<u8> {
    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv[..8]);
    // iv[8..16] stays zero: the CTR counter starts at zero for each fresh nonce.

    let mut buf = source.to_bytes();
    let mut cipher = Aes128Ctr::new(wrapping_key.into(), (&iv).into());
    cipher.apply_keystream(&mut buf);

    let mut out = Vec::with_capacity(CREDENTIAL_ID_SIZE);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    out
}

/// Unseals a CredentialID back into its CredentialSource. Does not itself check
/// that the recovered rpId matches anything; callers perform that check (§3 invariant).
pub fn unseal(wrapping_key: &[u8; 16], credential_id: &[u8]) -> Result<CredentialSource> {
    if credential_id.len() != CREDENTIAL_ID_SIZE {
        return Err(anyhow!(
            "credential id has wrong length: {} (expected {})",
            credential_id.len(),
            CREDENTIAL_ID_SIZE
        ));
    }
    let iv = &credential_id[..16];
    let mut buf = [0u8; CRED_SOURCE_SIZE];
    buf.copy_from_slice(&credential_id[16..]);

    let mut cipher = Aes128Ctr::new(wrapping_key.into(), iv.into());
    cipher.apply_keystream(&mut buf);

    Ok(CredentialSource::from_bytes(&buf))
}
