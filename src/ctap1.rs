//! CTAP1/U2F APDU interpreter (§4.3): REGISTER, AUTHENTICATE, VERSION.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;

use crate::attestation::{attestation_signing_key, ATTESTATION_CERTIFICATE};
use crate::der::encode_der_signature;
use crate::error::Ctap1Status;
use crate::presence::UserPresence;
use crate::store::{load_or_init_counter, persist_counter, RecordStore};

const INS_REGISTER: u8 = 0x01;
const INS_AUTHENTICATE: u8 = 0x02;
const INS_VERSION: u8 = 0x03;

const P1_CHECK_ONLY: u8 = 0x07;
const VERSION_TAG: &[u8] = b"U2F_V2";

struct Apdu<'a> {
    ins: u8,
    p1: u8,
    body: &'a [u8],
}

fn parse_apdu(data: &[u8]) -> Result<Apdu<'_>, Ctap1Status> {
    if data.len() < 7 {
        return Err(Ctap1Status::WrongLength);
    }
    let cla = data[0];
    if cla != 0x00 {
        return Err(Ctap1Status::ClaNotSupported);
    }
    let ins = data[1];
    let p1 = data[2];
    let lc = ((data[4] as usize) << 16) | ((data[5] as usize) << 8) | (data[6] as usize);
    let body = &data[7..];
    if body.len() < lc {
        return Err(Ctap1Status::WrongLength);
    }
    Ok(Apdu { ins, p1, body: &body[..lc] })
}

fn aes_ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = aes::Aes128::new(key.into());
    let mut out = data.to_vec();
    for block in out.chunks_mut(16) {
        cipher.encrypt_block(block.into());
    }
    out
}

fn aes_ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let cipher = aes::Aes128::new(key.into());
    let mut out = data.to_vec();
    for block in out.chunks_mut(16) {
        cipher.decrypt_block(block.into());
    }
    out
}

fn sign_with(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let sig: Signature = key.sign(message);
    let bytes = sig.to_bytes();
    let r: [u8; 32] = bytes[..32].try_into().unwrap();
    let s: [u8; 32] = bytes[32..].try_into().unwrap();
    encode_der_signature(&r, &s)
}

/// Handles REGISTER (§4.3). `chal || appId` (64 bytes) in, response body + status word out.
fn register(body: &[u8], wrapping_key: &[u8; 16], presence: &mut dyn UserPresence) -> (Vec<u8>, Ctap1Status) {
    if body.len() != 64 {
        return (Vec::new(), Ctap1Status::WrongLength);
    }
    if !presence.is_present() {
        return (Vec::new(), Ctap1Status::ConditionsNotSatisfied);
    }
    let chal = &body[..32];
    let app_id = &body[32..64];

    let signing_key = SigningKey::random(&mut OsRng);
    let private_key_bytes: [u8; 32] = signing_key.to_bytes().into();
    let point = signing_key.verifying_key().to_encoded_point(false);
    let x = point.x().expect("uncompressed point has x");
    let y = point.y().expect("uncompressed point has y");

    let mut handle_plain = [0u8; 64];
    handle_plain[..32].copy_from_slice(&private_key_bytes);
    handle_plain[32..].copy_from_slice(app_id);
    let key_handle = aes_ecb_encrypt(wrapping_key, &handle_plain);

    let mut signed_over = Vec::with_capacity(1 + 32 + 32 + key_handle.len() + 1 + 64);
    signed_over.push(0x00);
    signed_over.extend_from_slice(app_id);
    signed_over.extend_from_slice(chal);
    signed_over.extend_from_slice(&key_handle);
    signed_over.push(0x04);
    signed_over.extend_from_slice(x);
    signed_over.extend_from_slice(y);
    let sig = sign_with(&attestation_signing_key(), &signed_over);

    let mut out = Vec::with_capacity(1 + 1 + 64 + 1 + key_handle.len() + ATTESTATION_CERTIFICATE.len() + sig.len());
    out.push(0x05);
    out.push(0x04);
    out.extend_from_slice(x);
    out.extend_from_slice(y);
    out.push(key_handle.len() as u8);
    out.extend_from_slice(&key_handle);
    out.extend_from_slice(ATTESTATION_CERTIFICATE);
    out.extend_from_slice(&sig);
    (out, Ctap1Status::NoError)
}

/// Handles AUTHENTICATE (§4.3). `chal || appId || keyHandleLen || keyHandle` in.
fn authenticate(
    body: &[u8],
    p1: u8,
    wrapping_key: &[u8; 16],
    presence: &mut dyn UserPresence,
    store: &mut dyn RecordStore,
) -> (Vec<u8>, Ctap1Status) {
    if body.len() < 65 {
        return (Vec::new(), Ctap1Status::WrongLength);
    }
    let chal = &body[..32];
    let app_id = &body[32..64];
    let key_handle_len = body[64] as usize;
    if body.len() != 65 + key_handle_len || key_handle_len != 64 {
        return (Vec::new(), Ctap1Status::WrongLength);
    }
    let key_handle = &body[65..65 + key_handle_len];

    let plain = aes_ecb_decrypt(wrapping_key, key_handle);
    let private_key_bytes = &plain[..32];
    let recovered_app_id = &plain[32..64];
    if recovered_app_id != app_id {
        return (Vec::new(), Ctap1Status::WrongData);
    }

    let check_only = p1 == P1_CHECK_ONLY;
    if !check_only && !presence.is_present() {
        return (Vec::new(), Ctap1Status::ConditionsNotSatisfied);
    }

    let counter = match load_or_init_counter(store) {
        Ok(c) => c,
        Err(_) => return (Vec::new(), Ctap1Status::WrongData),
    };
    let counter = counter.wrapping_add(1);
    if persist_counter(store, counter).is_err() {
        return (Vec::new(), Ctap1Status::WrongData);
    }

    let flags: u8 = 0x01;
    let mut signed_over = Vec::with_capacity(32 + 1 + 4 + 32);
    signed_over.extend_from_slice(app_id);
    signed_over.push(flags);
    signed_over.extend_from_slice(&counter.to_be_bytes());
    signed_over.extend_from_slice(chal);

    let signing_key = match SigningKey::from_slice(private_key_bytes) {
        Ok(k) => k,
        Err(_) => return (Vec::new(), Ctap1Status::WrongData),
    };
    let sig = sign_with(&signing_key, &signed_over);

    let mut out = Vec::with_capacity(1 + 4 + sig.len());
    out.push(flags);
    out.extend_from_slice(&counter.to_be_bytes());
    out.extend_from_slice(&sig);
    (out, Ctap1Status::NoError)
}

/// Entry point for CTAPHID_MSG: dispatches a raw APDU and returns `body || SW`.
pub fn handle_apdu(
    data: &[u8],
    wrapping_key: &[u8; 16],
    presence: &mut dyn UserPresence,
    store: &mut dyn RecordStore,
) -> Vec<u8> {
    let (body, status) = match parse_apdu(data) {
        Ok(apdu) => match apdu.ins {
            INS_REGISTER => register(apdu.body, wrapping_key, presence),
            INS_AUTHENTICATE => authenticate(apdu.body, apdu.p1, wrapping_key, presence, store),
            INS_VERSION => {
                if apdu.body.is_empty() {
                    (VERSION_TAG.to_vec(), Ctap1Status::NoError)
                } else {
                    (Vec::new(), Ctap1Status::WrongLength)
                }
            }
            _ => (Vec::new(), Ctap1Status::InsNotSupported),
        },
        Err(status) => (Vec::new(), status),
    };

    let mut out = body;
    out.extend_from_slice(&status.sw().to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{AlwaysPresent, ScriptedPresence};
    use crate::store::MemoryRecordStore;

    fn key() -> [u8; 16] {
        [0x11; 16]
    }

    fn build_apdu(ins: u8, p1: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, ins, p1, 0x00];
        out.push((body.len() >> 16) as u8);
        out.push((body.len() >> 8) as u8);
        out.push(body.len() as u8);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn version_returns_tag_and_success() {
        let mut presence = AlwaysPresent;
        let mut store = MemoryRecordStore::default();
        let apdu = build_apdu(INS_VERSION, 0, &[]);
        let resp = handle_apdu(&apdu, &key(), &mut presence, &mut store);
        assert_eq!(&resp[..resp.len() - 2], VERSION_TAG);
        assert_eq!(&resp[resp.len() - 2..], &0x9000u16.to_be_bytes());
    }

    #[test]
    fn unknown_instruction_is_rejected() {
        let mut presence = AlwaysPresent;
        let mut store = MemoryRecordStore::default();
        let apdu = build_apdu(0xEE, 0, &[]);
        let resp = handle_apdu(&apdu, &key(), &mut presence, &mut store);
        assert_eq!(&resp[resp.len() - 2..], &Ctap1Status::InsNotSupported.sw().to_be_bytes());
    }

    #[test]
    fn register_requires_user_presence() {
        let mut presence = ScriptedPresence::default();
        let mut store = MemoryRecordStore::default();
        let apdu = build_apdu(INS_REGISTER, 0, &[0u8; 64]);
        let resp = handle_apdu(&apdu, &key(), &mut presence, &mut store);
        assert_eq!(&resp[resp.len() - 2..], &Ctap1Status::ConditionsNotSatisfied.sw().to_be_bytes());
    }

    #[test]
    fn register_then_authenticate_round_trip() {
        let mut presence = AlwaysPresent;
        let mut store = MemoryRecordStore::default();
        let chal = [0x01u8; 32];
        let app_id = [0x02u8; 32];
        let mut register_body = Vec::new();
        register_body.extend_from_slice(&chal);
        register_body.extend_from_slice(&app_id);
        let reg_apdu = build_apdu(INS_REGISTER, 0, &register_body);
        let reg_resp = handle_apdu(&reg_apdu, &key(), &mut presence, &mut store);
        assert_eq!(&reg_resp[reg_resp.len() - 2..], &0x9000u16.to_be_bytes());
        assert_eq!(reg_resp[0], 0x05);

        let key_handle_len = reg_resp[2 + 64] as usize;
        let key_handle = &reg_resp[3 + 64..3 + 64 + key_handle_len];

        let mut auth_body = Vec::new();
        auth_body.extend_from_slice(&chal);
        auth_body.extend_from_slice(&app_id);
        auth_body.push(key_handle_len as u8);
        auth_body.extend_from_slice(key_handle);
        let auth_apdu = build_apdu(INS_AUTHENTICATE, 0x03, &auth_body);
        let auth_resp = handle_apdu(&auth_apdu, &key(), &mut presence, &mut store);
        assert_eq!(&auth_resp[auth_resp.len() - 2..], &0x9000u16.to_be_bytes());
        assert_eq!(auth_resp[0], 0x01);
        let counter = u32::from_be_bytes([auth_resp[1], auth_resp[2], auth_resp[3], auth_resp[4]]);
        assert_eq!(counter, 1);
    }

    #[test]
    fn authenticate_with_foreign_key_handle_is_rejected() {
        let mut presence = AlwaysPresent;
        let mut store = MemoryRecordStore::default();
        let other_key = [0x55u8; 16];
        let chal = [0x01u8; 32];
        let app_id = [0x02u8; 32];
        let mut register_body = Vec::new();
        register_body.extend_from_slice(&chal);
        register_body.extend_from_slice(&app_id);
        let reg_apdu = build_apdu(INS_REGISTER, 0, &register_body);
        let reg_resp = handle_apdu(&reg_apdu, &other_key, &mut presence, &mut store);
        let key_handle_len = reg_resp[2 + 64] as usize;
        let key_handle = &reg_resp[3 + 64..3 + 64 + key_handle_len];

        let mut auth_body = Vec::new();
        auth_body.extend_from_slice(&chal);
        auth_body.extend_from_slice(&app_id);
        auth_body.push(key_handle_len as u8);
        auth_body.extend_from_slice(key_handle);
        let auth_apdu = build_apdu(INS_AUTHENTICATE, 0x03, &auth_body);
        let auth_resp = handle_apdu(&auth_apdu, &key(), &mut presence, &mut store);
        assert_eq!(&auth_resp[auth_resp.len() - 2..], &Ctap1Status::WrongData.sw().to_be_bytes());
    }

    #[test]
    fn check_only_authenticate_succeeds_without_presence() {
        // P1=0x07 (check-only) is exempt from the presence gate: a valid key handle
        // must still succeed even with the button never pressed, falling through to
        // the same decrypt/verify/sign/increment path as enforce mode (0x03).
        let mut presence = ScriptedPresence::default();
        let mut store = MemoryRecordStore::default();
        let chal = [0x01u8; 32];
        let app_id = [0x02u8; 32];
        let mut register_body = Vec::new();
        register_body.extend_from_slice(&chal);
        register_body.extend_from_slice(&app_id);
        let reg_apdu = build_apdu(INS_REGISTER, 0, &register_body);
        let reg_resp = handle_apdu(&reg_apdu, &key(), &mut presence, &mut store);
        let key_handle_len = reg_resp[2 + 64] as usize;
        let key_handle = &reg_resp[3 + 64..3 + 64 + key_handle_len].to_vec();

        assert!(!presence.is_present());

        let mut auth_body = Vec::new();
        auth_body.extend_from_slice(&chal);
        auth_body.extend_from_slice(&app_id);
        auth_body.push(key_handle_len as u8);
        auth_body.extend_from_slice(key_handle);
        let auth_apdu = build_apdu(INS_AUTHENTICATE, P1_CHECK_ONLY, &auth_body);
        let auth_resp = handle_apdu(&auth_apdu, &key(), &mut presence, &mut store);
        assert_eq!(&auth_resp[auth_resp.len() - 2..], &0x9000u16.to_be_bytes());
        assert_eq!(auth_resp[0], 0x01);
        let counter = u32::from_be_bytes([auth_resp[1], auth_resp[2], auth_resp[3], auth_resp[4]]);
        assert_eq!(counter, 1);
    }

    #[test]
    fn check_only_authenticate_still_rejects_foreign_key_handle() {
        let mut presence = ScriptedPresence::default();
        let mut store = MemoryRecordStore::default();
        let other_key = [0x66u8; 16];
        let chal = [0x01u8; 32];
        let app_id = [0x02u8; 32];
        let mut register_body = Vec::new();
        register_body.extend_from_slice(&chal);
        register_body.extend_from_slice(&app_id);
        let reg_apdu = build_apdu(INS_REGISTER, 0, &register_body);
        let reg_resp = handle_apdu(&reg_apdu, &other_key, &mut presence, &mut store);
        let key_handle_len = reg_resp[2 + 64] as usize;
        let key_handle = &reg_resp[3 + 64..3 + 64 + key_handle_len].to_vec();

        let mut auth_body = Vec::new();
        auth_body.extend_from_slice(&chal);
        auth_body.extend_from_slice(&app_id);
        auth_body.push(key_handle_len as u8);
        auth_body.extend_from_slice(key_handle);
        let auth_apdu = build_apdu(INS_AUTHENTICATE, P1_CHECK_ONLY, &auth_body);
        let auth_resp = handle_apdu(&auth_apdu, &key(), &mut presence, &mut store);
        assert_eq!(&auth_resp[auth_resp.len() - 2..], &Ctap1Status::WrongData.sw().to_be_bytes());
    }
}
