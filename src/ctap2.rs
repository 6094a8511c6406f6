//! CTAP2 CBOR interpreter (§4.4): authenticatorGetInfo, authenticatorMakeCredential,
//! authenticatorGetAssertion.

use ciborium::value::Value;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;

use crate::attestation::{attestation_signing_key, AAGUID};
use crate::authdata::{build_auth_data, AttestedCredentialData};
use crate::credential::{self, CredentialSource};
use crate::der::encode_der_signature;
use crate::error::Ctap2Status;
use crate::hidmux::MAX_PAYLOAD;
use crate::presence::UserPresence;
use crate::store::{load_or_init_counter, persist_counter, RecordStore};

const CMD_MAKE_CREDENTIAL: u8 = 0x01;
const CMD_GET_ASSERTION: u8 = 0x02;
const CMD_GET_INFO: u8 = 0x04;

const MAX_ALLOW_LIST_ENTRIES: usize = 20;

fn sign_with(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let sig: Signature = key.sign(message);
    let bytes = sig.to_bytes();
    let r: [u8; 32] = bytes[..32].try_into().unwrap();
    let s: [u8; 32] = bytes[32..].try_into().unwrap();
    encode_der_signature(&r, &s)
}

fn encode_cbor(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).expect("response maps always serialise");
    out
}

fn parse_top_level_map(bytes: &[u8]) -> Result<Vec<(Value, Value)>, Ctap2Status> {
    let value: Value = ciborium::de::from_reader(bytes).map_err(|_| Ctap2Status::InvalidCbor)?;
    value.into_map().map_err(|_| Ctap2Status::CborUnexpectedType)
}

fn map_get<'a>(map: &'a [(Value, Value)], key: i128) -> Option<&'a Value> {
    // Iterates every entry; a request with a duplicate key takes the last one,
    // but every entry is always visited regardless of how many keys precede it.
    let mut found = None;
    for (k, v) in map {
        if k.as_integer().map(|i| i128::from(i)) == Some(key) {
            found = Some(v);
        }
    }
    found
}

fn as_bytes(value: &Value) -> Option<&[u8]> {
    value.as_bytes().map(|b| b.as_slice())
}

fn as_text(value: &Value) -> Option<&str> {
    value.as_text()
}

/// Entry point for CTAPHID_CBOR: dispatches on the first byte and returns `status || cbor`.
pub fn handle_cbor(
    data: &[u8],
    wrapping_key: &[u8; 16],
    presence: &mut dyn UserPresence,
    store: &mut dyn RecordStore,
) -> Vec<u8> {
    if data.is_empty() {
        return vec![Ctap2Status::InvalidCbor.byte()];
    }
    let cmd = data[0];
    let params = &data[1..];

    let (status, body) = match cmd {
        CMD_GET_INFO => (Ctap2Status::Success, get_info()),
        CMD_MAKE_CREDENTIAL => match make_credential(params, wrapping_key, presence, store) {
            Ok(body) => (Ctap2Status::Success, body),
            Err(status) => (status, Vec::new()),
        },
        CMD_GET_ASSERTION => match get_assertion(params, wrapping_key, presence, store) {
            Ok(body) => (Ctap2Status::Success, body),
            Err(status) => (status, Vec::new()),
        },
        _ => (Ctap2Status::Other, Vec::new()),
    };

    let mut out = Vec::with_capacity(1 + body.len());
    out.push(status.byte());
    out.extend_from_slice(&body);
    out
}

fn get_info() -> Vec<u8> {
    let versions = Value::Array(vec![Value::Text("FIDO_2_0".into())]);
    let options = Value::Map(vec![
        (Value::Text("rk".into()), Value::Bool(false)),
        (Value::Text("up".into()), Value::Bool(true)),
        (Value::Text("plat".into()), Value::Bool(false)),
    ]);
    let map = Value::Map(vec![
        (Value::Integer(1.into()), versions),
        (Value::Integer(3.into()), Value::Bytes(AAGUID.to_vec())),
        (Value::Integer(4.into()), options),
        (Value::Integer(5.into()), Value::Integer((MAX_PAYLOAD as i64).into())),
    ]);
    encode_cbor(&map)
}

fn make_credential(
    params: &[u8],
    wrapping_key: &[u8; 16],
    presence: &mut dyn UserPresence,
    store: &mut dyn RecordStore,
) -> Result<Vec<u8>, Ctap2Status> {
    let map = parse_top_level_map(params)?;

    let client_data_hash = map_get(&map, 1).and_then(as_bytes).ok_or(Ctap2Status::MissingParameter)?;
    let rp = map_get(&map, 2).and_then(|v| v.as_map()).ok_or(Ctap2Status::MissingParameter)?;
    let rp_id = rp
        .iter()
        .find(|(k, _)| k.as_text() == Some("id"))
        .and_then(|(_, v)| as_text(v))
        .ok_or(Ctap2Status::MissingParameter)?;

    let user = map_get(&map, 3).and_then(|v| v.as_map()).ok_or(Ctap2Status::MissingParameter)?;
    let user_id = user
        .iter()
        .find(|(k, _)| k.as_text() == Some("id"))
        .and_then(|(_, v)| as_bytes(v))
        .ok_or(Ctap2Status::MissingParameter)?;

    let pub_key_cred_params =
        map_get(&map, 4).and_then(|v| v.as_array()).ok_or(Ctap2Status::MissingParameter)?;
    let supports_es256 = pub_key_cred_params.iter().any(|entry| {
        entry
            .as_map()
            .map(|fields| {
                let ty = fields.iter().find(|(k, _)| k.as_text() == Some("type")).map(|(_, v)| v);
                let alg = fields.iter().find(|(k, _)| k.as_text() == Some("alg")).map(|(_, v)| v);
                ty.and_then(as_text) == Some("public-key")
                    && alg.and_then(|v| v.as_integer()).map(i128::from) == Some(-7)
            })
            .unwrap_or(false)
    });
    if !supports_es256 {
        return Err(Ctap2Status::UnsupportedAlgorithm);
    }

    if let Some(options) = map_get(&map, 7).and_then(|v| v.as_map()) {
        let up_true = options
            .iter()
            .any(|(k, v)| k.as_text() == Some("up") && v.as_bool() == Some(true));
        if up_true {
            return Err(Ctap2Status::InvalidOption);
        }
    }

    presence.wait_for_presence();

    let signing_key = SigningKey::random(&mut OsRng);
    let private_key_bytes: [u8; 32] = signing_key.to_bytes().into();
    let point = signing_key.verifying_key().to_encoded_point(false);
    let x: [u8; 32] = point.x().expect("uncompressed point has x").as_slice().try_into().unwrap();
    let y: [u8; 32] = point.y().expect("uncompressed point has y").as_slice().try_into().unwrap();

    let source = CredentialSource::new(rp_id, user_id, private_key_bytes);
    let credential_id = credential::seal(wrapping_key, &source);

    let counter = load_or_init_counter(store).map_err(|_| Ctap2Status::Other)?;
    let attested = AttestedCredentialData { aaguid: AAGUID, credential_id, public_key_x: x, public_key_y: y };
    let auth_data = build_auth_data(rp_id, counter, Some(&attested));

    let mut signed_over = auth_data.clone();
    signed_over.extend_from_slice(client_data_hash);
    let sig = sign_with(&attestation_signing_key(), &signed_over);

    let att_stmt = Value::Map(vec![
        (Value::Text("alg".into()), Value::Integer((-7).into())),
        (Value::Text("sig".into()), Value::Bytes(sig)),
    ]);
    let response = Value::Map(vec![
        (Value::Integer(1.into()), Value::Text("packed".into())),
        (Value::Integer(2.into()), Value::Bytes(auth_data)),
        (Value::Integer(3.into()), att_stmt),
    ]);
    Ok(encode_cbor(&response))
}

fn get_assertion(
    params: &[u8],
    wrapping_key: &[u8; 16],
    presence: &mut dyn UserPresence,
    store: &mut dyn RecordStore,
) -> Result<Vec<u8>, Ctap2Status> {
    let map = parse_top_level_map(params)?;

    let rp_id = map_get(&map, 1).and_then(as_text).ok_or(Ctap2Status::MissingParameter)?;
    let client_data_hash = map_get(&map, 2).and_then(as_bytes).ok_or(Ctap2Status::MissingParameter)?;
    let allow_list = map_get(&map, 3).and_then(|v| v.as_array()).ok_or(Ctap2Status::MissingParameter)?;
    if allow_list.is_empty() {
        return Err(Ctap2Status::NoCredentials);
    }

    let mut matched: Option<(Vec<u8>, CredentialSource)> = None;
    for entry in allow_list.iter().take(MAX_ALLOW_LIST_ENTRIES) {
        let fields = match entry.as_map() {
            Some(f) => f,
            None => continue,
        };
        let id = fields.iter().find(|(k, _)| k.as_text() == Some("id")).and_then(|(_, v)| as_bytes(v));
        let id = match id {
            Some(id) => id,
            None => continue,
        };
        if let Ok(source) = credential::unseal(wrapping_key, id) {
            if source.rp_id_matches(rp_id) {
                matched = Some((id.to_vec(), source));
                break;
            }
        }
    }
    let (credential_id, source) = matched.ok_or(Ctap2Status::NoCredentials)?;

    presence.wait_for_presence();

    let counter = load_or_init_counter(store).map_err(|_| Ctap2Status::Other)?;
    let counter = counter.wrapping_add(1);
    persist_counter(store, counter).map_err(|_| Ctap2Status::Other)?;

    let auth_data = build_auth_data(rp_id, counter, None);
    let mut signed_over = auth_data.clone();
    signed_over.extend_from_slice(client_data_hash);

    let signing_key = SigningKey::from_slice(&source.private_key).map_err(|_| Ctap2Status::InvalidCredential)?;
    let sig = sign_with(&signing_key, &signed_over);

    let credential_descriptor = Value::Map(vec![
        (Value::Text("id".into()), Value::Bytes(credential_id)),
        (Value::Text("type".into()), Value::Text("public-key".into())),
    ]);
    let response = Value::Map(vec![
        (Value::Integer(1.into()), credential_descriptor),
        (Value::Integer(2.into()), Value::Bytes(auth_data)),
        (Value::Integer(3.into()), Value::Bytes(sig)),
    ]);
    Ok(encode_cbor(&response))
}
