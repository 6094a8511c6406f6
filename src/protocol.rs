//! L2: HID-level command handlers and delegation into CTAP1/CTAP2 (§4.2).
//!
//! This is the layer that owns an `Authenticator` value end to end: the channel
//! table, the wrapping key, the record store and the presence collaborator all
//! live here, passed by `&mut self` to every handler (§9 design note — a single
//! owned value rather than ambient global mutable state).

use crate::ctap1;
use crate::ctap2;
use crate::error::HidError;
use crate::hidmux::{self, ChannelTable};
use crate::presence::UserPresence;
use crate::store::RecordStore;

// hidmux's reassembler strips the init-frame marker bit before handing a command
// byte up (`parse_report`/`process_frame` both traffic in `b4 & 0x7F`); these
// constants live in that same masked 7-bit space, not the 0x80-tagged wire byte.
// `hidmux::build_reports` re-applies the marker bit when it frames a response, so
// the wire still carries the familiar 0x81/0x86/0x90/... bytes on the other end.
pub const CTAPHID_PING: u8 = 0x01;
pub const CTAPHID_MSG: u8 = 0x03;
pub const CTAPHID_LOCK: u8 = 0x04;
pub const CTAPHID_INIT: u8 = 0x06;
pub const CTAPHID_WINK: u8 = 0x08;
pub const CTAPHID_CBOR: u8 = 0x10;
pub const CTAPHID_CANCEL: u8 = 0x11;
pub const CTAPHID_KEEPALIVE: u8 = 0x3B;
pub const CTAPHID_SYNC: u8 = 0x3C;
pub const CTAPHID_ERROR: u8 = 0x3F;

const VENDOR_RANGE_START: u8 = 0x40;
const VENDOR_RANGE_END: u8 = 0x7F;

const CAP_FLAG_WINK: u8 = 0x01;
const CAP_FLAG_CBOR: u8 = 0x04;
/// CTAPHID protocol version, distinct from the device firmware version below.
const PROTOCOL_VERSION: u8 = 2;
const DEVICE_VERSION_MAJOR: u8 = 1;
const DEVICE_VERSION_MINOR: u8 = 0;
const DEVICE_VERSION_BUILD: u8 = 0;

/// Owns every piece of per-process authenticator state: the channel table (§3),
/// the wrapping key (§3/§4.6), the persistent record store, and the user-presence
/// collaborator. The main loop holds exactly one of these, matching the
/// single-threaded scheduling model of §5.
pub struct Authenticator {
    pub channels: ChannelTable,
    wrapping_key: [u8; 16],
    store: Box<dyn RecordStore>,
    presence: Box<dyn UserPresence>,
}

impl Authenticator {
    pub fn new(store: Box<dyn RecordStore>, presence: Box<dyn UserPresence>, wrapping_key: [u8; 16]) -> Self {
        Self { channels: ChannelTable::new(), wrapping_key, store, presence }
    }

    /// Dispatches one fully reassembled HID-level message to completion (§4.2),
    /// synchronously, returning the response `(cmd, payload)` to be fragmented
    /// back into reports by the caller.
    pub fn dispatch(&mut self, cid: u32, cmd: u8, payload: Vec<u8>, now_ms: u64) -> (u8, Vec<u8>) {
        log::info!("dispatch cid={:#010x} cmd={:#04x} len={}", cid, cmd, payload.len());
        match cmd {
            CTAPHID_INIT => self.handle_init(cid, &payload, now_ms),
            CTAPHID_PING => (CTAPHID_PING, payload),
            CTAPHID_WINK => {
                log::info!("wink");
                (CTAPHID_WINK, Vec::new())
            }
            CTAPHID_MSG => {
                let resp = ctap1::handle_apdu(&payload, &self.wrapping_key, self.presence.as_mut(), self.store.as_mut());
                (CTAPHID_MSG, resp)
            }
            CTAPHID_CBOR => {
                let resp = ctap2::handle_cbor(&payload, &self.wrapping_key, self.presence.as_mut(), self.store.as_mut());
                (CTAPHID_CBOR, resp)
            }
            CTAPHID_CANCEL => {
                log::info!("cancel (advisory, no in-flight suspension point) on cid {:#010x}", cid);
                (CTAPHID_CANCEL, Vec::new())
            }
            CTAPHID_LOCK | CTAPHID_SYNC | CTAPHID_KEEPALIVE => {
                log::debug!("acknowledging {:#04x} with no further semantics", cmd);
                (cmd, Vec::new())
            }
            VENDOR_RANGE_START..=VENDOR_RANGE_END => {
                log::debug!("acknowledging vendor command {:#04x}", cmd);
                (cmd, Vec::new())
            }
            _ => {
                log::warn!("invalid cmd {:#04x} on cid {:#010x}", cmd, cid);
                error_response(HidError::InvalidCmd)
            }
        }
    }

    fn handle_init(&mut self, cid: u32, payload: &[u8], now_ms: u64) -> (u8, Vec<u8>) {
        if cid != hidmux::BROADCAST_CID {
            log::warn!("INIT received on non-broadcast cid {:#010x}", cid);
            return error_response(HidError::InvalidCmd);
        }
        if payload.len() != 8 {
            return error_response(HidError::InvalidLen);
        }
        let new_cid = match self.channels.alloc_channel(now_ms) {
            Ok(cid) => cid,
            Err(e) => return error_response(e),
        };
        log::info!("allocated channel {:#010x}", new_cid);

        // Clear any stale button edge on every INIT, so a press from before this
        // channel existed can't leak into its first REGISTER/AUTHENTICATE/
        // makeCredential/getAssertion.
        self.presence.is_present();

        let mut out = Vec::with_capacity(17);
        out.extend_from_slice(payload);
        out.extend_from_slice(&new_cid.to_be_bytes());
        out.push(PROTOCOL_VERSION);
        out.push(DEVICE_VERSION_MAJOR);
        out.push(DEVICE_VERSION_MINOR);
        out.push(DEVICE_VERSION_BUILD);
        out.push(CAP_FLAG_WINK | CAP_FLAG_CBOR);
        (CTAPHID_INIT, out)
    }
}

/// Formats a transport-layer error as the `CTAPHID_ERROR` response body (§4.1/§7):
/// a single byte carrying the error code.
pub fn error_response(e: HidError) -> (u8, Vec<u8>) {
    (CTAPHID_ERROR, vec![e.code()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{AlwaysPresent, ScriptedPresence, UserPresence};
    use crate::store::MemoryRecordStore;

    fn authenticator() -> Authenticator {
        Authenticator::new(Box::new(MemoryRecordStore::default()), Box::new(AlwaysPresent), [0x5Au8; 16])
    }

    #[test]
    fn init_consumes_a_stale_button_edge() {
        let mut auth = Authenticator::new(
            Box::new(MemoryRecordStore::default()),
            Box::new(ScriptedPresence { present: true }),
            [0x5Au8; 16],
        );
        auth.dispatch(hidmux::BROADCAST_CID, CTAPHID_INIT, vec![0; 8], 0);
        // The press that was sitting on the button before INIT ran must not leak
        // into the first privileged operation on the freshly allocated channel.
        assert!(!auth.presence.is_present());
    }

    #[test]
    fn init_on_broadcast_allocates_distinct_channel() {
        let mut auth = authenticator();
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        let (cmd, resp) = auth.dispatch(hidmux::BROADCAST_CID, CTAPHID_INIT, nonce.to_vec(), 0);
        assert_eq!(cmd, CTAPHID_INIT);
        assert_eq!(&resp[..8], &nonce);
        let cid = u32::from_be_bytes([resp[8], resp[9], resp[10], resp[11]]);
        assert_ne!(cid, 0);
        assert_ne!(cid, hidmux::BROADCAST_CID);
        assert_eq!(resp[12], PROTOCOL_VERSION);
        assert_eq!(resp[16], CAP_FLAG_WINK | CAP_FLAG_CBOR);
    }

    #[test]
    fn init_on_non_broadcast_cid_is_rejected() {
        let mut auth = authenticator();
        let (cmd, resp) = auth.dispatch(0x42, CTAPHID_INIT, vec![0; 8], 0);
        assert_eq!(cmd, CTAPHID_ERROR);
        assert_eq!(resp, vec![HidError::InvalidCmd.code()]);
    }

    #[test]
    fn ping_echoes_payload() {
        let mut auth = authenticator();
        let (cmd, resp) = auth.dispatch(0x1, CTAPHID_PING, b"hello".to_vec(), 0);
        assert_eq!(cmd, CTAPHID_PING);
        assert_eq!(resp, b"hello");
    }

    #[test]
    fn wink_returns_empty_body() {
        let mut auth = authenticator();
        let (cmd, resp) = auth.dispatch(0x1, CTAPHID_WINK, Vec::new(), 0);
        assert_eq!(cmd, CTAPHID_WINK);
        assert!(resp.is_empty());
    }

    #[test]
    fn unknown_command_is_invalid_cmd() {
        let mut auth = authenticator();
        let (cmd, resp) = auth.dispatch(0x1, 0xEE, Vec::new(), 0);
        assert_eq!(cmd, CTAPHID_ERROR);
        assert_eq!(resp, vec![HidError::InvalidCmd.code()]);
    }

    #[test]
    fn vendor_range_is_acknowledged() {
        let mut auth = authenticator();
        let (cmd, resp) = auth.dispatch(0x1, 0x41, Vec::new(), 0);
        assert_eq!(cmd, 0x41);
        assert!(resp.is_empty());
    }

    #[test]
    fn keepalive_is_acknowledged_not_rejected() {
        let mut auth = authenticator();
        let (cmd, resp) = auth.dispatch(0x1, CTAPHID_KEEPALIVE, Vec::new(), 0);
        assert_eq!(cmd, CTAPHID_KEEPALIVE);
        assert!(resp.is_empty());
    }
}
