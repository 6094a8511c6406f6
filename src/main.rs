mod attestation;
mod authdata;
mod credential;
mod ctap1;
mod ctap2;
mod der;
mod error;
mod hidmux;
mod presence;
mod protocol;
mod store;
mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use hidmux::{ParsedFrame, BROADCAST_CID, REPORT_SIZE};
use presence::AtomicPresence;
use protocol::Authenticator;
use store::FileRecordStore;
use transport::{HidTransport, SimulatedHidDriver};

/// Everything `main()` needs to assemble an authenticator instance (§10). Kept
/// deliberately small — this is a demonstration binary, not a configurable
/// firmware image, so it favors baked-in defaults over a flag-driven surface.
struct AuthenticatorConfig {
    store_path: PathBuf,
}

impl AuthenticatorConfig {
    fn from_args(mut args: impl Iterator<Item = String>) -> Self {
        let store_path = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("ctap-authenticator-store.json"));
        Self { store_path }
    }
}

/// A monotonic millisecond clock for the channel table's deadlines (§4.1). A
/// thin wrapper over `Instant` so tests elsewhere can drive time with a plain
/// `u64` instead of sleeping; here it is backed by wall-clock time.
fn now_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// One iteration of the cooperative main loop (§5): poll the driver for the
/// next report, feed it through the channel reassembly state machine, and run
/// the dispatcher to completion synchronously if a message just completed.
/// Returns `true` if a report was available (so the caller can tell idle
/// iterations from busy ones).
fn pump(auth: &mut Authenticator, driver: &mut SimulatedHidDriver, now: u64) -> bool {
    let report = match driver.recv_report() {
        Some(r) => r,
        None => return false,
    };

    let frame = hidmux::parse_report(&report);
    match auth.channels.process_frame(frame, now) {
        Ok(Some((cid, cmd, payload))) => {
            // Channel is READY here; run it to completion, then complete the
            // READY --dispatcher consumes--> IDLE transition (§4.1).
            let (resp_cmd, resp_payload) = auth.dispatch(cid, cmd, payload, now);
            auth.channels.consume_ready(cid);
            send_response(driver, cid, resp_cmd, &resp_payload);
        }
        Ok(None) => {}
        Err((cid, hid_error)) => {
            let (resp_cmd, resp_payload) = protocol::error_response(hid_error);
            send_response(driver, cid, resp_cmd, &resp_payload);
        }
    }
    true
}

fn send_response(driver: &mut SimulatedHidDriver, cid: u32, cmd: u8, payload: &[u8]) {
    for report in hidmux::build_reports(cid, cmd, payload) {
        if let Err(e) = driver.send_report(&report) {
            log::error!("failed to send HID report: {e}");
        }
    }
}

/// Sweeps channel timeouts and emits a CTAPHID_ERROR for each one (§4.1, §5).
fn sweep(auth: &mut Authenticator, driver: &mut SimulatedHidDriver, now: u64) {
    for (cid, hid_error) in auth.channels.sweep_timeouts(now) {
        let (resp_cmd, resp_payload) = protocol::error_response(hid_error);
        send_response(driver, cid, resp_cmd, &resp_payload);
    }
}

/// Reassembles the response frames the authenticator just emitted back into a
/// single `(cid, cmd, payload)` message. The host-side mirror of the device's
/// own reassembly state machine (§4.1) — simpler here because the device never
/// produces an out-of-order or oversized response to its own requests.
fn reassemble(reports: &[[u8; REPORT_SIZE]]) -> (u32, u8, Vec<u8>) {
    assert!(!reports.is_empty(), "expected at least one response report");
    let first = hidmux::parse_report(&reports[0]);
    let (cmd, bcnt) = match first.kind {
        hidmux::FrameKind::Init { cmd, bcnt } => (cmd, bcnt as usize),
        hidmux::FrameKind::Cont { .. } => panic!("response must start with an INIT frame"),
    };
    let mut payload = first.payload;
    for report in &reports[1..] {
        let frame = hidmux::parse_report(report);
        if let ParsedFrame { payload: chunk, .. } = frame {
            payload.extend_from_slice(&chunk);
        }
    }
    payload.truncate(bcnt);
    (first.cid, cmd, payload)
}

/// Drives the HID driver/dispatcher loop until at least one response message
/// has been reassembled, used by the scripted demo below to turn a request
/// into its matching response without hand-tracking frame counts.
fn run_until_response(
    auth: &mut Authenticator,
    driver: &mut SimulatedHidDriver,
    epoch: Instant,
) -> (u32, u8, Vec<u8>) {
    loop {
        let now = now_ms(epoch);
        while pump(auth, driver, now) {}
        sweep(auth, driver, now);
        let reports = driver.take_outbound();
        if !reports.is_empty() {
            return reassemble(&reports);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Runs the six end-to-end seed scenarios of §8 against a freshly built
/// authenticator, logging each step. This is the binary's entire "CLI"
/// surface (no subcommand framework, per §10) — a scripted walk through INIT,
/// PING, CTAP1 VERSION, getInfo, makeCredential and getAssertion.
fn run_demo(auth: &mut Authenticator, driver: &mut SimulatedHidDriver, button: &Arc<AtomicBool>, epoch: Instant) {
    log::info!("--- CTAPHID_INIT on broadcast ---");
    let nonce = [1u8, 2, 3, 4, 5, 6, 7, 8];
    for report in hidmux::build_reports(BROADCAST_CID, protocol::CTAPHID_INIT, &nonce) {
        driver.push_host_report(report);
    }
    let (_, _, init_resp) = run_until_response(auth, driver, epoch);
    let cid = u32::from_be_bytes([init_resp[8], init_resp[9], init_resp[10], init_resp[11]]);
    log::info!("allocated cid {:#010x}, capFlags={:#04x}", cid, init_resp[16]);

    log::info!("--- CTAPHID_PING ---");
    for report in hidmux::build_reports(cid, protocol::CTAPHID_PING, b"hello") {
        driver.push_host_report(report);
    }
    let (_, _, ping_resp) = run_until_response(auth, driver, epoch);
    log::info!("ping echoed {} bytes", ping_resp.len());

    log::info!("--- CTAP1 VERSION over CTAPHID_MSG ---");
    let version_apdu = [0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00];
    for report in hidmux::build_reports(cid, protocol::CTAPHID_MSG, &version_apdu) {
        driver.push_host_report(report);
    }
    let (_, _, version_resp) = run_until_response(auth, driver, epoch);
    let sw = u16::from_be_bytes([version_resp[version_resp.len() - 2], version_resp[version_resp.len() - 1]]);
    log::info!("VERSION -> {:?} sw={:#06x}", String::from_utf8_lossy(&version_resp[..version_resp.len() - 2]), sw);

    log::info!("--- authenticatorGetInfo over CTAPHID_CBOR ---");
    for report in hidmux::build_reports(cid, protocol::CTAPHID_CBOR, &[0x04]) {
        driver.push_host_report(report);
    }
    let (_, _, info_resp) = run_until_response(auth, driver, epoch);
    log::info!("getInfo status={:#04x}", info_resp[0]);

    log::info!("--- authenticatorMakeCredential ---");
    button.store(true, Ordering::SeqCst);
    let make_cred_body = build_make_credential_request();
    for report in hidmux::build_reports(cid, protocol::CTAPHID_CBOR, &make_cred_body) {
        driver.push_host_report(report);
    }
    let (_, _, mc_resp) = run_until_response(auth, driver, epoch);
    log::info!("makeCredential status={:#04x}", mc_resp[0]);
    let credential_id = extract_credential_id(&mc_resp[1..]);

    log::info!("--- authenticatorGetAssertion ---");
    button.store(true, Ordering::SeqCst);
    let get_assertion_body = build_get_assertion_request(&credential_id);
    for report in hidmux::build_reports(cid, protocol::CTAPHID_CBOR, &get_assertion_body) {
        driver.push_host_report(report);
    }
    let (_, _, ga_resp) = run_until_response(auth, driver, epoch);
    log::info!("getAssertion status={:#04x}", ga_resp[0]);
}

fn build_make_credential_request() -> Vec<u8> {
    use ciborium::value::Value;
    let map = Value::Map(vec![
        (Value::Integer(1.into()), Value::Bytes(vec![0xAA; 32])),
        (Value::Integer(2.into()), Value::Map(vec![(Value::Text("id".into()), Value::Text("example.com".into()))])),
        (Value::Integer(3.into()), Value::Map(vec![(Value::Text("id".into()), Value::Bytes(vec![0x01]))])),
        (
            Value::Integer(4.into()),
            Value::Array(vec![Value::Map(vec![
                (Value::Text("type".into()), Value::Text("public-key".into())),
                (Value::Text("alg".into()), Value::Integer((-7).into())),
            ])]),
        ),
    ]);
    let mut out = vec![0x01];
    ciborium::ser::into_writer(&map, &mut out).expect("demo request always serialises");
    out
}

fn build_get_assertion_request(credential_id: &[u8]) -> Vec<u8> {
    use ciborium::value::Value;
    let allow_list = Value::Array(vec![Value::Map(vec![
        (Value::Text("id".into()), Value::Bytes(credential_id.to_vec())),
        (Value::Text("type".into()), Value::Text("public-key".into())),
    ])]);
    let map = Value::Map(vec![
        (Value::Integer(1.into()), Value::Text("example.com".into())),
        (Value::Integer(2.into()), Value::Bytes(vec![0xBB; 32])),
        (Value::Integer(3.into()), allow_list),
    ]);
    let mut out = vec![0x02];
    ciborium::ser::into_writer(&map, &mut out).expect("demo request always serialises");
    out
}

fn extract_credential_id(cbor_body: &[u8]) -> Vec<u8> {
    use ciborium::value::Value;
    let value: Value = ciborium::de::from_reader(cbor_body).expect("demo response always decodes");
    let map = value.as_map().expect("makeCredential response is a map");
    let auth_data = map
        .iter()
        .find(|(k, _)| k.as_integer().map(i128::from) == Some(2))
        .and_then(|(_, v)| v.as_bytes())
        .expect("makeCredential response carries authData");
    let cred_id_len = u16::from_be_bytes([auth_data[53], auth_data[54]]) as usize;
    auth_data[55..55 + cred_id_len].to_vec()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("ctap-authenticator-core starting (version {})", env!("CARGO_PKG_VERSION"));

    let config = AuthenticatorConfig::from_args(std::env::args().skip(1));
    log::info!("using record store at {}", config.store_path.display());

    let mut file_store = FileRecordStore::open(&config.store_path)?;
    let counter = store::load_or_init_counter(&mut file_store)?;
    let wrapping_key = store::load_or_init_wrapping_key(&mut file_store)?;
    log::info!("loaded persistent state: signature counter = {counter}");

    let button = Arc::new(AtomicBool::new(false));
    let presence = Box::new(AtomicPresence::new(button.clone()));
    let mut auth = Authenticator::new(Box::new(file_store), presence, wrapping_key);
    let mut driver = SimulatedHidDriver::new();
    let epoch = Instant::now();

    run_demo(&mut auth, &mut driver, &button, epoch);

    log::info!("ctap-authenticator-core demo complete");
    Ok(())
}
