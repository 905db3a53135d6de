//! Device role state machine, spec.md §4.4: beacon scanning, association
//! request, and persisted short-address assignment.

use log::{info, trace, warn};

use zag_proto::codec::cmd::Identifier;
use zag_proto::prelude::*;

const ASSOC_TIMEOUT_MS: u64 = 35_000;

/// `WaitResponse(started_at)` from spec.md §4.4; `Idle` is the implicit
/// absence of this state.
struct WaitResponse {
    started_at_ms: u64,
}

pub struct Device<'t> {
    radio: Radio<'t>,
    config: DeviceConfig,
    long_addr: [u8; 8],
    dsn: u8,
    wait_response: Option<WaitResponse>,
    pending_ack: Option<PendingAck>,
}

/// Logs and swallows a radio `err` response; propagates a transport failure
/// since that one is fatal (spec.md §7).
fn shrug_response<T>(result: Result<T, RadioError>, context: &str) -> Result<Option<T>, TransportError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(RadioError::Response(e)) => {
            warn!("{context}: {e}");
            Ok(None)
        }
        Err(RadioError::Transport(e)) => Err(e),
    }
}

impl<'t> Device<'t> {
    /// Boots the device: prints its identity and pushes the radio's
    /// operating parameters (spec.md §4.4 "On boot"). Any radio failure here
    /// is fatal startup, so it is not smoothed over the way steady-state
    /// operation is.
    pub fn boot(radio: Radio<'t>, config: DeviceConfig) -> Result<Self, RadioError> {
        let (_, long_addr_bytes) = radio.get_object(Param::LongAddr, 8)?;
        let mut long_addr = [0u8; 8];
        let n = long_addr_bytes.len().min(8);
        long_addr[..n].copy_from_slice(&long_addr_bytes[..n]);
        info!("I'm {}", hex_upper(&long_addr));

        radio.set_value(Param::Channel, config.channel as u16)?;
        radio.set_value(Param::RxMode, 0)?;
        radio.set_value(Param::TxMode, TxMode::SEND_ON_CCA.bits())?;
        radio.set_leds(0xFF, 0)?;

        Ok(Self {
            radio,
            config,
            long_addr,
            dsn: rand::random(),
            wait_response: None,
            pending_ack: None,
        })
    }

    /// The nearest deadline across the pending-ack retry and the
    /// association-wait timeout, so the caller's event-channel wait can time
    /// out exactly when something needs attention (spec.md §9 "Event loop
    /// with deadlines").
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let mut deadline = self.pending_ack.as_ref().map(PendingAck::next_deadline_ms);
        if let Some(wait) = &self.wait_response {
            let t = wait.started_at_ms + ASSOC_TIMEOUT_MS;
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        }
        deadline
    }

    /// Advances all wall-clock deadlines: pending-ack retransmit/exhaustion
    /// and the association-wait timeout.
    pub fn on_tick(&mut self, now_ms: u64) -> Result<(), TransportError> {
        if let Some(pending) = &mut self.pending_ack {
            match pending.poll(now_ms) {
                Ok(Some(packet)) => {
                    let packet = packet.to_vec();
                    shrug_response(self.radio.send_packet(&packet), "retransmit")?;
                }
                Ok(None) => {}
                Err(_) => {
                    warn!("association request retries exhausted, giving up");
                    self.pending_ack = None;
                }
            }
        }

        if let Some(wait) = &self.wait_response {
            if now_ms.saturating_sub(wait.started_at_ms) >= ASSOC_TIMEOUT_MS {
                warn!("association response timed out, returning to idle");
                self.wait_response = None;
            }
        }

        Ok(())
    }

    /// Dispatches one received frame, spec.md §4.4's `packet_handler`.
    pub fn on_packet(&mut self, frame: &[u8], now_ms: u64) -> Result<(), TransportError> {
        let (decoded, _rest) = match Frame::decode(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping malformed frame: {e}");
                return Ok(());
            }
        };

        match decoded.mhr.frame_control.frame_type() {
            FrameType::Ack => {
                self.on_ack(decoded.mhr.seq_num);
                Ok(())
            }
            FrameType::Beacon => {
                if let FrameBody::Beacon(bcn) = decoded.body {
                    self.on_beacon(&decoded.mhr, &bcn, now_ms)?;
                }
                Ok(())
            }
            FrameType::Cmd => {
                if let FrameBody::Command(cmd) = decoded.body {
                    self.on_command(&decoded.mhr, &cmd, now_ms)?;
                }
                Ok(())
            }
            other => {
                trace!("ignoring {other} frame");
                Ok(())
            }
        }
    }

    fn on_ack(&mut self, seq_num: u8) {
        if self.pending_ack.as_ref().is_some_and(|p| p.matches_ack(seq_num)) {
            self.pending_ack = None;
        }
    }

    /// Beacon scan handling while not yet associated, spec.md §4.4 "On
    /// received beacon". Already-associated devices ignore beacons.
    fn on_beacon(&mut self, mhr: &Mhr, bcn: &Bcn, now_ms: u64) -> Result<(), TransportError> {
        if self.config.panid != 0xFFFF {
            return Ok(());
        }
        if mhr.frame_control.src_mode_bits() != AddrMode::Short as u16 {
            return Ok(());
        }
        if mhr.frame_control.dst_mode_bits() != AddrMode::None as u16 {
            return Ok(());
        }
        let src_panid = match mhr.src_panid {
            Some(p) if p <= 0xFFFD => p,
            _ => return Ok(()),
        };
        let src_addr = match mhr.src_addr.as_short() {
            Some(a) if a <= 0xFFFD => a,
            _ => return Ok(()),
        };
        if !bcn.superframe.pan_coordinator() {
            return Ok(());
        }
        if !bcn.superframe.association_permit() {
            return Ok(());
        }
        let vendor = bcn.vendor.as_ref();
        if let Some(wanted) = &self.config.ssid {
            if vendor.map(|v| &v.ssid) != Some(wanted) {
                return Ok(());
            }
        }
        if self.config.service >= 0 {
            let matches = vendor.is_some_and(|v| v.services.contains(&(self.config.service as u16)));
            if !matches {
                return Ok(());
            }
        }
        self.send_assoc_request(src_panid, src_addr, now_ms)
    }

    fn on_command(&mut self, mhr: &Mhr, cmd: &Cmd, now_ms: u64) -> Result<(), TransportError> {
        if cmd.known_identifier() == Some(Identifier::AssociationResponse) {
            self.on_association_response(mhr, cmd, now_ms)?;
        }
        Ok(())
    }

    /// Association response handling while `WaitResponse`, spec.md §4.4 "On
    /// received association response".
    fn on_association_response(&mut self, mhr: &Mhr, cmd: &Cmd, now_ms: u64) -> Result<(), TransportError> {
        if self.wait_response.is_none() {
            return Ok(());
        }
        if !mhr.frame_control.req_ack() {
            return Ok(());
        }
        if mhr.frame_control.dst_mode_bits() != AddrMode::Long as u16 {
            return Ok(());
        }
        if mhr.frame_control.src_mode_bits() != AddrMode::Long as u16 {
            return Ok(());
        }
        if mhr.dst_addr.as_long() != Some(self.long_addr) {
            return Ok(());
        }
        let (short_addr, status) = match cmd.body {
            zag_proto::codec::cmd::Body::AssociationResponse { short_addr, status } => (short_addr, status),
            _ => return Ok(()),
        };

        self.send_ack(mhr.seq_num)?;
        self.wait_response = None;

        if status != zag_proto::codec::cmd::AssocStatus::AssocSuccess {
            warn!("association refused: {status:?}");
            return Ok(());
        }

        self.config.panid = mhr.dst_panid.unwrap_or(self.config.panid);
        self.config.coordinator = mhr.src_addr.as_long().unwrap_or(self.config.coordinator);
        self.config.short_addr = Some(short_addr);
        if let Err(e) = self.config.save() {
            warn!("failed to persist association: {e}");
        }
        Ok(())
    }

    /// On button 1: broadcast a beacon request, spec.md §4.4 "On button 1".
    pub fn on_button(&mut self, button: u8, _now_ms: u64) -> Result<(), TransportError> {
        if button != 1 {
            return Ok(());
        }
        self.send_beacon_request()
    }

    fn send_ack(&mut self, seq_num: u8) -> Result<(), TransportError> {
        let mut mhr = Mhr::new(FrameType::Ack);
        mhr.seq_num = seq_num;
        let frame = Frame { mhr, body: FrameBody::Ack }.encode();
        shrug_response(self.radio.send_packet(&frame), "ack send")?;
        Ok(())
    }

    fn send_beacon_request(&mut self) -> Result<(), TransportError> {
        let mut mhr = Mhr::new(FrameType::Cmd);
        mhr.seq_num = self.dsn;
        mhr.set_dst(0xFFFF, Addr::Short(0xFFFF));

        let cmd = Cmd::bcn_request();
        let frame = Frame { mhr, body: FrameBody::Command(cmd) }.encode();
        shrug_response(self.radio.send_packet(&frame), "beacon request send")?;
        self.dsn = self.dsn.wrapping_add(1);
        Ok(())
    }

    fn send_assoc_request(&mut self, panid: u16, coord_addr: u16, now_ms: u64) -> Result<(), TransportError> {
        let mut mhr = Mhr::new(FrameType::Cmd);
        mhr.frame_control.set_req_ack(true);
        mhr.seq_num = self.dsn;
        mhr.set_dst(panid, Addr::Short(coord_addr));
        mhr.set_src(0xFFFF, Addr::Long(self.long_addr));

        let capability = zag_proto::codec::cmd::capability::POWER_SOURCE
            | zag_proto::codec::cmd::capability::IDLE_RECV
            | zag_proto::codec::cmd::capability::ALLOCATE_ADDRESS;
        let cmd = Cmd::association_request(capability);
        let frame = Frame { mhr, body: FrameBody::Command(cmd) }.encode();

        let seq = self.dsn;
        shrug_response(self.radio.send_packet(&frame), "association request send")?;
        self.pending_ack = Some(PendingAck::new(frame, seq, now_ms));
        self.wait_response = Some(WaitResponse { started_at_ms: now_ms });
        self.dsn = self.dsn.wrapping_add(1);
        Ok(())
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    use zag_proto::codec::bcn::{Superframe, VendorExt};
    use zag_proto::codec::cmd::AssocStatus;

    const MAGIC: [u8; 4] = [0xAA, b'Z', b'A', b'G'];

    /// An in-memory radio that answers every request generically (boot
    /// parameters succeed, `send_packet` always reports success) and records
    /// every `send_packet` payload for inspection, mirroring
    /// `zag_coordinator::role::test::FakeLink`.
    #[derive(Clone)]
    struct FakeLink(Arc<Mutex<FakeLinkState>>);

    struct FakeLinkState {
        to_reader: VecDeque<u8>,
        scratch: Vec<u8>,
        sent_packets: Vec<Vec<u8>>,
    }

    impl FakeLink {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(FakeLinkState {
                to_reader: VecDeque::new(),
                scratch: Vec::new(),
                sent_packets: Vec::new(),
            })))
        }

        fn sent_packets(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().sent_packets.clone()
        }
    }

    fn fake_respond(st: &mut FakeLinkState, kind: u8, payload: &[u8]) -> Vec<u8> {
        match kind {
            0 => {
                st.sent_packets.push(payload.to_vec());
                vec![0x80, 2, 0x00, 0x00]
            }
            6 => vec![0x80, 2, 0x00, 0x00], // set_value -> Ok
            7 => {
                // get_object: echo back an ascending byte pattern as the long addr
                let n = payload.get(2).copied().unwrap_or(0) as usize;
                let mut body = vec![0x00, 0x00];
                body.extend((1..=n as u8).map(|b| b));
                let mut wire = vec![0x80, body.len() as u8];
                wire.extend(body);
                wire
            }
            9 => vec![0x80, 1, 0], // get_leds
            _ => vec![0x80, 0],
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut st = self.0.lock().unwrap();
            match st.to_reader.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Ok(0),
            }
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut st = self.0.lock().unwrap();
            st.scratch.extend_from_slice(buf);
            loop {
                if st.scratch.len() >= MAGIC.len() && st.scratch[..MAGIC.len()] == MAGIC {
                    let echo = st.scratch[..MAGIC.len()].to_vec();
                    st.scratch.drain(..MAGIC.len());
                    st.to_reader.extend(echo);
                    continue;
                }
                if st.scratch.len() >= 2 {
                    let kind = st.scratch[0];
                    let len = st.scratch[1] as usize;
                    if st.scratch.len() >= 2 + len {
                        let payload: Vec<u8> = st.scratch[2..2 + len].to_vec();
                        st.scratch.drain(..2 + len);
                        let response = fake_respond(&mut st, kind, &payload);
                        st.to_reader.extend(response);
                        continue;
                    }
                }
                break;
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for FakeLink {
        fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn make_config(name: &str) -> DeviceConfig {
        let mut path = std::env::temp_dir();
        path.push(format!("zag-device-test-{name}-{:?}.ini", std::thread::current().id()));
        let _ = std::fs::remove_file(&path);
        DeviceConfig::load(&path).unwrap()
    }

    fn sample_beacon_frame(panid: u16, coord_short: u16) -> Vec<u8> {
        let mut mhr = Mhr::new(FrameType::Beacon);
        mhr.set_src(panid, Addr::Short(coord_short));

        let mut sf = Superframe::default();
        sf.set_bcn_order(15).set_superframe_order(15).set_pan_coordinator(true).set_association_permit(true);
        let bcn = Bcn {
            superframe: sf,
            gts_permit: false,
            gts_mask: None,
            gts_desc: Vec::new(),
            pend_addr: Vec::new(),
            vendor: Some(VendorExt { ssid: "Sample".into(), services: vec![0] }),
        };
        Frame { mhr, body: FrameBody::Beacon(bcn) }.encode()
    }

    fn assoc_response_frame(dst_long: [u8; 8], coord_long: [u8; 8], panid: u16, short_addr: u16, status: AssocStatus, seq: u8) -> Vec<u8> {
        let mut mhr = Mhr::new(FrameType::Cmd);
        mhr.frame_control.set_req_ack(true).set_panid_compression(true);
        mhr.seq_num = seq;
        mhr.set_dst(panid, Addr::Long(dst_long));
        mhr.set_src(panid, Addr::Long(coord_long));
        let cmd = Cmd::association_response(short_addr, status);
        Frame { mhr, body: FrameBody::Command(cmd) }.encode()
    }

    fn decode_cmd(frame: &[u8]) -> (Mhr, Cmd) {
        let (decoded, _) = Frame::decode(frame).unwrap();
        match decoded.body {
            FrameBody::Command(cmd) => (decoded.mhr, cmd),
            other => panic!("expected a command frame, got {other:?}"),
        }
    }

    #[test]
    fn button_press_broadcasts_a_beacon_request() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("button");
        let mut dev = Device::boot(radio, config).unwrap();

        dev.on_button(1, 0).unwrap();

        let sent = dev_sent(&link);
        assert_eq!(sent.len(), 1);
        let (mhr, cmd) = decode_cmd(&sent[0]);
        assert_eq!(mhr.frame_control.frame_type(), FrameType::Cmd);
        assert_eq!(cmd.known_identifier(), Some(Identifier::BcnRequest));
    }

    fn dev_sent(link: &FakeLink) -> Vec<Vec<u8>> {
        link.sent_packets()
    }

    #[test]
    fn s1_matching_beacon_triggers_association_request() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("s1");
        let mut dev = Device::boot(radio, config).unwrap();

        dev.on_packet(&sample_beacon_frame(0xBEEF, 0x0000), 0).unwrap();

        assert!(dev.wait_response.is_some());
        let sent = dev_sent(&link);
        assert_eq!(sent.len(), 1);
        let (mhr, cmd) = decode_cmd(&sent[0]);
        assert_eq!(mhr.frame_control.frame_type(), FrameType::Cmd);
        assert!(mhr.frame_control.req_ack());
        assert_eq!(cmd.known_identifier(), Some(Identifier::AssociationRequest));
    }

    #[test]
    fn beacon_with_wrong_ssid_is_ignored() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let mut config = make_config("ssid-filter");
        config.ssid = Some("Other".into());
        let mut dev = Device::boot(radio, config).unwrap();

        dev.on_packet(&sample_beacon_frame(0xBEEF, 0x0000), 0).unwrap();

        assert!(dev.wait_response.is_none());
        assert!(dev_sent(&link).is_empty());
    }

    #[test]
    fn s2_association_success_persists_and_returns_to_idle() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("s2");
        let mut dev = Device::boot(radio, config).unwrap();
        let own_long = dev.long_addr;

        dev.on_packet(&sample_beacon_frame(0xBEEF, 0x0000), 0).unwrap();
        assert!(dev.wait_response.is_some());

        let coord_long = [0x55; 8];
        let response = assoc_response_frame(own_long, coord_long, 0xBEEF, 0x0042, AssocStatus::AssocSuccess, 3);
        dev.on_packet(&response, 1_000).unwrap();

        assert!(dev.wait_response.is_none());
        assert_eq!(dev.config.panid, 0xBEEF);
        assert_eq!(dev.config.coordinator, coord_long);
        assert_eq!(dev.config.short_addr, Some(0x0042));
    }

    #[test]
    fn s3_association_timeout_returns_to_idle() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("s3");
        let mut dev = Device::boot(radio, config).unwrap();

        dev.on_packet(&sample_beacon_frame(0xBEEF, 0x0000), 0).unwrap();
        assert!(dev.wait_response.is_some());

        dev.on_tick(ASSOC_TIMEOUT_MS).unwrap();
        assert!(dev.wait_response.is_none());
        assert_eq!(dev.config.short_addr, None);
    }

    #[test]
    fn association_response_with_access_denied_does_not_persist() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("denied");
        let mut dev = Device::boot(radio, config).unwrap();
        let own_long = dev.long_addr;

        dev.on_packet(&sample_beacon_frame(0xBEEF, 0x0000), 0).unwrap();
        let response = assoc_response_frame(own_long, [0x66; 8], 0xBEEF, 0xFFFF, AssocStatus::AccessDenied, 9);
        dev.on_packet(&response, 500).unwrap();

        assert!(dev.wait_response.is_none());
        assert_eq!(dev.config.short_addr, None);
    }
}
