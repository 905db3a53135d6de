//! Coordinator role state machine, spec.md §4.3: beacon emission, device
//! admission with an operator-gated approval step, and short-address
//! allocation.

use log::{info, trace, warn};
use rand::Rng;

use zag_proto::codec::bcn::{Superframe, VendorExt};
use zag_proto::codec::cmd::{AssocStatus, Identifier};
use zag_proto::prelude::*;

const PENDING_APPROVAL_TIMEOUT_MS: u64 = 30_000;
const BLINK_INTERVAL_MS: u64 = 250;
const MAX_DEVICES: usize = 0xFFFD;
const GREEN_LED: u8 = 0x02;

/// `PendingApproval(long_addr, started_at)` from spec.md §4.3; `Normal` is
/// the implicit absence of this state.
struct PendingApproval {
    long_addr: [u8; 8],
    started_at_ms: u64,
}

struct Blink {
    mask: u8,
    last_toggle_ms: u64,
}

pub struct Coordinator<'t> {
    radio: Radio<'t>,
    config: CoordinatorConfig,
    long_addr: [u8; 8],
    short_addr: u16,
    bsn: u8,
    dsn: u8,
    pending_associate: Option<PendingApproval>,
    pending_ack: Option<PendingAck>,
    blink: Option<Blink>,
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

impl<'t> Coordinator<'t> {
    /// Boots the coordinator: prints its identity, allocates a PAN-ID on
    /// first run, and pushes the radio's operating parameters (spec.md
    /// §4.3 "On boot"). Any radio failure here is fatal startup, so it is
    /// not smoothed over the way steady-state operation is.
    pub fn boot(radio: Radio<'t>, mut config: CoordinatorConfig) -> Result<Self, RadioError> {
        let (_, long_addr_bytes) = radio.get_object(Param::LongAddr, 8)?;
        let mut long_addr = [0u8; 8];
        let n = long_addr_bytes.len().min(8);
        long_addr[..n].copy_from_slice(&long_addr_bytes[..n]);
        info!("I'm {}", hex_upper(&long_addr));

        if config.panid == 0xFFFF {
            config.panid = rand::thread_rng().gen_range(0..=0xFFFD);
            if let Err(e) = config.save() {
                warn!("failed to persist allocated panid: {e}");
            }
        }

        radio.set_value(Param::Channel, config.channel as u16)?;
        radio.set_value(Param::RxMode, 0)?;
        radio.set_value(Param::TxMode, TxMode::SEND_ON_CCA.bits())?;
        radio.set_leds(0xFF, 0)?;

        let mut rng = rand::thread_rng();
        Ok(Self {
            radio,
            config,
            long_addr,
            short_addr: 0x0000,
            bsn: rng.gen(),
            dsn: rng.gen(),
            pending_associate: None,
            pending_ack: None,
            blink: None,
        })
    }

    /// The nearest deadline across pending-ack retries, the pending-approval
    /// timeout, and the blink toggle, so the caller's event-channel wait can
    /// time out exactly when something needs attention (spec.md §9 "Event
    /// loop with deadlines").
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let mut deadline = self.pending_ack.as_ref().map(PendingAck::next_deadline_ms);
        if let Some(pending) = &self.pending_associate {
            let t = pending.started_at_ms + PENDING_APPROVAL_TIMEOUT_MS;
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        }
        if let Some(blink) = &self.blink {
            let t = blink.last_toggle_ms + BLINK_INTERVAL_MS;
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        }
        deadline
    }

    /// Advances all wall-clock deadlines: pending-ack retransmit/exhaustion,
    /// pending-approval timeout, and blink toggling.
    pub fn on_tick(&mut self, now_ms: u64) -> Result<(), TransportError> {
        if let Some(pending) = &mut self.pending_ack {
            match pending.poll(now_ms) {
                Ok(Some(packet)) => {
                    let packet = packet.to_vec();
                    shrug_response(self.radio.send_packet(&packet), "retransmit")?;
                }
                Ok(None) => {}
                Err(_) => {
                    warn!("association response retries exhausted, giving up");
                    self.pending_ack = None;
                }
            }
        }

        if let Some(pending) = &self.pending_associate {
            if now_ms.saturating_sub(pending.started_at_ms) >= PENDING_APPROVAL_TIMEOUT_MS {
                let long_addr = pending.long_addr;
                self.pending_associate = None;
                self.send_association_response(long_addr, true, now_ms)?;
                self.end_blink(GREEN_LED)?;
            }
        }

        if let Some(blink) = &mut self.blink {
            if now_ms.saturating_sub(blink.last_toggle_ms) >= BLINK_INTERVAL_MS {
                blink.last_toggle_ms = now_ms;
                let mask = blink.mask;
                if let Some(current) = shrug_response(self.radio.get_leds(), "led read")? {
                    shrug_response(self.radio.set_leds(mask, current ^ mask), "led toggle")?;
                }
            }
        }

        Ok(())
    }

    /// Dispatches one received frame, spec.md §4.3's `packet_handler`.
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

    fn on_command(&mut self, mhr: &Mhr, cmd: &Cmd, now_ms: u64) -> Result<(), TransportError> {
        match cmd.known_identifier() {
            Some(Identifier::BcnRequest) => self.on_bcn_request(mhr),
            Some(Identifier::AssociationRequest) => self.on_association_request(mhr, now_ms),
            _ => Ok(()),
        }
    }

    fn on_bcn_request(&mut self, mhr: &Mhr) -> Result<(), TransportError> {
        if mhr.frame_control.src_mode_bits() != AddrMode::None as u16 {
            return Ok(());
        }
        if mhr.frame_control.dst_mode_bits() != AddrMode::Short as u16 {
            return Ok(());
        }
        if mhr.dst_panid != Some(0xFFFF) {
            return Ok(());
        }
        if mhr.dst_addr.as_short() != Some(0xFFFF) {
            return Ok(());
        }
        self.send_beacon()
    }

    fn send_beacon(&mut self) -> Result<(), TransportError> {
        let mut mhr = Mhr::new(FrameType::Beacon);
        mhr.seq_num = self.bsn;
        mhr.set_src(self.config.panid, Addr::Short(self.short_addr));

        let mut superframe = Superframe::default();
        superframe
            .set_bcn_order(15)
            .set_superframe_order(15)
            .set_pan_coordinator(true)
            .set_association_permit(true);
        let bcn = Bcn {
            superframe,
            gts_permit: false,
            gts_mask: None,
            gts_desc: Vec::new(),
            pend_addr: Vec::new(),
            vendor: Some(VendorExt { ssid: self.config.ssid.clone(), services: self.config.services.clone() }),
        };

        let frame = Frame { mhr, body: FrameBody::Beacon(bcn) }.encode();
        shrug_response(self.radio.send_packet(&frame), "beacon send")?;
        self.bsn = self.bsn.wrapping_add(1);
        Ok(())
    }

    fn on_association_request(&mut self, mhr: &Mhr, now_ms: u64) -> Result<(), TransportError> {
        if !mhr.frame_control.req_ack() {
            return Ok(());
        }
        if mhr.frame_control.dst_mode_bits() != AddrMode::Short as u16 {
            return Ok(());
        }
        if mhr.frame_control.src_mode_bits() != AddrMode::Long as u16 {
            return Ok(());
        }
        if mhr.dst_panid != Some(self.config.panid) {
            return Ok(());
        }
        if mhr.dst_addr.as_short() != Some(self.short_addr) {
            return Ok(());
        }
        if mhr.src_panid != Some(0xFFFF) {
            return Ok(());
        }
        let src_long = match mhr.src_addr.as_long() {
            Some(a) => a,
            None => return Ok(()),
        };

        self.send_ack(mhr.seq_num)?;

        if let Some(pending) = &self.pending_associate {
            if pending.long_addr != src_long {
                return self.send_association_response(src_long, true, now_ms);
            }
        }

        if self.config.devices.values().any(|long| *long == src_long) {
            self.send_association_response(src_long, false, now_ms)
        } else {
            self.pending_associate = Some(PendingApproval { long_addr: src_long, started_at_ms: now_ms });
            self.start_blink(GREEN_LED, now_ms)
        }
    }

    /// On button 1: allocate a fresh short address for the pending device
    /// and grant it, spec.md §4.3 "On button 1".
    pub fn on_button(&mut self, button: u8, now_ms: u64) -> Result<(), TransportError> {
        if button != 1 {
            return Ok(());
        }
        if let Some(pending) = self.pending_associate.take() {
            self.send_association_response(pending.long_addr, false, now_ms)?;
            self.end_blink(GREEN_LED)?;
        }
        Ok(())
    }

    fn send_ack(&mut self, seq_num: u8) -> Result<(), TransportError> {
        let mut mhr = Mhr::new(FrameType::Ack);
        mhr.seq_num = seq_num;
        let frame = Frame { mhr, body: FrameBody::Ack }.encode();
        shrug_response(self.radio.send_packet(&frame), "ack send")?;
        Ok(())
    }

    /// `access_denied == true` forces an access_denied response (pending
    /// timeout or a second concurrent requester); otherwise this allocates
    /// or reuses a short address (spec.md §4.3).
    fn send_association_response(&mut self, long_addr: [u8; 8], access_denied: bool, now_ms: u64) -> Result<(), TransportError> {
        let mut short_addr = 0xFFFFu16;
        let status;

        if access_denied {
            status = AssocStatus::AccessDenied;
        } else {
            if let Some((&existing, _)) = self.config.devices.iter().find(|(_, long)| **long == long_addr) {
                short_addr = existing;
            }

            status = AssocStatus::AssocSuccess;
            if short_addr > 0xFFFD {
                if self.config.devices.len() >= MAX_DEVICES {
                    // Fixed per spec.md §9: assignment, not comparison.
                    short_addr = 0xFFFF;
                    return self.send_association_response_with(long_addr, short_addr, AssocStatus::PanAtCapacity, now_ms);
                }
                let mut rng = rand::thread_rng();
                loop {
                    let candidate = rng.gen_range(0..=0xFFFDu16);
                    if candidate == self.short_addr || self.config.devices.contains_key(&candidate) {
                        continue;
                    }
                    short_addr = candidate;
                    break;
                }
                self.config.devices.insert(short_addr, long_addr);
                if let Err(e) = self.config.save() {
                    warn!("failed to persist newly allocated device: {e}");
                }
            }
        }

        self.send_association_response_with(long_addr, short_addr, status, now_ms)
    }

    fn send_association_response_with(
        &mut self,
        long_addr: [u8; 8],
        short_addr: u16,
        status: AssocStatus,
        now_ms: u64,
    ) -> Result<(), TransportError> {
        let mut mhr = Mhr::new(FrameType::Cmd);
        mhr.frame_control.set_req_ack(true).set_panid_compression(true);
        mhr.seq_num = self.dsn;
        mhr.set_dst(self.config.panid, Addr::Long(long_addr));
        mhr.set_src(self.config.panid, Addr::Long(self.long_addr));

        let cmd = Cmd::association_response(short_addr, status);
        let frame = Frame { mhr, body: FrameBody::Command(cmd) }.encode();

        self.send_packet_wait_ack(frame, now_ms)?;
        self.dsn = self.dsn.wrapping_add(1);
        Ok(())
    }

    fn send_packet_wait_ack(&mut self, packet: Vec<u8>, now_ms: u64) -> Result<(), TransportError> {
        let seq = self.dsn;
        shrug_response(self.radio.send_packet(&packet), "association response send")?;
        self.pending_ack = Some(PendingAck::new(packet, seq, now_ms));
        Ok(())
    }

    fn start_blink(&mut self, mask: u8, now_ms: u64) -> Result<(), TransportError> {
        shrug_response(self.radio.set_leds(mask, mask), "led on")?;
        let blink_mask = self.blink.as_ref().map_or(0, |b| b.mask) | mask;
        self.blink = Some(Blink { mask: blink_mask, last_toggle_ms: now_ms });
        Ok(())
    }

    fn end_blink(&mut self, mask: u8) -> Result<(), TransportError> {
        if let Some(blink) = &mut self.blink {
            shrug_response(self.radio.set_leds(mask, !mask), "led off")?;
            blink.mask &= !mask;
            if blink.mask == 0 {
                self.blink = None;
            }
        }
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

    use zag_proto::codec::cmd::capability;

    const MAGIC: [u8; 4] = [0xAA, b'Z', b'A', b'G'];

    /// An in-memory radio that answers every request generically (boot
    /// parameters succeed, `send_packet` always reports success) and records
    /// every `send_packet` payload for inspection. Mirrors the
    /// scripted-response style of `transport::test::MockLink`, but also
    /// plays the radio's half of the protocol so [`Radio`] calls succeed.
    #[derive(Clone)]
    struct FakeLink(Arc<Mutex<FakeLinkState>>);

    struct FakeLinkState {
        to_reader: VecDeque<u8>,
        scratch: Vec<u8>,
        sent_packets: Vec<Vec<u8>>,
        leds: u8,
    }

    impl FakeLink {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(FakeLinkState {
                to_reader: VecDeque::new(),
                scratch: Vec::new(),
                sent_packets: Vec::new(),
                leds: 0,
            })))
        }

        fn sent_packets(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().sent_packets.clone()
        }
    }

    fn fake_respond(st: &mut FakeLinkState, kind: u8, payload: &[u8]) -> Vec<u8> {
        match kind {
            0 => {
                // send_packet
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
            9 => vec![0x80, 1, st.leds], // get_leds
            10 => {
                // set_leds: payload = [mask, value]
                let mask = payload[0];
                let value = payload[1];
                st.leds = (st.leds & !mask) | (value & mask);
                vec![0x80, 0]
            }
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

    fn make_config(name: &str) -> CoordinatorConfig {
        let mut path = std::env::temp_dir();
        path.push(format!("zag-coordinator-test-{name}-{:?}.ini", std::thread::current().id()));
        let _ = std::fs::remove_file(&path);
        let mut cfg = CoordinatorConfig::load(&path).unwrap();
        cfg.panid = 0x1234;
        cfg
    }

    fn assoc_request_frame(panid: u16, device_long: [u8; 8], seq: u8) -> Vec<u8> {
        let mut mhr = Mhr::new(FrameType::Cmd);
        mhr.frame_control.set_req_ack(true);
        mhr.seq_num = seq;
        mhr.set_dst(panid, Addr::Short(0x0000));
        mhr.set_src(0xFFFF, Addr::Long(device_long));
        let cmd = Cmd::association_request(capability::POWER_SOURCE | capability::ALLOCATE_ADDRESS);
        Frame { mhr, body: FrameBody::Command(cmd) }.encode()
    }

    fn bcn_request_frame() -> Vec<u8> {
        let mut mhr = Mhr::new(FrameType::Cmd);
        mhr.set_dst(0xFFFF, Addr::Short(0xFFFF));
        Frame { mhr, body: FrameBody::Command(Cmd::bcn_request()) }.encode()
    }

    fn decode_cmd(frame: &[u8]) -> (Mhr, Cmd) {
        let (decoded, _) = Frame::decode(frame).unwrap();
        match decoded.body {
            FrameBody::Command(cmd) => (decoded.mhr, cmd),
            other => panic!("expected a command frame, got {other:?}"),
        }
    }

    #[test]
    fn s1_beacon_request_is_answered_with_a_beacon() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("s1");
        let mut coord = Coordinator::boot(radio, config).unwrap();

        coord.on_packet(&bcn_request_frame(), 0).unwrap();

        let sent = link.sent_packets();
        assert_eq!(sent.len(), 1);
        let (mhr, _) = decode_cmd(&sent[0]);
        assert_eq!(mhr.frame_control.frame_type(), FrameType::Beacon);
    }

    #[test]
    fn s2_association_request_waits_for_button_then_grants() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("s2");
        let panid = config.panid;
        let mut coord = Coordinator::boot(radio, config).unwrap();

        let device_long = [0x11; 8];
        coord.on_packet(&assoc_request_frame(panid, device_long, 1), 0).unwrap();
        assert!(coord.pending_associate.is_some());
        // An ack was sent immediately; no association response yet.
        assert_eq!(link.sent_packets().len(), 1);

        coord.on_button(1, 1_000).unwrap();
        assert!(coord.pending_associate.is_none());

        let sent = link.sent_packets();
        assert_eq!(sent.len(), 2);
        let (_, cmd) = decode_cmd(&sent[1]);
        match cmd.body {
            zag_proto::codec::cmd::Body::AssociationResponse { short_addr, status } => {
                assert_eq!(status, AssocStatus::AssocSuccess);
                assert_ne!(short_addr, 0xFFFF);
                assert!(coord.config.devices.contains_key(&short_addr));
            }
            other => panic!("expected an association response, got {other:?}"),
        }
    }

    #[test]
    fn s3_pending_approval_times_out_to_access_denied() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let config = make_config("s3");
        let panid = config.panid;
        let mut coord = Coordinator::boot(radio, config).unwrap();

        let device_long = [0x22; 8];
        coord.on_packet(&assoc_request_frame(panid, device_long, 1), 0).unwrap();
        assert!(coord.pending_associate.is_some());

        coord.on_tick(PENDING_APPROVAL_TIMEOUT_MS).unwrap();
        assert!(coord.pending_associate.is_none());

        let sent = link.sent_packets();
        assert_eq!(sent.len(), 2);
        let (_, cmd) = decode_cmd(&sent[1]);
        match cmd.body {
            zag_proto::codec::cmd::Body::AssociationResponse { short_addr, status } => {
                assert_eq!(status, AssocStatus::AccessDenied);
                assert_eq!(short_addr, 0xFFFF);
            }
            other => panic!("expected an association response, got {other:?}"),
        }
    }

    #[test]
    fn s4_known_device_reassociates_without_operator_approval() {
        let link = FakeLink::new();
        let transport = Transport::new(Box::new(link.clone())).unwrap();
        let radio = Radio::new(&transport);
        let mut config = make_config("s4");
        let panid = config.panid;
        let device_long = [0x33; 8];
        config.devices.insert(0x0007, device_long);
        let mut coord = Coordinator::boot(radio, config).unwrap();

        coord.on_packet(&assoc_request_frame(panid, device_long, 5), 0).unwrap();
        assert!(coord.pending_associate.is_none());

        let sent = link.sent_packets();
        assert_eq!(sent.len(), 2);
        let (_, cmd) = decode_cmd(&sent[1]);
        match cmd.body {
            zag_proto::codec::cmd::Body::AssociationResponse { short_addr, status } => {
                assert_eq!(status, AssocStatus::AssocSuccess);
                assert_eq!(short_addr, 0x0007);
            }
            other => panic!("expected an association response, got {other:?}"),
        }
    }
}
