//! Beacon payload (BCN) encode/decode, spec.md §3/§4.2.

use byteorder::{BigEndian, ByteOrder};

use crate::error::MalformedFrame;

const VENDOR_MAGIC: &[u8; 4] = b"Zag!";
const MAX_PEND_ADDR: u8 = 7;

mod superframe_bits {
    pub const BCN_ORDER: u16 = 0;
    pub const SUPERFRAME_ORDER: u16 = 4;
    pub const FINAL_CAP_SLOT: u16 = 8;
    pub const BLE: u16 = 12;
    pub const PAN_COORDINATOR: u16 = 14;
    pub const ASSOCIATION_PERMIT: u16 = 15;
}

/// Bit-packed superframe specification, spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Superframe(pub u16);

impl Superframe {
    fn field(&self, shift: u16, mask: u16) -> u16 {
        (self.0 >> shift) & mask
    }

    fn set_field(&mut self, shift: u16, mask: u16, value: u16) {
        self.0 = (self.0 & !(mask << shift)) | ((value & mask) << shift);
    }

    pub fn bcn_order(&self) -> u16 {
        self.field(superframe_bits::BCN_ORDER, 0xF)
    }

    pub fn set_bcn_order(&mut self, v: u16) -> &mut Self {
        self.set_field(superframe_bits::BCN_ORDER, 0xF, v);
        self
    }

    pub fn superframe_order(&self) -> u16 {
        self.field(superframe_bits::SUPERFRAME_ORDER, 0xF)
    }

    pub fn set_superframe_order(&mut self, v: u16) -> &mut Self {
        self.set_field(superframe_bits::SUPERFRAME_ORDER, 0xF, v);
        self
    }

    pub fn pan_coordinator(&self) -> bool {
        self.field(superframe_bits::PAN_COORDINATOR, 0x1) != 0
    }

    pub fn set_pan_coordinator(&mut self, v: bool) -> &mut Self {
        self.set_field(superframe_bits::PAN_COORDINATOR, 0x1, v as u16);
        self
    }

    pub fn association_permit(&self) -> bool {
        self.field(superframe_bits::ASSOCIATION_PERMIT, 0x1) != 0
    }

    pub fn set_association_permit(&mut self, v: bool) -> &mut Self {
        self.set_field(superframe_bits::ASSOCIATION_PERMIT, 0x1, v as u16);
        self
    }
}

/// One GTS descriptor: a short address plus its slot/length info byte.
/// Packed on the wire as `gts_info << 16 | short_addr` per spec.md §4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GtsDescriptor {
    pub short_addr: u16,
    pub gts_info: u8,
}

/// A pending address in a beacon's pending-address list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingAddr {
    Short(u16),
    Long([u8; 8]),
}

/// The vendor beacon extension introduced by the `"Zag!"` magic.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VendorExt {
    pub ssid: String,
    /// Kept sorted ascending by the coordinator role; the codec does not
    /// enforce ordering on decode.
    pub services: Vec<u16>,
}

/// The beacon payload, spec.md §3.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Bcn {
    pub superframe: Superframe,
    pub gts_permit: bool,
    pub gts_mask: Option<u8>,
    pub gts_desc: Vec<GtsDescriptor>,
    pub pend_addr: Vec<PendingAddr>,
    pub vendor: Option<VendorExt>,
}

impl Bcn {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut sf_bytes = [0u8; 2];
        BigEndian::write_u16(&mut sf_bytes, self.superframe.0);
        buf.extend_from_slice(&sf_bytes);

        let gts_spec = (self.gts_desc.len() as u8 & 0x3) | ((self.gts_permit as u8) << 7);
        buf.push(gts_spec);

        if !self.gts_desc.is_empty() {
            buf.push(self.gts_mask.unwrap_or(0));
            for desc in &self.gts_desc {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, desc.short_addr);
                buf.extend_from_slice(&b);
                buf.push(desc.gts_info);
            }
        }

        let num_short = self
            .pend_addr
            .iter()
            .filter(|a| matches!(a, PendingAddr::Short(_)))
            .count() as u8;
        let num_long = self
            .pend_addr
            .iter()
            .filter(|a| matches!(a, PendingAddr::Long(_)))
            .count() as u8;
        buf.push((num_long << 4) | num_short);
        for addr in &self.pend_addr {
            if let PendingAddr::Short(a) = addr {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, *a);
                buf.extend_from_slice(&b);
            }
        }
        // Per-element emission: the original encoder serialised the list
        // object itself here rather than each long address in turn (spec.md
        // §9 Open Question); this implements the intended per-element form.
        for addr in &self.pend_addr {
            if let PendingAddr::Long(a) = addr {
                buf.extend_from_slice(a);
            }
        }

        if let Some(vendor) = &self.vendor {
            buf.extend_from_slice(VENDOR_MAGIC);
            let ssid_bytes = vendor.ssid.as_bytes();
            buf.push(ssid_bytes.len() as u8);
            buf.extend_from_slice(ssid_bytes);
            buf.push(vendor.services.len() as u8);
            for service in &vendor.services {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, *service);
                buf.extend_from_slice(&b);
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<(Bcn, &[u8]), MalformedFrame> {
        if data.len() < 3 {
            return Err(MalformedFrame::ShortBuffer);
        }
        let superframe = Superframe(BigEndian::read_u16(&data[0..2]));
        let gts_spec = data[2];
        let mut offset = 3;

        let num_desc = gts_spec & 0x3;
        let gts_permit = gts_spec & 0x80 != 0;

        let mut gts_mask = None;
        let mut gts_desc = Vec::new();
        if num_desc > 0 {
            if data.len() < offset + 1 {
                return Err(MalformedFrame::ShortBuffer);
            }
            gts_mask = Some(data[offset]);
            offset += 1;
            for _ in 0..num_desc {
                if data.len() < offset + 3 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                let short_addr = BigEndian::read_u16(&data[offset..offset + 2]);
                let gts_info = data[offset + 2];
                gts_desc.push(GtsDescriptor { short_addr, gts_info });
                offset += 3;
            }
        }

        if data.len() < offset + 1 {
            return Err(MalformedFrame::ShortBuffer);
        }
        let pend_addr_spec = data[offset];
        offset += 1;

        let num_short = pend_addr_spec & 0xF;
        let num_long = (pend_addr_spec >> 4) & 0xF;
        if num_short > MAX_PEND_ADDR || num_long > MAX_PEND_ADDR {
            return Err(MalformedFrame::AddrListTooLong);
        }

        let mut pend_addr = Vec::new();
        for _ in 0..num_short {
            if data.len() < offset + 2 {
                return Err(MalformedFrame::ShortBuffer);
            }
            pend_addr.push(PendingAddr::Short(BigEndian::read_u16(&data[offset..offset + 2])));
            offset += 2;
        }
        for _ in 0..num_long {
            if data.len() < offset + 8 {
                return Err(MalformedFrame::ShortBuffer);
            }
            let mut a = [0u8; 8];
            a.copy_from_slice(&data[offset..offset + 8]);
            pend_addr.push(PendingAddr::Long(a));
            offset += 8;
        }

        let mut vendor = None;
        if data.len() >= offset + 4 && &data[offset..offset + 4] == VENDOR_MAGIC {
            offset += 4;
            if data.len() < offset + 1 {
                return Err(MalformedFrame::ShortBuffer);
            }
            let ssid_len = data[offset] as usize;
            offset += 1;
            if data.len() < offset + ssid_len {
                return Err(MalformedFrame::ShortBuffer);
            }
            let ssid = std::str::from_utf8(&data[offset..offset + ssid_len])
                .map_err(|_| MalformedFrame::InvalidUtf8)?
                .to_string();
            offset += ssid_len;

            if data.len() < offset + 1 {
                return Err(MalformedFrame::ShortBuffer);
            }
            let num_services = data[offset] as usize;
            offset += 1;
            let mut services = Vec::with_capacity(num_services);
            for _ in 0..num_services {
                if data.len() < offset + 2 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                services.push(BigEndian::read_u16(&data[offset..offset + 2]));
                offset += 2;
            }
            vendor = Some(VendorExt { ssid, services });
        }

        Ok((
            Bcn {
                superframe,
                gts_permit,
                gts_mask,
                gts_desc,
                pend_addr,
                vendor,
            },
            &data[offset..],
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn coordinator_beacon() -> Bcn {
        let mut sf = Superframe::default();
        sf.set_bcn_order(15).set_superframe_order(15).set_pan_coordinator(true).set_association_permit(true);
        Bcn {
            superframe: sf,
            gts_permit: false,
            gts_mask: None,
            gts_desc: Vec::new(),
            pend_addr: Vec::new(),
            vendor: Some(VendorExt { ssid: "Sample".into(), services: vec![0] }),
        }
    }

    #[test]
    fn round_trip_with_vendor_ext() {
        let bcn = coordinator_beacon();
        let mut buf = Vec::new();
        bcn.encode(&mut buf);
        let (decoded, rest) = Bcn::decode(&buf).unwrap();
        assert_eq!(decoded, bcn);
        assert!(rest.is_empty());
    }

    #[test]
    fn round_trip_without_vendor_ext() {
        let mut bcn = coordinator_beacon();
        bcn.vendor = None;
        let mut buf = Vec::new();
        bcn.encode(&mut buf);
        let (decoded, rest) = Bcn::decode(&buf).unwrap();
        assert_eq!(decoded, bcn);
        assert!(rest.is_empty());
    }

    #[test]
    fn round_trip_with_gts_and_pending_addresses() {
        let mut bcn = coordinator_beacon();
        bcn.gts_mask = Some(0b101);
        bcn.gts_desc = vec![
            GtsDescriptor { short_addr: 1, gts_info: 2 },
            GtsDescriptor { short_addr: 3, gts_info: 4 },
        ];
        bcn.pend_addr = vec![
            PendingAddr::Short(0x1111),
            PendingAddr::Short(0x2222),
            PendingAddr::Long([9; 8]),
            PendingAddr::Long([8; 8]),
        ];
        let mut buf = Vec::new();
        bcn.encode(&mut buf);
        let (decoded, rest) = Bcn::decode(&buf).unwrap();
        assert_eq!(decoded, bcn);
        assert!(rest.is_empty());
    }

    #[test]
    fn rejects_pending_address_count_above_seven() {
        let mut bcn = coordinator_beacon();
        let mut buf = Vec::new();
        bcn.encode(&mut buf);
        // Corrupt the pend_addr_spec byte (superframe(2) + gts_spec(1)) to claim 8 short addrs.
        buf[3] = 8;
        assert_eq!(Bcn::decode(&buf), Err(MalformedFrame::AddrListTooLong));
    }

    #[test]
    fn rejects_non_utf8_ssid() {
        let mut bcn = coordinator_beacon();
        bcn.vendor = Some(VendorExt { ssid: String::new(), services: Vec::new() });
        let mut buf = Vec::new();
        bcn.encode(&mut buf);
        // Overwrite the (zero-length) ssid slot with one invalid byte.
        let magic_at = buf.len() - 1 /* num_services */ - 1 /* ssid_len */ - 4 /* magic */;
        let ssid_len_at = magic_at + 4;
        buf[ssid_len_at] = 1;
        buf.insert(ssid_len_at + 1, 0xFF);
        assert_eq!(Bcn::decode(&buf), Err(MalformedFrame::InvalidUtf8));
    }
}
