//! MAC header (MHR) encode/decode, spec.md §3/§4.2.

use byteorder::{ByteOrder, BigEndian};

use crate::error::MalformedFrame;

/// Bit positions within the 16-bit Frame Control field, named after the
/// sub-field they gate (mirrors the original `MHR.FrameControl` enum, which
/// used its integer values as shift amounts rather than field offsets).
mod bits {
    pub const FRAME_TYPE: u16 = 0;
    pub const SECURITY: u16 = 3;
    pub const PENDING: u16 = 4;
    pub const REQ_ACK: u16 = 5;
    pub const PANID_COMPRESSION: u16 = 6;
    pub const DST_MODE: u16 = 10;
    pub const VERSION: u16 = 12;
    pub const SRC_MODE: u16 = 14;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FrameType {
    Beacon = 0,
    Data = 1,
    Ack = 2,
    Cmd = 3,
    Multipurpose = 5,
    Fragment = 6,
    Extended = 7,
}

impl FrameType {
    fn from_bits(v: u16) -> Self {
        match v {
            0 => FrameType::Beacon,
            1 => FrameType::Data,
            2 => FrameType::Ack,
            3 => FrameType::Cmd,
            5 => FrameType::Multipurpose,
            6 => FrameType::Fragment,
            _ => FrameType::Extended,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    None = 0,
    Short = 2,
    Long = 3,
}

impl AddrMode {
    fn from_bits(v: u16) -> Result<Self, MalformedFrame> {
        match v {
            0 => Ok(AddrMode::None),
            2 => Ok(AddrMode::Short),
            3 => Ok(AddrMode::Long),
            _ => Err(MalformedFrame::ReservedAddrMode),
        }
    }
}

/// `frame_control >> VERSION & 0x3`. Only 2003/2006 are accepted; 2015 and
/// the reserved code point are rejected per spec.md §4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    V2003 = 0,
    V2006 = 1,
}

impl Version {
    fn from_bits(v: u16) -> Result<Self, MalformedFrame> {
        match v {
            0 => Ok(Version::V2003),
            1 => Ok(Version::V2006),
            _ => Err(MalformedFrame::UnsupportedVersion),
        }
    }
}

/// A destination or source address, tagged by the addressing mode that
/// produced it (spec.md §9: "Dynamic field layout -> tagged data").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addr {
    None,
    Short(u16),
    Long([u8; 8]),
}

impl Addr {
    pub fn mode(&self) -> AddrMode {
        match self {
            Addr::None => AddrMode::None,
            Addr::Short(_) => AddrMode::Short,
            Addr::Long(_) => AddrMode::Long,
        }
    }

    pub fn as_short(&self) -> Option<u16> {
        match self {
            Addr::Short(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<[u8; 8]> {
        match self {
            Addr::Long(a) => Some(*a),
            _ => None,
        }
    }
}

/// The 16-bit Frame Control field, wrapped so its sub-fields can be read and
/// written without re-deriving shift amounts at every call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FrameControl(pub u16);

impl FrameControl {
    pub fn new() -> Self {
        Self(0)
    }

    fn field(&self, shift: u16, mask: u16) -> u16 {
        (self.0 >> shift) & mask
    }

    fn set_field(&mut self, shift: u16, mask: u16, value: u16) {
        self.0 = (self.0 & !(mask << shift)) | ((value & mask) << shift);
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from_bits(self.field(bits::FRAME_TYPE, 0x7))
    }

    pub fn set_frame_type(&mut self, ft: FrameType) -> &mut Self {
        self.set_field(bits::FRAME_TYPE, 0x7, ft as u16);
        self
    }

    pub fn security(&self) -> bool {
        self.field(bits::SECURITY, 0x1) != 0
    }

    pub fn pending(&self) -> bool {
        self.field(bits::PENDING, 0x1) != 0
    }

    pub fn req_ack(&self) -> bool {
        self.field(bits::REQ_ACK, 0x1) != 0
    }

    pub fn set_req_ack(&mut self, v: bool) -> &mut Self {
        self.set_field(bits::REQ_ACK, 0x1, v as u16);
        self
    }

    pub fn panid_compression(&self) -> bool {
        self.field(bits::PANID_COMPRESSION, 0x1) != 0
    }

    pub fn set_panid_compression(&mut self, v: bool) -> &mut Self {
        self.set_field(bits::PANID_COMPRESSION, 0x1, v as u16);
        self
    }

    pub fn dst_mode_bits(&self) -> u16 {
        self.field(bits::DST_MODE, 0x3)
    }

    pub fn set_dst_mode(&mut self, m: AddrMode) -> &mut Self {
        self.set_field(bits::DST_MODE, 0x3, m as u16);
        self
    }

    pub fn version_bits(&self) -> u16 {
        self.field(bits::VERSION, 0x3)
    }

    pub fn set_version(&mut self, v: Version) -> &mut Self {
        self.set_field(bits::VERSION, 0x3, v as u16);
        self
    }

    pub fn src_mode_bits(&self) -> u16 {
        self.field(bits::SRC_MODE, 0x3)
    }

    pub fn set_src_mode(&mut self, m: AddrMode) -> &mut Self {
        self.set_field(bits::SRC_MODE, 0x3, m as u16);
        self
    }
}

/// The MAC header, spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mhr {
    pub frame_control: FrameControl,
    pub seq_num: u8,
    pub dst_panid: Option<u16>,
    pub dst_addr: Addr,
    pub src_panid: Option<u16>,
    pub src_addr: Addr,
}

impl Mhr {
    pub fn new(frame_type: FrameType) -> Self {
        let mut fc = FrameControl::new();
        fc.set_frame_type(frame_type).set_version(Version::V2006);
        Self {
            frame_control: fc,
            seq_num: 0,
            dst_panid: None,
            dst_addr: Addr::None,
            src_panid: None,
            src_addr: Addr::None,
        }
    }

    pub fn set_dst(&mut self, panid: u16, addr: Addr) -> &mut Self {
        self.frame_control.set_dst_mode(addr.mode());
        self.dst_panid = Some(panid);
        self.dst_addr = addr;
        self
    }

    pub fn set_src(&mut self, panid: u16, addr: Addr) -> &mut Self {
        self.frame_control.set_src_mode(addr.mode());
        self.src_panid = Some(panid);
        self.src_addr = addr;
        self
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let fc_start = buf.len();
        buf.extend_from_slice(&[0u8; 2]);
        BigEndian::write_u16(&mut buf[fc_start..fc_start + 2], self.frame_control.0);
        buf.push(self.seq_num);

        let dst_mode = self.frame_control.dst_mode_bits();
        if dst_mode == AddrMode::Short as u16 || dst_mode == AddrMode::Long as u16 {
            let panid = self.dst_panid.expect("dst_panid required when dst_mode is addressed");
            let mut b = [0u8; 2];
            BigEndian::write_u16(&mut b, panid);
            buf.extend_from_slice(&b);
        }
        match self.dst_addr {
            Addr::None => {}
            Addr::Short(a) => {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, a);
                buf.extend_from_slice(&b);
            }
            Addr::Long(a) => buf.extend_from_slice(&a),
        }

        let src_mode = self.frame_control.src_mode_bits();
        let addressed = src_mode == AddrMode::Short as u16 || src_mode == AddrMode::Long as u16;
        if addressed && !self.frame_control.panid_compression() {
            let panid = self.src_panid.expect("src_panid required when src_mode is addressed");
            let mut b = [0u8; 2];
            BigEndian::write_u16(&mut b, panid);
            buf.extend_from_slice(&b);
        }
        match self.src_addr {
            Addr::None => {}
            Addr::Short(a) => {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, a);
                buf.extend_from_slice(&b);
            }
            Addr::Long(a) => buf.extend_from_slice(&a),
        }
    }

    pub fn decode(data: &[u8]) -> Result<(Mhr, &[u8]), MalformedFrame> {
        if data.len() < 3 {
            return Err(MalformedFrame::ShortBuffer);
        }
        let fc = FrameControl(BigEndian::read_u16(&data[0..2]));
        let seq_num = data[2];
        let mut offset = 3;

        Version::from_bits(fc.version_bits())?;
        let dst_mode = AddrMode::from_bits(fc.dst_mode_bits())?;
        let src_mode = AddrMode::from_bits(fc.src_mode_bits())?;

        let mut dst_panid = None;
        if matches!(dst_mode, AddrMode::Short | AddrMode::Long) {
            if data.len() < offset + 2 {
                return Err(MalformedFrame::ShortBuffer);
            }
            dst_panid = Some(BigEndian::read_u16(&data[offset..offset + 2]));
            offset += 2;
        }

        let dst_addr = match dst_mode {
            AddrMode::None => Addr::None,
            AddrMode::Short => {
                if data.len() < offset + 2 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                let a = BigEndian::read_u16(&data[offset..offset + 2]);
                offset += 2;
                Addr::Short(a)
            }
            AddrMode::Long => {
                if data.len() < offset + 8 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                let mut a = [0u8; 8];
                a.copy_from_slice(&data[offset..offset + 8]);
                offset += 8;
                Addr::Long(a)
            }
        };

        let addressed = matches!(src_mode, AddrMode::Short | AddrMode::Long);
        let dst_addressed = matches!(dst_mode, AddrMode::Short | AddrMode::Long);
        let mut src_panid = None;
        if addressed {
            if fc.panid_compression() && dst_addressed {
                src_panid = dst_panid;
            } else {
                if data.len() < offset + 2 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                src_panid = Some(BigEndian::read_u16(&data[offset..offset + 2]));
                offset += 2;
            }
        }

        let src_addr = match src_mode {
            AddrMode::None => Addr::None,
            AddrMode::Short => {
                if data.len() < offset + 2 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                let a = BigEndian::read_u16(&data[offset..offset + 2]);
                offset += 2;
                Addr::Short(a)
            }
            AddrMode::Long => {
                if data.len() < offset + 8 {
                    return Err(MalformedFrame::ShortBuffer);
                }
                let mut a = [0u8; 8];
                a.copy_from_slice(&data[offset..offset + 8]);
                offset += 8;
                Addr::Long(a)
            }
        };

        Ok((
            Mhr {
                frame_control: fc,
                seq_num,
                dst_panid,
                dst_addr,
                src_panid,
                src_addr,
            },
            &data[offset..],
        ))
    }
}
