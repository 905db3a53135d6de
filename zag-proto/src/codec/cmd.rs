//! MAC command payload (CMD) encode/decode, spec.md §3/§4.2.

use byteorder::{BigEndian, ByteOrder};

use crate::error::MalformedFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Identifier {
    AssociationRequest = 1,
    AssociationResponse = 2,
    DisassociationNotification = 3,
    DataRequest = 4,
    PanidConflict = 5,
    OrphanNotification = 6,
    BcnRequest = 7,
    CoordinatorRealignment = 8,
    GtsRequest = 9,
}

impl Identifier {
    fn from_u8(v: u8) -> Option<Self> {
        use Identifier::*;
        Some(match v {
            1 => AssociationRequest,
            2 => AssociationResponse,
            3 => DisassociationNotification,
            4 => DataRequest,
            5 => PanidConflict,
            6 => OrphanNotification,
            7 => BcnRequest,
            8 => CoordinatorRealignment,
            9 => GtsRequest,
            _ => return None,
        })
    }
}

/// Association request capability flags, spec.md §4.4.
pub mod capability {
    pub const ALT_COORDINATOR: u8 = 1 << 0;
    pub const DEV_TYPE: u8 = 1 << 1;
    pub const POWER_SOURCE: u8 = 1 << 2;
    pub const IDLE_RECV: u8 = 1 << 3;
    pub const SECURITY: u8 = 1 << 6;
    pub const ALLOCATE_ADDRESS: u8 = 1 << 7;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssocStatus {
    AssocSuccess = 0,
    PanAtCapacity = 1,
    AccessDenied = 2,
}

impl AssocStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AssocStatus::AssocSuccess,
            1 => AssocStatus::PanAtCapacity,
            _ => AssocStatus::AccessDenied,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisassocReason {
    CoordLeave = 1,
    DevLeave = 2,
}

impl DisassocReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DisassocReason::CoordLeave,
            _ => DisassocReason::DevLeave,
        }
    }
}

/// The variant-dependent command body, spec.md §3/§4.2. Unknown identifiers
/// (or ones with no body, like `bcn_request`) carry no payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Body {
    None,
    AssociationRequest { capability: u8 },
    AssociationResponse { short_addr: u16, status: AssocStatus },
    DisassociationNotification { reason: DisassocReason },
    CoordinatorRealignment { panid: u16, coord_addr: u16, channel: u8, short_addr: u16 },
    GtsRequest { characteristics: u8 },
}

/// A decoded command. `identifier` is the raw wire byte so that unknown
/// identifiers round-trip losslessly even though their `body` is empty
/// (spec.md §4.2: "Unknown identifiers yield an object with only
/// `identifier` set").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cmd {
    pub identifier: u8,
    pub body: Body,
}

impl Cmd {
    pub fn known_identifier(&self) -> Option<Identifier> {
        Identifier::from_u8(self.identifier)
    }

    pub fn association_request(capability: u8) -> Self {
        Self { identifier: Identifier::AssociationRequest as u8, body: Body::AssociationRequest { capability } }
    }

    pub fn association_response(short_addr: u16, status: AssocStatus) -> Self {
        Self {
            identifier: Identifier::AssociationResponse as u8,
            body: Body::AssociationResponse { short_addr, status },
        }
    }

    pub fn bcn_request() -> Self {
        Self { identifier: Identifier::BcnRequest as u8, body: Body::None }
    }

    pub fn disassociation_notification(reason: DisassocReason) -> Self {
        Self {
            identifier: Identifier::DisassociationNotification as u8,
            body: Body::DisassociationNotification { reason },
        }
    }

    pub fn coordinator_realignment(panid: u16, coord_addr: u16, channel: u8, short_addr: u16) -> Self {
        Self {
            identifier: Identifier::CoordinatorRealignment as u8,
            body: Body::CoordinatorRealignment { panid, coord_addr, channel, short_addr },
        }
    }

    pub fn gts_request(characteristics: u8) -> Self {
        Self { identifier: Identifier::GtsRequest as u8, body: Body::GtsRequest { characteristics } }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.identifier);
        match self.body {
            Body::None => {}
            Body::AssociationRequest { capability } => buf.push(capability),
            Body::AssociationResponse { short_addr, status } => {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, short_addr);
                buf.extend_from_slice(&b);
                buf.push(status as u8);
            }
            Body::DisassociationNotification { reason } => buf.push(reason as u8),
            Body::CoordinatorRealignment { panid, coord_addr, channel, short_addr } => {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, panid);
                buf.extend_from_slice(&b);
                BigEndian::write_u16(&mut b, coord_addr);
                buf.extend_from_slice(&b);
                buf.push(channel);
                BigEndian::write_u16(&mut b, short_addr);
                buf.extend_from_slice(&b);
            }
            Body::GtsRequest { characteristics } => buf.push(characteristics),
        }
    }

    /// Decodes a command. An unrecognised identifier yields `Body::None` and
    /// leaves the remaining bytes for the caller, per spec.md §4.2.
    pub fn decode(data: &[u8]) -> Result<(Cmd, &[u8]), MalformedFrame> {
        if data.is_empty() {
            return Err(MalformedFrame::ShortBuffer);
        }
        let raw_id = data[0];
        let mut offset = 1;

        let identifier = match Identifier::from_u8(raw_id) {
            Some(id) => id,
            None => {
                // Unknown identifier: no known body shape, return as-is.
                return Ok((Cmd { identifier: raw_id, body: Body::None }, &data[offset..]));
            }
        };

        let body = match identifier {
            Identifier::AssociationRequest => {
                if data.len() < offset + 1 {
                    return Err(MalformedFrame::TruncatedCommand);
                }
                let capability = data[offset];
                offset += 1;
                Body::AssociationRequest { capability }
            }
            Identifier::AssociationResponse => {
                if data.len() < offset + 3 {
                    return Err(MalformedFrame::TruncatedCommand);
                }
                let short_addr = BigEndian::read_u16(&data[offset..offset + 2]);
                let status = AssocStatus::from_u8(data[offset + 2]);
                offset += 3;
                Body::AssociationResponse { short_addr, status }
            }
            Identifier::DisassociationNotification => {
                if data.len() < offset + 1 {
                    return Err(MalformedFrame::TruncatedCommand);
                }
                let reason = DisassocReason::from_u8(data[offset]);
                offset += 1;
                Body::DisassociationNotification { reason }
            }
            Identifier::CoordinatorRealignment => {
                if data.len() < offset + 7 {
                    return Err(MalformedFrame::TruncatedCommand);
                }
                let panid = BigEndian::read_u16(&data[offset..offset + 2]);
                let coord_addr = BigEndian::read_u16(&data[offset + 2..offset + 4]);
                let channel = data[offset + 4];
                let short_addr = BigEndian::read_u16(&data[offset + 5..offset + 7]);
                offset += 7;
                Body::CoordinatorRealignment { panid, coord_addr, channel, short_addr }
            }
            Identifier::GtsRequest => {
                if data.len() < offset + 1 {
                    return Err(MalformedFrame::TruncatedCommand);
                }
                let characteristics = data[offset];
                offset += 1;
                Body::GtsRequest { characteristics }
            }
            Identifier::BcnRequest
            | Identifier::DataRequest
            | Identifier::PanidConflict
            | Identifier::OrphanNotification => Body::None,
        };

        Ok((Cmd { identifier: raw_id, body }, &data[offset..]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(cmd: Cmd) {
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        let (decoded, rest) = Cmd::decode(&buf).unwrap();
        assert_eq!(decoded, cmd);
        assert!(rest.is_empty());
    }

    #[test]
    fn round_trip_every_identifier() {
        round_trip(Cmd::association_request(capability::POWER_SOURCE | capability::IDLE_RECV));
        round_trip(Cmd::association_response(0x1234, AssocStatus::AssocSuccess));
        round_trip(Cmd::association_response(0xFFFF, AssocStatus::AccessDenied));
        round_trip(Cmd::association_response(0xFFFF, AssocStatus::PanAtCapacity));
        round_trip(Cmd::disassociation_notification(DisassocReason::CoordLeave));
        round_trip(Cmd::coordinator_realignment(0xBEEF, 0x0000, 11, 0x0042));
        round_trip(Cmd::gts_request(0b0001_0101));
        round_trip(Cmd::bcn_request());
    }

    #[test]
    fn unknown_identifier_yields_bare_object() {
        let (cmd, rest) = Cmd::decode(&[0xF0, 1, 2, 3]).unwrap();
        assert_eq!(cmd.body, Body::None);
        assert_eq!(rest, &[1, 2, 3]);
    }

    #[test]
    fn truncated_association_response_is_malformed() {
        let mut buf = Vec::new();
        Cmd::association_response(1, AssocStatus::AssocSuccess).encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert_eq!(Cmd::decode(&buf), Err(MalformedFrame::TruncatedCommand));
    }
}
