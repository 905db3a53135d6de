//! MAC frame codec: header (MHR), beacon payload (BCN) and command payload
//! (CMD). Spec.md §3/§4.2.

pub mod bcn;
pub mod cmd;
pub mod mhr;

pub use bcn::Bcn;
pub use cmd::Cmd;
pub use mhr::{Addr, AddrMode, FrameControl, FrameType, Mhr, Version};

use crate::error::MalformedFrame;

/// The decoded content following an MHR, dispatched on `frame_control`'s
/// frame type. `Ack`/`Data` frames carry no typed payload here; their raw
/// trailing bytes (if any) are returned alongside.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameBody {
    Ack,
    Beacon(Bcn),
    Command(Cmd),
    Other,
}

/// A fully decoded over-the-air frame: header plus dispatched body, with
/// whatever bytes neither consumed.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub mhr: Mhr,
    pub body: FrameBody,
}

impl Frame {
    /// Decodes an MHR and, based on its frame type, a BCN or CMD payload.
    /// Mirrors `debug_packet`'s dispatch in the original implementation.
    pub fn decode(data: &[u8]) -> Result<(Frame, &[u8]), MalformedFrame> {
        let (mhr, rest) = Mhr::decode(data)?;
        let (body, rest) = match mhr.frame_control.frame_type() {
            FrameType::Ack => (FrameBody::Ack, rest),
            FrameType::Beacon => {
                let (bcn, rest) = Bcn::decode(rest)?;
                (FrameBody::Beacon(bcn), rest)
            }
            FrameType::Cmd => {
                let (cmd, rest) = Cmd::decode(rest)?;
                (FrameBody::Command(cmd), rest)
            }
            _ => (FrameBody::Other, rest),
        };
        Ok((Frame { mhr, body }, rest))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.mhr.encode(&mut buf);
        match &self.body {
            FrameBody::Ack | FrameBody::Other => {}
            FrameBody::Beacon(bcn) => bcn.encode(&mut buf),
            FrameBody::Command(cmd) => cmd.encode(&mut buf),
        }
        buf
    }
}
