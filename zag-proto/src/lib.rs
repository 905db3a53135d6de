//! `zag-proto`: the framed host<->radio transport, the MAC frame codec
//! (MHR/BCN/CMD), the shared retry/ack layer, persistent configuration, and
//! a monotonic timer abstraction. Consumed by the `zag-coordinator` and
//! `zag-device` role binaries.

pub mod codec;
pub mod config;
pub mod error;
pub mod radio;
pub mod retry;
pub mod timer;
pub mod transport;

/// Commonly imported items, mirroring the teacher's own `prelude` module.
pub mod prelude {
    pub use crate::codec::{Addr, AddrMode, Bcn, Cmd, Frame, FrameBody, FrameControl, FrameType, Mhr, Version};
    pub use crate::config::{CoordinatorConfig, DeviceConfig};
    pub use crate::error::{ConfigError, MalformedFrame, ResponseError, RetryExhausted, TransportError};
    pub use crate::radio::{Param, Radio, RadioError, RadioResult, RxMode, TransmitResult, TxMode};
    pub use crate::retry::PendingAck;
    pub use crate::timer::{SystemTimer, Timer};
    pub use crate::transport::{Event, RequestError, RequestKind, SerialLink, Transport};
}
