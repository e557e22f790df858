//! Client wire protocol
//!
//! Control messages and server events are JSON objects tagged by `type`.
//! Audio arrives either as binary WebSocket frames or as JSON `audio`
//! frames that carry an explicit sequence number.

pub mod messages;

pub use messages::{
    ClientFrame, InboundMessage, Outbound, OutboundMessage, StatusValue, DEFAULT_LANG,
};
