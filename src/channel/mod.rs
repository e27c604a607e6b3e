//! Channel Module - application data over the peer connection
//!
//! - `DrawEvent` wire format
//! - Stroke assembly for the remote side
//! - Adapter binding the `canvasData` channel

mod adapter;
mod event;

pub use adapter::{ChannelError, DataChannel, DataChannelAdapter, DrawHandler, MessageHandler};
pub use event::{DrawEvent, StrokeAssembler, StrokeUpdate};
