//! Session Module - the application-facing API
//!
//! - Connect / disconnect one drawing session
//! - Send and receive draw events
//! - Status for the user interface

mod controller;

pub use controller::{SessionController, SessionError, SessionStatus};
