//! micad protocol module.
//!
//! Packs the creation record, formats control commands and performs the
//! single-shot Unix socket round trips both protocols share.

mod client;
mod codec;

pub use client::DaemonClient;
pub use codec::{
    ControlCommand, CreateMessage, DaemonReply, CREATE_MESSAGE_SIZE, FAILED_SENTINEL,
    SUCCESS_SENTINEL,
};
