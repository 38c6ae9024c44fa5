//! Wakechat core library: resilient client and conversation engine for a chat backend that
//! may be asleep (scale-to-zero) when the first message arrives.

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod init;
pub mod orchestrator;
pub mod protocol;
pub mod readiness;
pub mod session;
pub mod storage;
