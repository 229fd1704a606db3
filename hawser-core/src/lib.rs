//! Hawser Core
//!
//! This crate contains the runtime primitives every other hawser crate is
//! built from:
//! - One-shot asynchronous operation handles (`aio`)
//! - Sharded deadline queues driving cancellation (`expire`)
//! - The completion-callback worker pool (`task`)
//! - Deferred destruction (`reap`)
//! - Byte-stream traits and the option surface (`stream`)
//! - Transport addresses (`addr`)
//! - Platform TCP / IPC streams (`platform`)
//! - Error codes (`error`) and messages (`msg`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod addr;
pub mod aio;
pub mod error;
pub mod expire;
pub mod msg;
pub mod platform;
pub mod reap;
pub mod stream;
pub mod system;
pub mod task;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::addr::Addr;
    pub use crate::aio::{sleep_aio, Aio, Completions, Timeout};
    pub use crate::error::{Error, Result};
    pub use crate::msg::Msg;
    pub use crate::stream::{PropValue, Stream, StreamDialer, StreamListener};
    pub use crate::system::InitParams;
}
