//! An embeddable Lua scripting layer for a real-time media relay.
//!
//! The host (the process terminating the media transports) hands signaling
//! and media to a [`Bridge`]; the bridge hands policy decisions to a Lua
//! script and keeps the media hot path native. The script drives the host
//! back through a fixed set of global call-outs (relaying, recording,
//! recipient wiring, event pushes).
//!
//! ```text
//!  host callbacks ──► Bridge ──► ScriptEngine ──► script call-ins
//!                       │            ▲
//!                       │            │ call-outs (pushEvent, relayRtp, ...)
//!                       ▼            │
//!                  SessionRegistry ──┘
//!                       │
//!                       ▼
//!                  relay fan-out ──► Host trait (back into the host)
//! ```
//!
//! Threading: one mutex guards the Lua state; every call-in runs on a fresh
//! coroutine under that mutex. Call-outs that would re-enter the host while
//! the engine lock is held (`closePc`, `pushEvent` with a JSEP) are deferred
//! to short-lived worker threads. A dedicated scheduler thread resumes
//! script coroutines on demand.

mod bridge;
mod config;
mod host;
mod recording;
mod registry;
mod relay;
mod rtcp;
mod rtp;
mod scheduler;
mod script;
mod session;

pub use bridge::{Bridge, MessageResult};
pub use config::Config;
pub use host::{Host, HostHandle, Recorder};
pub use session::Medium;
