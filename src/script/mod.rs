//! Everything that touches the Lua state.
//!
//! ```text
//! Bridge
//!  └── ScriptEngine (one mutex, one Lua state)
//!       ├── call-ins   — native → script, serialized, fresh coroutine each
//!       ├── call-outs  — script → native globals (callouts::register)
//!       └── deferred   — call-outs that must run off the engine lock
//! ```

pub(crate) mod callouts;
pub(crate) mod deferred;
pub(crate) mod engine;
