//! Deferred execution of host callbacks that can re-enter the bridge.
//!
//! `closePc` makes the host invoke `hangup_media` synchronously on the
//! calling thread, and `hangup_media` needs the engine lock — which the
//! call-out's thread already holds. Same story for pushing an event that
//! carries a negotiation payload. Those host calls are therefore handed to a
//! short-lived worker thread that runs them without the engine lock.

use std::sync::Arc;

use crate::host::Host;
use crate::session::Session;

/// What the worker should do once it is off the engine lock.
pub(crate) enum DeferredAction {
    PushEvent {
        transaction: Option<String>,
        event: serde_json::Value,
        jsep: Option<serde_json::Value>,
    },
    ClosePc,
}

impl DeferredAction {
    fn thread_name(&self) -> &'static str {
        match self {
            Self::PushEvent { .. } => "lua-pushevent",
            Self::ClosePc => "lua-closepc",
        }
    }
}

/// Spawn the one-shot worker. The result only says whether the worker was
/// launched; the deferred action's own outcome is not observable by the
/// caller. On spawn failure the session reference and payload are released
/// right here, synchronously.
pub(crate) fn launch(
    host: Arc<dyn Host>,
    session: Arc<Session>,
    action: DeferredAction,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(action.thread_name().to_owned())
        .spawn(move || {
            match action {
                DeferredAction::PushEvent {
                    transaction,
                    event,
                    jsep,
                } => {
                    if let Err(e) = host.push_event(
                        session.handle(),
                        transaction.as_deref(),
                        &event,
                        jsep.as_ref(),
                    ) {
                        log::warn!("Deferred pushEvent for session {} failed: {e}", session.id());
                    }
                }
                DeferredAction::ClosePc => {
                    log::debug!("Closing PeerConnection of session {}", session.id());
                    host.close_pc(session.handle());
                }
            }
            // Session reference and payload dropped here, off the engine lock.
        })
        .map(|_| ())
}
