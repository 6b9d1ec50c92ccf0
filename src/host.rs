//! The host-side contract.
//!
//! The bridge never talks to the network or the disk itself: everything
//! timing-critical or format-specific is delegated to the host through the
//! [`Host`] trait. The host in turn identifies each attached connection with
//! an opaque [`HostHandle`] it owns; the bridge only keeps a back-reference
//! to it and hands it back on every outbound call.
//!
//! Recording file formats are likewise the host's concern: the bridge asks
//! for a [`Recorder`] per medium and feeds it frames, nothing more.

use std::any::Any;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

/// Opaque per-connection handle owned by the host.
///
/// The bridge treats it as an identity: sessions are keyed by it and it is
/// passed back verbatim on every host callback. Hosts downcast it to their
/// concrete connection type.
pub type HostHandle = Arc<dyn Any + Send + Sync>;

/// A single-medium recording sink opened by the host.
///
/// Frame framing and on-disk layout are up to the implementation; the bridge
/// only appends frames in arrival order and closes the recorder when the
/// recording is stopped or the session goes away.
pub trait Recorder: Send {
    /// Append one media frame.
    fn save_frame(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush and close the sink. Called exactly once.
    fn close(&mut self);
}

/// Callbacks into the media server core.
///
/// All methods may be invoked from bridge-internal threads (deferred-event
/// workers, the coroutine scheduler) as well as from whatever thread the
/// host used to enter the bridge, so implementations must be thread-safe.
///
/// The relay methods are best-effort by design: they return nothing, and the
/// bridge never retries. Dropping a packet is preferable to blocking the
/// media path.
pub trait Host: Send + Sync {
    /// Deliver an event to the user behind `handle`, optionally tied to a
    /// request `transaction` and carrying a negotiation payload (`jsep`).
    fn push_event(
        &self,
        handle: &HostHandle,
        transaction: Option<&str>,
        event: &Value,
        jsep: Option<&Value>,
    ) -> Result<()>;

    /// Forward an out-of-band event to whatever event-handler pipeline the
    /// host runs. `handle` is `None` for events not tied to a session.
    fn notify_event(&self, handle: Option<&HostHandle>, event: &Value);

    /// Tear down the connection behind `handle`.
    ///
    /// The host may re-enter the bridge synchronously from inside this call
    /// (e.g. `hangup_media`), which is why the bridge only ever invokes it
    /// from a deferred-execution worker.
    fn close_pc(&self, handle: &HostHandle);

    /// Send an RTP packet to the connection behind `handle`.
    fn relay_rtp(&self, handle: &HostHandle, video: bool, buf: &[u8]);

    /// Send an RTCP packet to the connection behind `handle`.
    fn relay_rtcp(&self, handle: &HostHandle, video: bool, buf: &[u8]);

    /// Send a data-channel message to the connection behind `handle`.
    fn relay_data(&self, handle: &HostHandle, buf: &[u8]);

    /// Open a recording sink for one medium.
    fn create_recorder(
        &self,
        folder: &str,
        codec: &str,
        filename: &str,
    ) -> Result<Box<dyn Recorder>>;
}
