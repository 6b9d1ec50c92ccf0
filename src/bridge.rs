//! The bridge itself: lifecycle, host-facing entry points, and the glue
//! between the session registry, the script engine gateway, the scheduler
//! and the media relay.
//!
//! Every entry point first consults the stopping/initialized flags, then
//! resolves the host handle to a session, and only then (if the operation is
//! a policy decision) enters the script engine. Media packets never enter
//! the engine unless the script opted in by defining the corresponding
//! `incoming*` function.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use crate::config::Config;
use crate::host::{Host, HostHandle};
use crate::registry::SessionRegistry;
use crate::relay;
use crate::rtcp;
use crate::scheduler::{self, SchedulerEvent};
use crate::script::callouts;
use crate::script::engine::ScriptEngine;
use crate::session::Medium;

/// Script functions that must exist; a missing one aborts initialization.
const REQUIRED_FUNCTIONS: [&str; 9] = [
    "init",
    "destroy",
    "resumeScheduler",
    "createSession",
    "destroySession",
    "querySession",
    "handleMessage",
    "setupMedia",
    "hangupMedia",
];

/// State shared with call-outs, deferred workers and the scheduler thread.
pub(crate) struct Shared {
    pub host: Arc<dyn Host>,
    pub registry: SessionRegistry,
    scheduler_tx: Sender<SchedulerEvent>,
    stopping: AtomicBool,
}

impl Shared {
    pub(crate) fn new(host: Arc<dyn Host>, scheduler_tx: Sender<SchedulerEvent>) -> Self {
        Self {
            host,
            registry: SessionRegistry::new(),
            scheduler_tx,
            stopping: AtomicBool::new(false),
        }
    }

    /// Wake the scheduler thread. Never blocks; tokens may coalesce.
    pub(crate) fn poke_scheduler(&self) {
        let _ = self.scheduler_tx.send(SchedulerEvent::Resume);
    }

    fn signal_exit(&self) {
        let _ = self.scheduler_tx.send(SchedulerEvent::Exit);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Returns whether this call initiated the shutdown.
    fn begin_stopping(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }
}

/// Outcome of [`Bridge::handle_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageResult {
    /// The script answered synchronously with this response payload.
    Success(Value),
    /// The script accepted the message and will answer later through
    /// `pushEvent`.
    Pending,
}

struct Inner {
    shared: Arc<Shared>,
    engine: Arc<ScriptEngine>,
    has_incoming_rtp: bool,
    has_incoming_rtcp: bool,
    has_incoming_data: bool,
    initialized: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// The embeddable scripting bridge. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("initialized", &self.inner.initialized.load(Ordering::SeqCst))
            .field("stopping", &self.inner.shared.is_stopping())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Boot the bridge: load the script, verify its contract, run its
    /// `init()`, and start the scheduler thread.
    pub fn init(host: Arc<dyn Host>, config: &Config) -> Result<Self> {
        if config.script.as_os_str().is_empty() {
            bail!("Missing script path in the bridge configuration");
        }
        let (scheduler_tx, scheduler_rx) = mpsc::channel();
        let shared = Arc::new(Shared::new(host, scheduler_tx));
        let engine = Arc::new(ScriptEngine::new());

        if let Some(folder) = &config.path {
            engine.append_package_path(folder)?;
        }
        engine.with_lua(|lua| callouts::register(lua, &shared))?;
        engine.load_file(&config.script)?;
        engine.verify_functions(&REQUIRED_FUNCTIONS)?;

        // Optional media handlers: when present, forwarding for that kind is
        // fully delegated to the script.
        let has_incoming_rtp = engine.has_function("incomingRtp");
        let has_incoming_rtcp = engine.has_function("incomingRtcp");
        let has_incoming_data = engine.has_function("incomingData");

        engine
            .call_in::<_, ()>("init", config.config.clone())
            .context("Script init() failed")?;

        let scheduler = scheduler::spawn(Arc::clone(&engine), Arc::clone(&shared), scheduler_rx)
            .context("Failed to launch the scheduler thread")?;

        log::info!("Bridge initialized (script: {})", config.script.display());
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                engine,
                has_incoming_rtp,
                has_incoming_rtcp,
                has_incoming_data,
                initialized: AtomicBool::new(true),
                scheduler: Mutex::new(Some(scheduler)),
            }),
        })
    }

    fn running(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst) && !self.inner.shared.is_stopping()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shared.is_stopping() {
            bail!("Shutting down");
        }
        if !self.inner.initialized.load(Ordering::SeqCst) {
            bail!("Bridge not initialized");
        }
        Ok(())
    }

    /// Shut down: stop admitting work, terminate the scheduler, run the
    /// script's `destroy()`, tear down the registry.
    pub fn destroy(&self) -> Result<()> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.shared.begin_stopping() {
            return Ok(());
        }
        self.inner.shared.signal_exit();
        let scheduler = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = scheduler {
            if handle.join().is_err() {
                log::error!("Scheduler thread panicked during shutdown");
            }
        }
        if let Err(e) = self.inner.engine.call_in::<_, ()>("destroy", ()) {
            log::warn!("Script destroy() failed: {e}");
        }
        self.inner.shared.registry.clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
        log::info!("Bridge destroyed");
        Ok(())
    }

    /// Native-side equivalent of the `pokeScheduler` call-out.
    pub fn poke_scheduler(&self) {
        self.inner.shared.poke_scheduler();
    }

    /// Attach a new client. Returns the session id the script will use to
    /// address it from now on.
    pub fn create_session(&self, handle: HostHandle) -> Result<u32> {
        self.ensure_running()?;
        let session = self.inner.shared.registry.insert(handle);
        let id = session.id();
        log::debug!("Creating new session {id}");
        if let Err(e) = self.inner.engine.call_in::<_, ()>("createSession", id) {
            // The script never learned about this session; take it back out.
            self.inner.shared.registry.remove(session.handle());
            return Err(e.context("Script createSession() failed"));
        }
        Ok(id)
    }

    /// Detach a client. The session object survives until every recipient
    /// relation and in-flight worker referencing it lets go.
    pub fn destroy_session(&self, handle: &HostHandle) -> Result<()> {
        self.ensure_running()?;
        let session = self
            .inner
            .shared
            .registry
            .remove(handle)
            .ok_or_else(|| anyhow!("No session associated with this handle"))?;
        log::debug!("Removing session {}", session.id());
        self.inner
            .engine
            .call_in::<_, ()>("destroySession", session.id())
            .context("Script destroySession() failed")?;
        Ok(())
    }

    /// Ask the script to describe a session (admin/introspection path).
    pub fn query_session(&self, handle: &HostHandle) -> Result<Value> {
        self.ensure_running()?;
        let session = self
            .inner
            .shared
            .registry
            .by_handle(handle)
            .ok_or_else(|| anyhow!("No session associated with this handle"))?;
        let info: String = self.inner.engine.call_in("querySession", session.id())?;
        serde_json::from_str(&info)
            .map_err(|e| anyhow!("querySession returned invalid JSON: {e}"))
    }

    /// Hand a signaling message to the script and translate its verdict.
    pub fn handle_message(
        &self,
        handle: &HostHandle,
        transaction: Option<&str>,
        message: Option<&Value>,
        jsep: Option<&Value>,
    ) -> Result<MessageResult> {
        self.ensure_running()?;
        let session = self
            .inner
            .shared
            .registry
            .by_handle(handle)
            .ok_or_else(|| anyhow!("No session associated with this handle"))?;
        let message_text = message.map(serde_json::to_string).transpose()?;
        let jsep_text = jsep.map(serde_json::to_string).transpose()?;
        let (status, response): (i64, Option<String>) = self.inner.engine.call_in(
            "handleMessage",
            (session.id(), transaction, message_text, jsep_text),
        )?;
        if status < 0 {
            bail!(response.unwrap_or_else(|| "Script error".to_owned()));
        }
        if status == 0 {
            let text = response.ok_or_else(|| anyhow!("Missing synchronous response"))?;
            let json = serde_json::from_str(&text)
                .map_err(|e| anyhow!("handleMessage returned invalid JSON: {e}"))?;
            return Ok(MessageResult::Success(json));
        }
        Ok(MessageResult::Pending)
    }

    /// The client's media transport just came up.
    pub fn setup_media(&self, handle: &HostHandle) -> Result<()> {
        self.ensure_running()?;
        let session = self
            .inner
            .shared
            .registry
            .by_handle(handle)
            .ok_or_else(|| anyhow!("No session associated with this handle"))?;
        log::info!("Media is now available for session {}", session.id());
        session.clear_hangup();
        session.set_started(true);
        session.mark_pli_sent(Instant::now());
        self.inner
            .engine
            .call_in::<_, ()>("setupMedia", session.id())
            .context("Script setupMedia() failed")?;
        Ok(())
    }

    /// The client's media transport went down. Idempotent: repeated hangups
    /// for the same transport are ignored until media is set up again.
    pub fn hangup_media(&self, handle: &HostHandle) -> Result<()> {
        self.ensure_running()?;
        let session = self
            .inner
            .shared
            .registry
            .by_handle(handle)
            .ok_or_else(|| anyhow!("No session associated with this handle"))?;
        if !session.begin_hangup() {
            return Ok(());
        }
        log::info!("No media available anymore for session {}", session.id());
        session.set_started(false);
        session.reset_media();
        session.clear_recipients();
        self.inner
            .engine
            .call_in::<_, ()>("hangupMedia", session.id())
            .context("Script hangupMedia() failed")?;
        Ok(())
    }

    /// RTP from the client: record, fan out, pace keyframe requests.
    /// Best-effort, silent on failure.
    pub fn incoming_rtp(&self, handle: &HostHandle, video: bool, buf: &[u8]) {
        if !self.running() {
            return;
        }
        let Some(session) = self.inner.shared.registry.by_handle(handle) else {
            log::error!("No session associated with this handle");
            return;
        };
        if session.is_hanging_up() {
            return;
        }
        if self.inner.has_incoming_rtp {
            if let Err(e) =
                self.inner
                    .engine
                    .call_in_packet("incomingRtp", session.id(), Some(video), buf)
            {
                log::warn!("incomingRtp call-in failed: {e}");
            }
            return;
        }
        let medium = if video { Medium::Video } else { Medium::Audio };
        if !session.sends(medium) {
            return;
        }
        session.record_frame(medium, buf);
        relay::fan_out_rtp(self.inner.shared.host.as_ref(), &session, video, buf);
        // Ask the source for a keyframe every pli_freq seconds at most.
        if video && session.pli_due(Instant::now()) {
            log::trace!("Sending PLI to session {}", session.id());
            self.inner
                .shared
                .host
                .relay_rtcp(session.handle(), true, &rtcp::pli());
        }
    }

    /// RTCP from the client: delegate to script or cap REMB feedback to the
    /// configured bitrate.
    pub fn incoming_rtcp(&self, handle: &HostHandle, video: bool, buf: &[u8]) {
        if !self.running() {
            return;
        }
        let Some(session) = self.inner.shared.registry.by_handle(handle) else {
            log::error!("No session associated with this handle");
            return;
        };
        if session.is_hanging_up() {
            return;
        }
        if self.inner.has_incoming_rtcp {
            if let Err(e) =
                self.inner
                    .engine
                    .call_in_packet("incomingRtcp", session.id(), Some(video), buf)
            {
                log::warn!("incomingRtcp call-in failed: {e}");
            }
            return;
        }
        let remb = rtcp::get_remb(buf);
        if remb > 0 {
            let cap = session.bitrate();
            if cap > 0 {
                self.inner
                    .shared
                    .host
                    .relay_rtcp(session.handle(), true, &rtcp::remb(cap));
            } else {
                self.inner.shared.host.relay_rtcp(session.handle(), true, buf);
            }
        }
    }

    /// Data-channel message from the client: delegate to script or record
    /// and fan out.
    pub fn incoming_data(&self, handle: &HostHandle, buf: &[u8]) {
        if !self.running() {
            return;
        }
        let Some(session) = self.inner.shared.registry.by_handle(handle) else {
            log::error!("No session associated with this handle");
            return;
        };
        if session.is_hanging_up() {
            return;
        }
        if self.inner.has_incoming_data {
            if let Err(e) =
                self.inner
                    .engine
                    .call_in_packet("incomingData", session.id(), None, buf)
            {
                log::warn!("incomingData call-in failed: {e}");
            }
            return;
        }
        if !session.sends(Medium::Data) {
            return;
        }
        session.record_frame(Medium::Data, buf);
        relay::fan_out_data(self.inner.shared.host.as_ref(), &session, buf);
    }

    /// Congestion hint from the host.
    pub fn slow_link(&self, handle: &HostHandle, uplink: bool, video: bool) {
        if !self.running() {
            return;
        }
        let Some(session) = self.inner.shared.registry.by_handle(handle) else {
            return;
        };
        if session.is_hanging_up() {
            return;
        }
        // TODO: let the script subscribe to slow-link feedback once a policy
        // call-in for it is specified.
        log::debug!(
            "Slow link on session {} (uplink={uplink}, video={video})",
            session.id()
        );
    }
}
