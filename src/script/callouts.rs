//! Native functions exposed to the Lua script.
//!
//! These are the only ways script code can act on the outside world. Each
//! one validates its argument count and types, resolves session ids through
//! the registry, and returns a numeric status: 0 on success, negative on
//! error. Malformed arguments or payloads are error returns, never panics.
//!
//! All of them run while the calling thread holds the engine lock, so they
//! must not call back into the engine — and the two that make the host
//! re-enter the bridge synchronously (`closePc`, `pushEvent` with a jsep)
//! hand the host call to a deferred-execution worker instead.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use mlua::{Lua, Value, Variadic};

use crate::bridge::Shared;
use crate::recording::{self, RecordingSpec};
use crate::rtcp;
use crate::session::{Direction, Medium};

use super::deferred::{self, DeferredAction};

/// Status returned to Lua for any validation or lookup failure.
const ERR: i32 = -1;
/// Status returned when the host rejected a synchronous call.
const ERR_HOST: i32 = -2;
const OK: i32 = 0;

fn id_arg(args: &[Value], i: usize) -> Option<u32> {
    match args.get(i)? {
        Value::Integer(n) => u32::try_from(*n).ok(),
        Value::Number(f) if *f >= 0.0 && *f <= f64::from(u32::MAX) => Some(*f as u32),
        _ => None,
    }
}

fn usize_arg(args: &[Value], i: usize) -> Option<usize> {
    match args.get(i)? {
        Value::Integer(n) => usize::try_from(*n).ok(),
        Value::Number(f) if *f >= 0.0 => Some(*f as usize),
        _ => None,
    }
}

fn str_arg(args: &[Value], i: usize) -> Option<String> {
    match args.get(i)? {
        Value::String(s) => Some(String::from_utf8_lossy(&s.as_bytes()).into_owned()),
        _ => None,
    }
}

fn bytes_arg(args: &[Value], i: usize) -> Option<Vec<u8>> {
    match args.get(i)? {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Lua truthiness: nil and false are false, everything else is true.
fn bool_arg(args: &[Value], i: usize) -> bool {
    !matches!(args.get(i), None | Some(Value::Nil) | Some(Value::Boolean(false)))
}

fn parse_json(text: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("JSON error: {e}");
            None
        }
    }
}

macro_rules! check_argc {
    ($args:expr, $expected:expr) => {
        if $args.len() != $expected {
            log::error!(
                "Wrong number of arguments: {} (expected {})",
                $args.len(),
                $expected
            );
            return Ok(ERR);
        }
    };
}

/// Register every call-out as a Lua global. Called once at init, with the
/// engine lock held.
pub(crate) fn register(lua: &Lua, shared: &Arc<Shared>) -> Result<()> {
    let globals = lua.globals();

    let s = Arc::clone(shared);
    set(lua, &globals, "pokeScheduler", move |_, _args: Variadic<Value>| {
        s.poke_scheduler();
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "pushEvent", move |_, args: Variadic<Value>| {
        check_argc!(args, 4);
        let Some(id) = id_arg(&args, 0) else { return Ok(ERR) };
        let transaction = str_arg(&args, 1);
        let Some(event) = str_arg(&args, 2).as_deref().and_then(parse_json) else {
            return Ok(ERR);
        };
        let jsep = match args.get(3) {
            Some(Value::Nil) | None => None,
            _ => match str_arg(&args, 3).as_deref().and_then(parse_json) {
                Some(jsep) => Some(jsep),
                None => return Ok(ERR),
            },
        };
        let Some(session) = s.registry.by_id(id) else { return Ok(ERR) };
        if let Some(jsep) = jsep {
            // A negotiation payload makes the host re-enter the bridge on
            // this thread: hand the event to a worker outside the lock.
            let action = DeferredAction::PushEvent { transaction, event, jsep: Some(jsep) };
            return match deferred::launch(Arc::clone(&s.host), session, action) {
                Ok(()) => Ok(OK),
                Err(e) => {
                    log::error!("Failed to launch the pushEvent worker: {e}");
                    Ok(ERR)
                }
            };
        }
        match s.host.push_event(session.handle(), transaction.as_deref(), &event, None) {
            Ok(()) => Ok(OK),
            Err(e) => {
                log::error!("pushEvent for session {id} failed: {e}");
                Ok(ERR_HOST)
            }
        }
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "notifyEvent", move |_, args: Variadic<Value>| {
        check_argc!(args, 2);
        let Some(event) = str_arg(&args, 1).as_deref().and_then(parse_json) else {
            return Ok(ERR);
        };
        // The session is optional here: id 0 or an unknown id still notifies,
        // just without a session attached.
        let session = id_arg(&args, 0).and_then(|id| s.registry.by_id(id));
        s.host.notify_event(session.as_ref().map(|sess| sess.handle()), &event);
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "closePc", move |_, args: Variadic<Value>| {
        check_argc!(args, 1);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        // close_pc triggers hangup_media synchronously on the calling
        // thread, and hangup_media needs the engine lock we are holding:
        // always defer.
        match deferred::launch(Arc::clone(&s.host), session, DeferredAction::ClosePc) {
            Ok(()) => Ok(OK),
            Err(e) => {
                log::error!("Failed to launch the closePc worker: {e}");
                Ok(ERR)
            }
        }
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "configureMedium", move |_, args: Variadic<Value>| {
        check_argc!(args, 4);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let medium = str_arg(&args, 1).as_deref().and_then(Medium::parse);
        let direction = str_arg(&args, 2).as_deref().and_then(Direction::parse);
        let (Some(medium), Some(direction)) = (medium, direction) else {
            log::error!("configureMedium: unknown medium or direction");
            return Ok(ERR);
        };
        session.configure_medium(medium, direction, bool_arg(&args, 3));
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "addRecipient", move |_, args: Variadic<Value>| {
        check_argc!(args, 2);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let Some(recipient) = id_arg(&args, 1).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        session.add_recipient(&recipient);
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "removeRecipient", move |_, args: Variadic<Value>| {
        check_argc!(args, 2);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let Some(rid) = id_arg(&args, 1) else { return Ok(ERR) };
        session.remove_recipient(rid);
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "setBitrate", move |_, args: Variadic<Value>| {
        check_argc!(args, 2);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let Some(bitrate) = id_arg(&args, 1) else { return Ok(ERR) };
        session.set_bitrate(bitrate);
        // Enforce the cap right away if media is already flowing.
        if bitrate > 0 && session.started() {
            s.host.relay_rtcp(session.handle(), true, &rtcp::remb(bitrate));
        }
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "setPliFreq", move |_, args: Variadic<Value>| {
        check_argc!(args, 2);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let Some(seconds) = id_arg(&args, 1) else { return Ok(ERR) };
        session.set_pli_freq(u64::from(seconds));
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "sendPli", move |_, args: Variadic<Value>| {
        check_argc!(args, 1);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        session.mark_pli_sent(Instant::now());
        log::trace!("Sending PLI to session {}", session.id());
        s.host.relay_rtcp(session.handle(), true, &rtcp::pli());
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "relayRtp", move |_, args: Variadic<Value>| {
        check_argc!(args, 4);
        relay_packet(&s, &args, PacketKind::Rtp)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "relayRtcp", move |_, args: Variadic<Value>| {
        check_argc!(args, 4);
        relay_packet(&s, &args, PacketKind::Rtcp)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "relayData", move |_, args: Variadic<Value>| {
        check_argc!(args, 3);
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let payload = bytes_arg(&args, 1);
        let len = usize_arg(&args, 2);
        let (Some(payload), Some(len)) = (payload, len) else { return Ok(ERR) };
        if len == 0 || len > payload.len() {
            log::error!("Invalid data");
            return Ok(ERR);
        }
        s.host.relay_data(session.handle(), &payload[..len]);
        Ok(OK)
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "startRecording", move |_, args: Variadic<Value>| {
        if !matches!(args.len(), 5 | 9 | 13) {
            log::error!(
                "Wrong number of arguments: {} (expected 5, 9 or 13)",
                args.len()
            );
            return Ok(ERR);
        }
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let mut specs = Vec::new();
        for chunk in args[1..].chunks_exact(4) {
            let medium = match chunk.first() {
                Some(Value::String(m)) => Medium::parse(&String::from_utf8_lossy(&m.as_bytes())),
                _ => None,
            };
            let codec = lua_string(chunk.get(1));
            let folder = lua_string(chunk.get(2));
            let filename = lua_string(chunk.get(3));
            let (Some(medium), Some(codec), Some(folder), Some(filename)) =
                (medium, codec, folder, filename)
            else {
                log::error!("startRecording: invalid recording spec");
                return Ok(ERR);
            };
            specs.push(RecordingSpec { medium, codec, folder, filename });
        }
        match recording::start(s.host.as_ref(), &session, &specs) {
            Ok(()) => Ok(OK),
            Err(e) => {
                log::error!("startRecording for session {} failed: {e}", session.id());
                Ok(ERR)
            }
        }
    })?;

    let s = Arc::clone(shared);
    set(lua, &globals, "stopRecording", move |_, args: Variadic<Value>| {
        if !matches!(args.len(), 2..=4) {
            log::error!(
                "Wrong number of arguments: {} (expected 2, 3 or 4)",
                args.len()
            );
            return Ok(ERR);
        }
        let Some(session) = id_arg(&args, 0).and_then(|id| s.registry.by_id(id)) else {
            return Ok(ERR);
        };
        let mut media = Vec::new();
        for i in 1..args.len() {
            let Some(medium) = str_arg(&args, i).as_deref().and_then(Medium::parse) else {
                log::error!("stopRecording: unknown medium");
                return Ok(ERR);
            };
            media.push(medium);
        }
        recording::stop(&session, &media);
        Ok(OK)
    })?;

    Ok(())
}

enum PacketKind {
    Rtp,
    Rtcp,
}

/// Shared body of `relayRtp` / `relayRtcp`: (id, is_video, payload, len).
fn relay_packet(shared: &Shared, args: &[Value], kind: PacketKind) -> mlua::Result<i32> {
    let Some(session) = id_arg(args, 0).and_then(|id| shared.registry.by_id(id)) else {
        return Ok(ERR);
    };
    let video = bool_arg(args, 1);
    let payload = bytes_arg(args, 2);
    let len = usize_arg(args, 3);
    let (Some(payload), Some(len)) = (payload, len) else { return Ok(ERR) };
    if len == 0 || len > payload.len() {
        log::error!("Invalid payload");
        return Ok(ERR);
    }
    match kind {
        PacketKind::Rtp => shared.host.relay_rtp(session.handle(), video, &payload[..len]),
        PacketKind::Rtcp => shared.host.relay_rtcp(session.handle(), video, &payload[..len]),
    }
    Ok(OK)
}

fn lua_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(String::from_utf8_lossy(&s.as_bytes()).into_owned()),
        _ => None,
    }
}

fn set<F>(lua: &Lua, globals: &mlua::Table, name: &str, f: F) -> Result<()>
where
    F: Fn(&Lua, Variadic<Value>) -> mlua::Result<i32> + Send + 'static,
{
    let func = lua
        .create_function(f)
        .map_err(|e| anyhow!("Failed to create {name}: {e}"))?;
    globals
        .set(name, func)
        .map_err(|e| anyhow!("Failed to register {name}: {e}"))?;
    Ok(())
}
