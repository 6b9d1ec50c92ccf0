//! The coroutine scheduler thread.
//!
//! Lua coroutines are cooperative and single-threaded; nothing native can
//! resume them directly. Instead, anyone (script code via `pokeScheduler`,
//! or native code) pushes a wake-up token onto a blocking queue, and one
//! dedicated thread consumes tokens and performs the `resumeScheduler`
//! call-in through the gateway. Tokens carry no payload and may coalesce:
//! the script must treat a resume as "look for pending coroutines", not as
//! "exactly one thing happened".

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bridge::Shared;
use crate::script::engine::ScriptEngine;

/// Token consumed by the scheduler thread.
pub(crate) enum SchedulerEvent {
    /// Resume one or more pending coroutines.
    Resume,
    /// Break the scheduler loop; nothing runs after this is observed.
    Exit,
}

/// Spawn the dedicated scheduler thread.
pub(crate) fn spawn(
    engine: Arc<ScriptEngine>,
    shared: Arc<Shared>,
    rx: Receiver<SchedulerEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("lua-scheduler".to_owned())
        .spawn(move || {
            log::debug!("Scheduler thread started");
            while let Ok(event) = rx.recv() {
                match event {
                    SchedulerEvent::Exit => break,
                    SchedulerEvent::Resume => {
                        if shared.is_stopping() {
                            continue;
                        }
                        if let Err(e) = engine.call_in::<_, ()>("resumeScheduler", ()) {
                            log::warn!("resumeScheduler call-in failed: {e}");
                        }
                    }
                }
            }
            log::debug!("Scheduler thread ending");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Shared;
    use crate::host::{Host, HostHandle, Recorder};
    use anyhow::{anyhow, Result};
    use serde_json::Value;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct NullHost;

    impl Host for NullHost {
        fn push_event(
            &self,
            _: &HostHandle,
            _: Option<&str>,
            _: &Value,
            _: Option<&Value>,
        ) -> Result<()> {
            Ok(())
        }
        fn notify_event(&self, _: Option<&HostHandle>, _: &Value) {}
        fn close_pc(&self, _: &HostHandle) {}
        fn relay_rtp(&self, _: &HostHandle, _: bool, _: &[u8]) {}
        fn relay_rtcp(&self, _: &HostHandle, _: bool, _: &[u8]) {}
        fn relay_data(&self, _: &HostHandle, _: &[u8]) {}
        fn create_recorder(&self, _: &str, _: &str, _: &str) -> Result<Box<dyn Recorder>> {
            Err(anyhow!("no recorders in this test"))
        }
    }

    fn counting_engine() -> Arc<ScriptEngine> {
        let engine = Arc::new(ScriptEngine::new());
        engine
            .with_lua(|lua| {
                lua.load("resumes = 0\nfunction resumeScheduler() resumes = resumes + 1 end")
                    .exec()
                    .map_err(|e| anyhow!("{e}"))
            })
            .expect("load");
        engine
    }

    fn resumes(engine: &ScriptEngine) -> i64 {
        engine
            .with_lua(|lua| lua.globals().get::<i64>("resumes").map_err(|e| anyhow!("{e}")))
            .expect("read resumes")
    }

    #[test]
    fn resume_token_drives_the_resume_call_in() {
        let engine = counting_engine();
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::new(Arc::new(NullHost), tx.clone()));
        let handle = spawn(Arc::clone(&engine), shared, rx).expect("spawn scheduler");

        tx.send(SchedulerEvent::Resume).expect("send resume");
        tx.send(SchedulerEvent::Resume).expect("send resume");
        let deadline = Instant::now() + Duration::from_secs(5);
        while resumes(&engine) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(resumes(&engine), 2);

        tx.send(SchedulerEvent::Exit).expect("send exit");
        handle.join().expect("scheduler join");
    }

    #[test]
    fn nothing_runs_after_the_exit_token_is_observed() {
        let engine = counting_engine();
        let (tx, rx) = mpsc::channel();
        // Queue the exit before any resume and before the thread starts:
        // the exit is observed first and later tokens must never run.
        tx.send(SchedulerEvent::Exit).expect("send exit");
        tx.send(SchedulerEvent::Resume).expect("send resume");
        let shared = Arc::new(Shared::new(Arc::new(NullHost), tx));
        let handle = spawn(Arc::clone(&engine), shared, rx).expect("spawn scheduler");
        handle.join().expect("scheduler join");
        assert_eq!(resumes(&engine), 0);
    }
}
