//! The script engine gateway.
//!
//! Every native thread that wants to run script code goes through
//! [`ScriptEngine::call_in`]: one global mutex serializes execution, and each
//! call-in gets a fresh `mlua::Thread` as its execution context so nested
//! calls (a call-out firing from inside a call-in) never share a stack top.
//!
//! The engine owns no policy: it looks up a global function by name, runs
//! it, and hands the declared results back.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua};

/// Mutex-guarded Lua state, the single entry point for script execution.
pub(crate) struct ScriptEngine {
    lua: Mutex<Lua>,
    /// Serialization invariant: asserts at most one thread is ever inside.
    busy: AtomicBool,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self {
            lua: Mutex::new(Lua::new()),
            busy: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lua> {
        self.lua.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the engine lock held. Used for init-time setup
    /// (registering call-outs, loading the script) and by tests.
    pub fn with_lua<R>(&self, f: impl FnOnce(&Lua) -> Result<R>) -> Result<R> {
        let lua = self.lock();
        f(&lua)
    }

    /// Add `folder` to the Lua `package.path` so the script can `require()`
    /// companion modules from there.
    pub fn append_package_path(&self, folder: &Path) -> Result<()> {
        self.with_lua(|lua| {
            let package: mlua::Table = lua
                .globals()
                .get("package")
                .map_err(|e| anyhow!("Failed to get package table: {e}"))?;
            let current: String = package
                .get("path")
                .map_err(|e| anyhow!("Failed to get package.path: {e}"))?;
            let new_path = format!("{current};{}/?.lua", folder.display());
            package
                .set("path", new_path)
                .map_err(|e| anyhow!("Failed to set package.path: {e}"))?;
            Ok(())
        })
    }

    /// Load and execute the script at `path`.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read Lua script: {}", path.display()))?;
        self.with_lua(|lua| {
            lua.load(&source)
                .set_name(path.to_string_lossy())
                .exec()
                .map_err(|e| anyhow!("Failed to execute Lua script {}: {e}", path.display()))
        })?;
        log::debug!("Loaded Lua script: {}", path.display());
        Ok(())
    }

    /// Check that every function in `names` exists as a global; the first
    /// missing one fails initialization.
    pub fn verify_functions(&self, names: &[&str]) -> Result<()> {
        self.with_lua(|lua| {
            for name in names {
                if lua.globals().get::<Function>(*name).is_err() {
                    return Err(anyhow!("Function '{name}' is missing in the Lua script"));
                }
            }
            Ok(())
        })
    }

    /// Whether the script defines a global function `name`.
    pub fn has_function(&self, name: &str) -> bool {
        self.lock().globals().get::<Function>(name).is_ok()
    }

    /// Serialized call into the script: acquire the engine lock, run the
    /// named global on a fresh coroutine, return its results.
    pub fn call_in<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        let lua = self.lock();
        let was_busy = self.busy.swap(true, Ordering::SeqCst);
        debug_assert!(!was_busy, "script engine entered concurrently");
        let result = Self::resume(&lua, name, args);
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    /// Like [`call_in`](Self::call_in), for media callbacks whose payload has
    /// to be materialized as a Lua string under the lock.
    pub fn call_in_packet(
        &self,
        name: &str,
        id: u32,
        video: Option<bool>,
        payload: &[u8],
    ) -> Result<()> {
        let lua = self.lock();
        let was_busy = self.busy.swap(true, Ordering::SeqCst);
        debug_assert!(!was_busy, "script engine entered concurrently");
        let result = (|| {
            let data = lua
                .create_string(payload)
                .map_err(|e| anyhow!("Failed to create Lua payload string: {e}"))?;
            match video {
                Some(video) => Self::resume(&lua, name, (id, video, data, payload.len())),
                None => Self::resume(&lua, name, (id, data, payload.len())),
            }
        })();
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    fn resume<A, R>(lua: &Lua, name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        let func: Function = lua
            .globals()
            .get(name)
            .map_err(|e| anyhow!("Lua function not found '{name}': {e}"))?;
        // Fresh execution context for this call-in.
        let thread = lua
            .create_thread(func)
            .map_err(|e| anyhow!("Failed to create Lua thread for '{name}': {e}"))?;
        thread
            .resume::<R>(args)
            .map_err(|e| anyhow!("Lua function '{name}' failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn call_in_runs_global_and_returns_results() {
        let engine = ScriptEngine::new();
        engine
            .with_lua(|lua| {
                lua.load("function add(a, b) return a + b, 'ok' end")
                    .exec()
                    .map_err(|e| anyhow!("{e}"))
            })
            .expect("load");
        let (sum, tag): (i64, String) = engine.call_in("add", (2, 3)).expect("call");
        assert_eq!(sum, 5);
        assert_eq!(tag, "ok");
    }

    #[test]
    fn missing_function_is_an_error_not_a_panic() {
        let engine = ScriptEngine::new();
        let result: Result<()> = engine.call_in("nope", ());
        assert!(result.is_err());
        assert!(engine.verify_functions(&["nope"]).is_err());
        assert!(!engine.has_function("nope"));
    }

    #[test]
    fn script_errors_surface_as_errors() {
        let engine = ScriptEngine::new();
        engine
            .with_lua(|lua| {
                lua.load("function boom() error('bad') end")
                    .exec()
                    .map_err(|e| anyhow!("{e}"))
            })
            .expect("load");
        let result: Result<()> = engine.call_in("boom", ());
        assert!(result.is_err());
    }

    #[test]
    fn call_ins_are_serialized_across_threads() {
        let engine = Arc::new(ScriptEngine::new());
        engine
            .with_lua(|lua| {
                lua.load(
                    r#"
                    overlap = false
                    inside = false
                    function spin()
                        if inside then overlap = true end
                        inside = true
                        local deadline = os.clock() + 0.005
                        while os.clock() < deadline do end
                        inside = false
                    end
                    "#,
                )
                .exec()
                .map_err(|e| anyhow!("{e}"))
            })
            .expect("load");

        let mut threads = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            threads.push(thread::spawn(move || {
                for _ in 0..5 {
                    engine.call_in::<_, ()>("spin", ()).expect("spin");
                }
            }));
        }
        for t in threads {
            t.join().expect("caller thread");
        }
        let overlap = engine
            .with_lua(|lua| {
                lua.globals()
                    .get::<bool>("overlap")
                    .map_err(|e| anyhow!("{e}"))
            })
            .expect("read overlap");
        assert!(!overlap, "two threads were inside the engine at once");
    }
}
