use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::task;
use tracing::{debug, warn};
use wasmtime::component::ResourceTable;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};
use wasmtime_wasi::preview2::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview2::preview1::{self, WasiPreview1Adapter, WasiPreview1View};
use wasmtime_wasi::preview2::{I32Exit, WasiCtx, WasiCtxBuilder, WasiView};

use crate::cache::{module_hash, ModuleCache, ModuleHandle};
use crate::errors::{SandboxError, SandboxResult};
use crate::guard::ModuleGuard;
use crate::limits::SandboxLimits;

/// What a guest program left behind after running to completion.
#[derive(Debug, Clone)]
pub struct ProgramOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub fuel_consumed: u64,
    pub elapsed: Duration,
}

impl ProgramOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Shared wasmtime engine plus the compiled-module cache.
///
/// Compilation happens once per content hash. Every invocation gets a brand
/// new `Store` with its own WASI context, memory and pipes, so nothing a
/// guest does can be observed by the next call.
#[derive(Clone)]
pub struct SandboxHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    engine: Engine,
    linker: Linker<SandboxContext>,
    cache: ModuleCache,
    guard: ModuleGuard,
    limits: SandboxLimits,
    _ticker: EpochTicker,
}

impl SandboxHost {
    pub fn new(limits: SandboxLimits) -> SandboxResult<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|err| SandboxError::Engine(err.to_string()))?;

        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker)
            .map_err(|err| SandboxError::Engine(err.to_string()))?;

        let ticker = EpochTicker::spawn(engine.clone(), limits.tick())?;
        let guard = ModuleGuard::new(limits.concurrency);

        Ok(Self {
            inner: Arc::new(HostInner {
                engine,
                linker,
                cache: ModuleCache::new(),
                guard,
                limits,
                _ticker: ticker,
            }),
        })
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.inner.limits
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.inner.cache
    }

    pub fn module(&self, hash: &str) -> Option<ModuleHandle> {
        self.inner.cache.get(hash)
    }

    /// Compiles `bytes` (binary or text format) and caches the result under
    /// its content hash. Already-cached bytes are not recompiled.
    pub fn compile(&self, bytes: &[u8]) -> SandboxResult<ModuleHandle> {
        let hash = module_hash(bytes);
        if let Some(existing) = self.inner.cache.get(&hash) {
            return Ok(existing);
        }
        let started = Instant::now();
        let module = Module::new(&self.inner.engine, bytes)
            .map_err(|err| SandboxError::Compile(err.to_string()))?;
        debug!(
            module = %hash,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled guest module"
        );
        Ok(self.inner.cache.insert(ModuleHandle::new(&hash, module)))
    }

    /// Runs the module's `_start` export with `argv` in a fresh store.
    pub async fn run_program(
        &self,
        handle: &ModuleHandle,
        argv: Vec<String>,
    ) -> SandboxResult<ProgramOutput> {
        let _permit = self
            .inner
            .guard
            .acquire(handle.hash(), self.inner.limits.wall_budget())
            .await?;

        let inner = self.inner.clone();
        let handle = handle.clone();
        task::spawn_blocking(move || {
            run_blocking(&inner.engine, &inner.linker, &handle, argv, &inner.limits)
        })
        .await
        .map_err(|err| SandboxError::Join(err.to_string()))?
    }
}

fn run_blocking(
    engine: &Engine,
    linker: &Linker<SandboxContext>,
    handle: &ModuleHandle,
    argv: Vec<String>,
    limits: &SandboxLimits,
) -> SandboxResult<ProgramOutput> {
    let program = argv.first().cloned().unwrap_or_else(|| handle.hash().to_string());

    let stdout = MemoryOutputPipe::new(limits.stdout_bytes);
    let stderr = MemoryOutputPipe::new(limits.stderr_bytes);

    let mut builder = WasiCtxBuilder::new();
    builder.args(argv.as_slice());
    builder.stdout(stdout.clone());
    builder.stderr(stderr.clone());
    let wasi = builder.build();

    let store_limits = StoreLimitsBuilder::new()
        .memory_size(limits.memory_bytes())
        .instances(1)
        .build();

    let mut store = Store::new(
        engine,
        SandboxContext {
            table: ResourceTable::new(),
            wasi,
            adapter: WasiPreview1Adapter::new(),
            limits: store_limits,
        },
    );
    store.limiter(|ctx| &mut ctx.limits);
    store
        .set_fuel(limits.fuel)
        .map_err(|err| SandboxError::Engine(err.to_string()))?;
    store.set_epoch_deadline(limits.epoch_ticks());

    let started = Instant::now();
    let outcome = linker
        .instantiate(&mut store, handle.module())
        .map_err(|err| SandboxError::Crashed {
            program: program.clone(),
            reason: format!("instantiation failed: {err}"),
        })
        .and_then(|instance| {
            instance
                .get_typed_func::<(), ()>(&mut store, "_start")
                .map_err(|err| SandboxError::Crashed {
                    program: program.clone(),
                    reason: format!("missing _start export: {err}"),
                })
        })
        .and_then(|start| {
            start
                .call(&mut store, ())
                .or_else(|err| classify_exit(err, &program, limits))
        });
    let elapsed = started.elapsed();

    let remaining = store.get_fuel().unwrap_or(0);
    let output = ProgramOutput {
        stdout: stdout.contents().to_vec(),
        stderr: stderr.contents().to_vec(),
        fuel_consumed: limits.fuel.saturating_sub(remaining),
        elapsed,
    };

    if !output.stderr.is_empty() {
        let excerpt: String = output.stderr_lossy().chars().take(512).collect();
        debug!(program = %program, stderr = %excerpt, "guest stderr");
    }

    match outcome {
        Ok(()) => Ok(output),
        Err(err) => {
            warn!(
                program = %program,
                module = %handle.hash(),
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "guest program failed"
            );
            Err(err)
        }
    }
}

/// A clean `proc_exit(0)` counts as success; every other exit status and
/// every trap is a fault.
fn classify_exit(err: wasmtime::Error, program: &str, limits: &SandboxLimits) -> SandboxResult<()> {
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        if exit.0 == 0 {
            return Ok(());
        }
        return Err(SandboxError::Crashed {
            program: program.to_string(),
            reason: format!("exited with status {}", exit.0),
        });
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Err(SandboxError::OutOfFuel {
            program: program.to_string(),
            limit: limits.fuel,
        }),
        Some(Trap::Interrupt) => Err(SandboxError::Timeout {
            program: program.to_string(),
            wall_ms: limits.wall_ms,
        }),
        _ => Err(SandboxError::Crashed {
            program: program.to_string(),
            reason: format!("{err:#}"),
        }),
    }
}

struct SandboxContext {
    table: ResourceTable,
    wasi: WasiCtx,
    adapter: WasiPreview1Adapter,
    limits: StoreLimits,
}

impl WasiView for SandboxContext {
    fn table(&self) -> &ResourceTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut ResourceTable {
        &mut self.table
    }

    fn ctx(&self) -> &WasiCtx {
        &self.wasi
    }

    fn ctx_mut(&mut self) -> &mut WasiCtx {
        &mut self.wasi
    }
}

impl WasiPreview1View for SandboxContext {
    fn adapter(&self) -> &WasiPreview1Adapter {
        &self.adapter
    }

    fn adapter_mut(&mut self) -> &mut WasiPreview1Adapter {
        &mut self.adapter
    }
}

/// Background thread advancing the engine epoch so that store deadlines
/// expire in wall-clock time.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, tick: Duration) -> SandboxResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("histguard-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    engine.increment_epoch();
                }
            })
            .map_err(|err| SandboxError::Engine(format!("failed to spawn epoch ticker: {err}")))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
