//! Engine setup and module instantiation.

use std::iter;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use wasmtime::{Caller, Config, Engine, FuncType, Linker, Store, StoreLimitsBuilder, Strategy, Val, ValType};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::config::{ModuleConfig, RuntimeConfig, WasiConfig, Wasm};
use crate::error::{BridgeError, Result};
use crate::host_function::HostFunction;
use crate::instance::GuestInstance;
use crate::logging;
use crate::module::{CallerInstance, Module, StoreState};

/// Reactor modules export this to run their static constructors.
const INITIALIZE_EXPORT: &str = "_initialize";

/// Owns the wasmtime engine; modules created from one runtime share its
/// compiled-code settings.
pub struct Runtime {
    engine: Engine,
    config: RuntimeConfig,
}

impl Runtime {
    /// Builds the engine. No tracing subscriber is installed; call
    /// [`Runtime::init_logging`] or bring your own.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.debug_info(config.debug_info);
        wasm_config.strategy(Strategy::Cranelift);
        let engine = Engine::new(&wasm_config).map_err(BridgeError::engine)?;

        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Installs the stderr subscriber at the configured severity. Returns
    /// `false` when a global subscriber is already set.
    pub fn init_logging(&self) -> bool {
        logging::init(self.config.log_severity)
    }

    /// Verifies, links and instantiates a guest binary.
    ///
    /// Host functions are registered under `config.namespace` next to the
    /// WASI preview1 imports.
    pub fn new_module(&self, config: ModuleConfig) -> Result<Module> {
        let ModuleConfig {
            namespace,
            wasm,
            host_functions,
            wasi,
        } = config;

        verify_hash(&wasm)?;

        let mut linker: Linker<StoreState> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |state| &mut state.wasi)
            .map_err(BridgeError::engine)?;
        for function in &host_functions {
            self.link_host_function(&mut linker, &namespace, Arc::clone(function))?;
        }

        let module = wasmtime::Module::new(&self.engine, &wasm.binary).map_err(|err| {
            error!(module = %namespace, %err, "can't compile module");
            BridgeError::engine(err)
        })?;

        let state = StoreState {
            namespace: namespace.clone(),
            wasi: build_wasi(&wasi)?,
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory_bytes())
                .build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(BridgeError::engine)?;

        let mut module = Module::new(store, instance, host_functions);
        if module.export_arity(INITIALIZE_EXPORT) == Some(0) {
            module.call(INITIALIZE_EXPORT, &[])?;
        }

        info!(module = %namespace, "module instantiated");
        Ok(module)
    }

    fn link_host_function(
        &self,
        linker: &mut Linker<StoreState>,
        namespace: &str,
        function: Arc<HostFunction>,
    ) -> Result<()> {
        function.check_signature()?;
        let ty = FuncType::new(
            &self.engine,
            iter::repeat(ValType::I64).take(function.params().len()),
            [ValType::I64],
        );
        let name = function.name().to_string();

        linker
            .func_new(
                namespace,
                &name,
                ty,
                move |mut caller: Caller<'_, StoreState>, params: &[Val], results: &mut [Val]| {
                    let stack: Vec<u64> = params
                        .iter()
                        .map(|v| v.i64().unwrap_or_default() as u64)
                        .collect();

                    let mut instance = CallerInstance::new(&mut caller);
                    let word = match function.invoke(&mut instance, &stack) {
                        Ok(word) => word,
                        Err(err) if !err.is_fatal() => {
                            warn!(
                                module = instance.module_name(),
                                function = function.name(),
                                %err,
                                "host function failed, returning 0"
                            );
                            0
                        }
                        Err(err) => {
                            error!(
                                module = instance.module_name(),
                                function = function.name(),
                                %err,
                                "host function aborted"
                            );
                            return Err(err.into());
                        }
                    };
                    results[0] = Val::I64(word as i64);
                    Ok(())
                },
            )
            .map_err(BridgeError::engine)?;
        Ok(())
    }
}

fn verify_hash(wasm: &Wasm) -> Result<()> {
    let Some(expected) = &wasm.hash else {
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(&wasm.binary));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(BridgeError::HashMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

fn build_wasi(config: &WasiConfig) -> Result<WasiP1Ctx> {
    let mut builder = WasiCtxBuilder::new();
    if config.inherit_stdio {
        builder.inherit_stdio();
    }
    if let Some(fs) = &config.preopen {
        builder
            .preopened_dir(&fs.host_dir, fs.guest_dir(), DirPerms::all(), FilePerms::all())
            .map_err(|err| BridgeError::Config(format!("{}: {err}", fs.host_dir.display())))?;
    }
    Ok(builder.build_p1())
}
