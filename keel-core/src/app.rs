//! Application composition: modules, flags, config, and the run loop.
//!
//! `App::new()` creates an empty app. Modules and provider closures queue
//! registrations; [`App::build`] runs the fixed sequence (module flag
//! contributions, flag parsing, config load, logger init, provider
//! registration, required-config enforcement, eager instantiation), joining
//! independent failures into one error. [`App::run`] starts the layered
//! lifecycles, blocks on interrupt signals, and stops everything in reverse.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigValue, FlagSet, ProviderValues};
use crate::container::{service_key, Container};
use crate::error::CoreError;
use crate::lifecycle::{self, compute_layers, StopSettings};
use crate::logging;
use crate::module::Module;
use crate::shutdown::{OsSignals, SignalSource};

/// Default per-hook stop deadline.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for the whole shutdown phase.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type PendingRegistration = Box<dyn FnOnce(&Container) -> Result<(), CoreError> + Send>;

/// The application runtime.
pub struct App {
    container: Container,
    modules: Vec<Box<dyn Module>>,
    module_names: Vec<&'static str>,
    pending: Vec<PendingRegistration>,
    flags: FlagSet,
    values: ProviderValues,
    argv: Option<Vec<String>>,
    config_path: Option<PathBuf>,
    env_prefix: Option<String>,
    hook_timeout: Duration,
    shutdown_timeout: Duration,
    stop_overrides: HashMap<String, Duration>,
    signals: Arc<dyn SignalSource>,
    exit: Arc<dyn Fn(i32) + Send + Sync>,
    cancel: CancellationToken,
    started_layers: Vec<Vec<String>>,
    built: bool,
    running: bool,
    stopped: bool,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let mut flags = FlagSet::new();
        flags.string_var("config", "", "path to a YAML config file");
        flags.string_var("log-level", "info", "log level (trace|debug|info|warn|error)");
        flags.string_var("log-format", "pretty", "log format (pretty|json)");

        Self {
            container: Container::new(),
            modules: Vec::new(),
            module_names: Vec::new(),
            pending: Vec::new(),
            flags,
            values: ProviderValues::empty(),
            argv: None,
            config_path: None,
            env_prefix: None,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            stop_overrides: HashMap::new(),
            signals: Arc::new(OsSignals),
            exit: Arc::new(|code| std::process::exit(code)),
            cancel: CancellationToken::new(),
            started_layers: Vec::new(),
            built: false,
            running: false,
            stopped: false,
        }
    }

    // ── Composition ────────────────────────────────────────────────────────

    /// Queue a module. Duplicate names fail the build.
    ///
    /// # Panics
    ///
    /// Panics when called after [`App::build`]; late installation is a
    /// programming error.
    pub fn install<M: Module>(&mut self, module: M) -> &mut Self {
        assert!(
            !self.built,
            "App::install called after build: module {:?} would never register",
            module.name()
        );
        self.modules.push(Box::new(module));
        self
    }

    /// Queue a direct registration closure, run during build after module
    /// registrations.
    pub fn provide<F>(&mut self, register: F) -> &mut Self
    where
        F: FnOnce(&Container) -> Result<(), CoreError> + Send + 'static,
    {
        assert!(!self.built, "App::provide called after build");
        self.pending.push(Box::new(register));
        self
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// The effective configuration view. Fully populated only after build.
    pub fn values(&self) -> &ProviderValues {
        &self.values
    }

    /// Names of the modules installed so far.
    pub fn module_names(&self) -> &[&'static str] {
        &self.module_names
    }

    // ── Settings ───────────────────────────────────────────────────────────

    /// Use this argv (without the binary name) instead of the process argv.
    pub fn with_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Config file to load when the `--config` flag is not given.
    pub fn with_config_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config_path = Some(path.into());
        self
    }

    /// Only environment variables with this prefix are mapped onto config
    /// keys (`PREFIX_A_B_C` -> `a.b.c`). Without a prefix, all are.
    pub fn with_env_prefix(&mut self, prefix: &str) -> &mut Self {
        self.env_prefix = Some(prefix.to_string());
        self
    }

    /// Per-hook stop deadline (default 10s).
    pub fn with_hook_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.hook_timeout = timeout;
        self
    }

    /// Deadline for the whole shutdown phase (default 30s).
    pub fn with_shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Override the stop deadline for one service.
    pub fn with_stop_timeout_for<T: 'static>(&mut self, timeout: Duration) -> &mut Self {
        self.stop_overrides
            .insert(service_key::<T>(None), timeout);
        self
    }

    /// Replace the interrupt source (tests inject `ManualSignals`).
    pub fn with_signal_source<S: SignalSource>(&mut self, source: S) -> &mut Self {
        self.signals = Arc::new(source);
        self
    }

    /// Replace the forced-exit hook invoked on a second interrupt.
    pub fn with_exit_handler<F: Fn(i32) + Send + Sync + 'static>(
        &mut self,
        handler: F,
    ) -> &mut Self {
        self.exit = Arc::new(handler);
        self
    }

    // ── Build ──────────────────────────────────────────────────────────────

    /// Run the build sequence. Idempotent after the first success.
    pub fn build(&mut self) -> Result<(), CoreError> {
        if self.built {
            return Ok(());
        }
        let mut errors: Vec<CoreError> = Vec::new();

        // 1. Drain the module queue: names first (duplicates fail), then flag
        //    contributions, so the parser sees every flag.
        let modules = std::mem::take(&mut self.modules);
        let mut seen: HashSet<&'static str> = self.module_names.iter().copied().collect();
        let mut accepted: Vec<Box<dyn Module>> = Vec::new();
        for module in modules {
            let name = module.name();
            if !seen.insert(name) {
                errors.push(CoreError::DuplicateModule {
                    name: name.to_string(),
                });
                continue;
            }
            module.flags(&mut self.flags);
            self.module_names.push(name);
            accepted.push(module);
        }
        for name in self.flags.duplicate_names() {
            errors.push(CoreError::Duplicate {
                key: format!("flag --{name}"),
            });
        }

        // 2. Parse the command line.
        let command = self
            .flags
            .attach(clap::Command::new("keel").no_binary_name(true));
        let argv = self
            .argv
            .clone()
            .unwrap_or_else(|| std::env::args().skip(1).collect());
        let explicit_flags = match command.try_get_matches_from(argv) {
            Ok(matches) => match self.flags.extract(&matches) {
                Ok(explicit) => explicit,
                Err(e) => {
                    errors.push(e);
                    HashMap::new()
                }
            },
            Err(e) => {
                errors.push(CoreError::NotSettable {
                    key: "command-line flags".to_string(),
                    reason: e.to_string(),
                });
                HashMap::new()
            }
        };

        // 3. Compose ProviderValues: defaults < file < env < explicit flags.
        self.values.overlay(self.flags.defaults());
        let config_path = match explicit_flags.get("config") {
            Some(ConfigValue::String(path)) if !path.is_empty() => Some(PathBuf::from(path)),
            _ => self.config_path.clone(),
        };
        if let Some(path) = config_path {
            if let Err(e) = self.values.overlay_file(&path) {
                errors.push(e);
            }
        }
        let _ = dotenvy::dotenv();
        self.values.overlay_env(self.env_prefix.as_deref());
        self.values.overlay(explicit_flags);

        // 4. Logger, now that the effective log level is known.
        logging::init(&self.values);

        // 5. The config view itself is resolvable before any provider runs.
        if !self.container.contains::<ProviderValues>() {
            if let Err(e) = self
                .container
                .register::<ProviderValues>()
                .instance(self.values.clone())
            {
                errors.push(e);
            }
        }

        // 6. Module registrations, then direct registrations.
        for module in &accepted {
            if let Err(e) = module.register(self) {
                errors.push(e);
            }
        }
        for register in std::mem::take(&mut self.pending) {
            if let Err(e) = register(&self.container) {
                errors.push(e);
            }
        }

        // 7. Provider config contracts: install defaults, enforce required.
        for (service, namespace, contract) in self.container.config_contracts() {
            for flag in contract {
                let key = format!("{namespace}.{}", flag.key);
                if let Some(default) = flag.default {
                    self.values.set_default(&key, default);
                }
                if flag.required && !self.values.contains(&key) {
                    errors.push(CoreError::MissingConfig {
                        provider: service.clone(),
                        key,
                    });
                }
            }
        }

        if !errors.is_empty() {
            return CoreError::join(errors);
        }

        // 8. Freeze and instantiate eager singletons.
        self.container.build()?;
        self.built = true;
        tracing::debug!(
            services = self.container.service_keys().len(),
            modules = self.module_names.len(),
            "application built"
        );
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Start every managed service in layered order.
    pub async fn start(&mut self) -> Result<(), CoreError> {
        self.build()?;
        if self.running {
            return Ok(());
        }

        let graph = self.container.dependency_graph();
        let layers: Vec<Vec<String>> = compute_layers(&graph)?
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .filter(|key| self.container.lifecycle_ready(key))
                    .collect::<Vec<_>>()
            })
            .filter(|layer: &Vec<String>| !layer.is_empty())
            .collect();

        self.cancel = CancellationToken::new();
        lifecycle::start_layers(&self.container, &layers, &self.cancel, &self.stop_settings())
            .await?;

        tracing::info!(layers = layers.len(), "application started");
        self.started_layers = layers;
        self.running = true;
        self.stopped = false;
        Ok(())
    }

    /// Stop every started service, reversed layer by layer. Idempotent: a
    /// second call returns `Ok` without invoking any hook.
    pub async fn stop(&mut self) -> Result<(), CoreError> {
        if self.stopped || !self.running {
            self.stopped = true;
            return Ok(());
        }
        self.running = false;
        self.stopped = true;
        self.cancel.cancel();

        let mut reversed = self.started_layers.clone();
        reversed.reverse();
        let result =
            lifecycle::stop_layers(&self.container, &reversed, &self.cancel, &self.stop_settings())
                .await;
        tracing::info!("application stopped");
        result
    }

    /// Build, start, block until an interrupt, then stop.
    ///
    /// The first interrupt begins graceful shutdown; a second one within the
    /// shutdown window forces exit through the configured exit handler.
    /// Signal-driven shutdown returns `Ok` even when stop hooks failed (their
    /// errors are logged); a start failure is returned to the caller.
    pub async fn run(&mut self) -> Result<(), CoreError> {
        self.build()?;
        let mut signals = self.signals.subscribe();
        self.start().await?;

        signals.recv().await;
        tracing::info!("interrupt received, shutting down");

        let exit = self.exit.clone();
        let force = tokio::spawn(async move {
            if signals.recv().await.is_some() {
                tracing::error!("second interrupt, forcing exit");
                exit(130);
            }
        });

        let result = self.stop().await;
        force.abort();
        if let Err(e) = result {
            tracing::error!(error = %e, "shutdown finished with errors");
        }
        Ok(())
    }

    /// [`App::run`] mapped to a process exit code.
    pub async fn execute(&mut self) -> i32 {
        match self.run().await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "application failed");
                1
            }
        }
    }

    fn stop_settings(&self) -> StopSettings {
        StopSettings {
            default_timeout: self.hook_timeout,
            per_service: self.stop_overrides.clone(),
            global_deadline: self.shutdown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Empty(&'static str);

    impl Module for Empty {
        fn name(&self) -> &'static str {
            self.0
        }

        fn register(&self, _app: &mut App) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_module_fails_build() {
        let mut app = App::new();
        app.with_args(Vec::<String>::new());
        app.install(Empty("metrics"));
        app.install(Empty("metrics"));
        let err = app.build().unwrap_err();
        assert!(err.has_kind(ErrorKind::DuplicateModule));
    }

    #[test]
    fn build_is_idempotent() {
        let mut app = App::new();
        app.with_args(Vec::<String>::new());
        app.build().unwrap();
        app.build().unwrap();
    }

    #[test]
    fn provider_values_is_resolvable_after_build() {
        let mut app = App::new();
        app.with_args(["--log-level", "debug"]);
        app.build().unwrap();
        let values = app.container().resolve::<ProviderValues>().unwrap();
        assert_eq!(values.get_string("log.level").unwrap(), "debug");
    }

    #[test]
    fn unknown_flag_fails_build() {
        let mut app = App::new();
        app.with_args(["--no-such-flag", "1"]);
        let err = app.build().unwrap_err();
        assert!(err.has_kind(ErrorKind::NotSettable));
    }
}
