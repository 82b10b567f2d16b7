use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::config::ConfigFlag;
use crate::error::CoreError;
use crate::lifecycle::{HookCtx, HookError, Lifecycle};

use super::Container;

/// Type-erased service value. Singletons hand out clones of the `Arc`;
/// the typed layer downcasts and clones the concrete value out.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Type-erased provider closure: the user provider plus the optional
/// field-injection step, composed at registration time.
pub(crate) type ErasedProvider =
    Box<dyn Fn(&Container) -> Result<ErasedValue, CoreError> + Send + Sync>;

pub(crate) type HookFuture = Pin<Box<dyn Future<Output = Result<(), HookError>> + Send + 'static>>;

/// Storage/construction regime of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One shared value, constructed on first resolve (or at build when eager).
    Singleton,
    /// A fresh value per resolve; the container keeps no reference.
    Transient,
}

/// Type-erased start/stop adapters captured by `.managed()`.
///
/// Each closure clones the concrete service out of the cached value and
/// drives its [`Lifecycle`] hook, so the engine never needs the type.
pub(crate) struct HookSet {
    start: Box<dyn Fn(&ErasedValue, HookCtx) -> HookFuture + Send + Sync>,
    stop: Box<dyn Fn(&ErasedValue, HookCtx) -> HookFuture + Send + Sync>,
}

impl HookSet {
    pub(crate) fn bind<T: Lifecycle>() -> Self {
        Self {
            start: Box::new(|value, ctx| {
                let service = value
                    .downcast_ref::<T>()
                    .expect("hook adapter bound to its own registration type")
                    .clone();
                Box::pin(async move { service.start(ctx).await })
            }),
            stop: Box::new(|value, ctx| {
                let service = value
                    .downcast_ref::<T>()
                    .expect("hook adapter bound to its own registration type")
                    .clone();
                Box::pin(async move { service.stop(ctx).await })
            }),
        }
    }

    pub(crate) fn start(&self, value: &ErasedValue, ctx: HookCtx) -> HookFuture {
        (self.start)(value, ctx)
    }

    pub(crate) fn stop(&self, value: &ErasedValue, ctx: HookCtx) -> HookFuture {
        (self.stop)(value, ctx)
    }
}

/// Internal registration record: one per service key.
pub(crate) struct ServiceWrapper {
    pub(crate) key: String,
    pub(crate) type_name: &'static str,
    pub(crate) scope: Scope,
    pub(crate) eager: bool,
    provider: Option<ErasedProvider>,
    /// Singleton cache (pre-filled for instance registrations). The mutex is
    /// what makes two concurrent first-resolves invoke the provider once.
    slot: Mutex<Option<ErasedValue>>,
    pub(crate) hooks: Option<HookSet>,
    pub(crate) config: Option<(&'static str, Vec<ConfigFlag>)>,
}

impl ServiceWrapper {
    pub(crate) fn from_provider(
        key: String,
        type_name: &'static str,
        scope: Scope,
        eager: bool,
        provider: ErasedProvider,
        hooks: Option<HookSet>,
        config: Option<(&'static str, Vec<ConfigFlag>)>,
    ) -> Self {
        Self {
            key,
            type_name,
            scope,
            eager,
            provider: Some(provider),
            slot: Mutex::new(None),
            hooks,
            config,
        }
    }

    pub(crate) fn from_instance(
        key: String,
        type_name: &'static str,
        value: ErasedValue,
        hooks: Option<HookSet>,
        config: Option<(&'static str, Vec<ConfigFlag>)>,
    ) -> Self {
        Self {
            key,
            type_name,
            scope: Scope::Singleton,
            // A pre-built value is eager-equivalent: it exists, so it
            // participates in build-time touch and layering.
            eager: true,
            provider: None,
            slot: Mutex::new(Some(value)),
            hooks,
            config,
        }
    }

    /// Resolve this wrapper to its erased value per its scope.
    pub(crate) fn resolve_value(&self, container: &Container) -> Result<ErasedValue, CoreError> {
        match self.scope {
            Scope::Transient => self.invoke_provider(container),
            Scope::Singleton => {
                let mut slot = self.slot.lock().expect("singleton slot poisoned");
                if let Some(value) = slot.as_ref() {
                    return Ok(value.clone());
                }
                let value = self.invoke_provider(container)?;
                *slot = Some(value.clone());
                Ok(value)
            }
        }
    }

    fn invoke_provider(&self, container: &Container) -> Result<ErasedValue, CoreError> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            // An instance wrapper always has its slot filled; reaching this
            // point means the slot was cleared, which cannot happen.
            CoreError::InvalidProvider {
                key: self.key.clone(),
                reason: "registration has neither provider nor value".to_string(),
            }
        })?;
        match catch_unwind(AssertUnwindSafe(|| provider(container))) {
            Ok(result) => result,
            Err(payload) => Err(CoreError::ProviderPanic {
                key: self.key.clone(),
                payload: panic_message(payload),
            }),
        }
    }

    /// The cached value, when this wrapper has been instantiated.
    pub(crate) fn cached(&self) -> Option<ErasedValue> {
        self.slot.lock().expect("singleton slot poisoned").clone()
    }

    pub(crate) fn initialized(&self) -> bool {
        self.slot
            .lock()
            .expect("singleton slot poisoned")
            .is_some()
    }
}

/// Render a panic payload for error messages.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
