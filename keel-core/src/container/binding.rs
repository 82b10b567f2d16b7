use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::ConfigProvider;
use crate::error::CoreError;
use crate::inject::Inject;
use crate::lifecycle::Lifecycle;

use super::wrapper::{ErasedProvider, ErasedValue, HookSet, Scope, ServiceWrapper};
use super::{service_key, Container};

type InjectFn<T> = Box<dyn Fn(&mut T, &Container) -> Result<(), CoreError> + Send + Sync>;

/// Fluent registration builder returned by [`Container::register`].
///
/// Chain modifiers configure the registration; a terminal
/// ([`provider`](Binding::provider), [`provider_fn`](Binding::provider_fn),
/// [`instance`](Binding::instance)) commits it.
///
/// ```ignore
/// container
///     .register::<Mailer>()
///     .named("smtp")
///     .eager()
///     .managed()
///     .provider(|c| Mailer::connect(&c.resolve::<ProviderValues>()?))?;
/// ```
#[must_use = "a registration does nothing until a terminal (.provider/.provider_fn/.instance) is called"]
pub struct Binding<'c, T> {
    container: &'c Container,
    name: Option<String>,
    scope: Scope,
    eager: bool,
    replace: bool,
    inject: Option<InjectFn<T>>,
    hooks: Option<HookSet>,
    config: Option<(&'static str, Vec<crate::config::ConfigFlag>)>,
    _marker: PhantomData<fn() -> T>,
}

impl<'c, T: Clone + Send + Sync + 'static> Binding<'c, T> {
    pub(crate) fn new(container: &'c Container) -> Self {
        Self {
            container,
            name: None,
            scope: Scope::Singleton,
            eager: false,
            replace: false,
            inject: None,
            hooks: None,
            config: None,
            _marker: PhantomData,
        }
    }

    /// Register under `type_name[name]` instead of the bare type name.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// A fresh value is constructed on every resolve; the container keeps no
    /// reference and the caller owns the result.
    pub fn transient(mut self) -> Self {
        self.scope = Scope::Transient;
        self
    }

    /// Construct the singleton during `Container::build` instead of on first
    /// resolve. Rejected for transients at the terminal.
    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Allow this registration to override an existing one with the same key.
    /// The terminal fails with `NotFound` when there is nothing to replace.
    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    /// Run [`Inject::inject`] on the constructed value before it is cached or
    /// returned, inside the same resolution frame.
    pub fn inject(mut self) -> Self
    where
        T: Inject,
    {
        self.inject = Some(Box::new(|value, container| value.inject(container)));
        self
    }

    /// Record start/stop hooks so the lifecycle engine manages this service.
    pub fn managed(mut self) -> Self
    where
        T: Lifecycle,
    {
        self.hooks = Some(HookSet::bind::<T>());
        self
    }

    /// Record this service's namespaced config contract for build-time
    /// default installation and required-key enforcement.
    pub fn with_config(mut self) -> Self
    where
        T: ConfigProvider,
    {
        self.config = Some((T::config_namespace(), T::config_flags()));
        self
    }

    /// Terminal: a fallible provider.
    pub fn provider<F>(self, provider: F) -> Result<(), CoreError>
    where
        F: Fn(&Container) -> Result<T, CoreError> + Send + Sync + 'static,
    {
        let key = service_key::<T>(self.name.as_deref());
        if self.eager && self.scope == Scope::Transient {
            return Err(CoreError::InvalidProvider {
                key,
                reason: "transient services cannot be eager".to_string(),
            });
        }

        let inject = self.inject;
        let erased: ErasedProvider = Box::new(move |container| {
            let mut value = provider(container)?;
            if let Some(inject) = &inject {
                inject(&mut value, container)?;
            }
            Ok(Arc::new(value) as ErasedValue)
        });

        let wrapper = ServiceWrapper::from_provider(
            key,
            std::any::type_name::<T>(),
            self.scope,
            self.eager,
            erased,
            self.hooks,
            self.config,
        );
        self.container.insert_wrapper(wrapper, self.replace)
    }

    /// Terminal: an infallible provider.
    pub fn provider_fn<F>(self, provider: F) -> Result<(), CoreError>
    where
        F: Fn(&Container) -> T + Send + Sync + 'static,
    {
        self.provider(move |container| Ok(provider(container)))
    }

    /// Terminal: a pre-built value. Always a singleton; participates in
    /// layering like an eager service; never field-injected.
    pub fn instance(self, value: T) -> Result<(), CoreError> {
        let key = service_key::<T>(self.name.as_deref());
        if self.scope == Scope::Transient {
            return Err(CoreError::InvalidProvider {
                key,
                reason: "an instance registration is always a singleton".to_string(),
            });
        }
        if self.inject.is_some() {
            return Err(CoreError::NotSettable {
                key,
                reason: "instance registrations are pre-built; field injection never runs"
                    .to_string(),
            });
        }

        let wrapper = ServiceWrapper::from_instance(
            key,
            std::any::type_name::<T>(),
            Arc::new(value) as ErasedValue,
            self.hooks,
            self.config,
        );
        self.container.insert_wrapper(wrapper, self.replace)
    }
}
