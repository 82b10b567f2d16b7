extern crate proc_macro;
use proc_macro::TokenStream;

pub(crate) mod crate_path;
pub(crate) mod inject_derive;

/// Derive macro generating a struct-field injection impl.
///
/// Fields marked `#[inject]` are populated from the container after the
/// provider has constructed the value, when the registration chained
/// `.inject()`.
///
/// # Field attributes
///
/// | Attribute | Description |
/// |-----------|-------------|
/// | `#[inject]` | Resolve the field's type from the container. |
/// | `#[inject(name = "id")]` | Resolve the named registration instead. |
/// | `#[inject(optional)]` | Leave the field untouched when the dependency is missing. `Option<T>` fields receive `None`. |
///
/// Unannotated fields are never touched.
///
/// # Example
///
/// ```ignore
/// use keel_core::prelude::*;
/// use keel_macros::Inject;
///
/// #[derive(Clone, Inject)]
/// struct OrderHandler {
///     #[inject]
///     repo: OrderRepo,
///     #[inject(name = "replica")]
///     replica: Db,
///     #[inject(optional)]
///     metrics: Option<Metrics>,
///     retries: u32,
/// }
///
/// container.register::<OrderHandler>()
///     .inject()
///     .provider_fn(|_| OrderHandler::default())?;
/// ```
#[proc_macro_derive(Inject, attributes(inject))]
pub fn derive_inject(input: TokenStream) -> TokenStream {
    inject_derive::expand(input)
}
