//! Crate path resolution for generated code.
//!
//! Detects whether the user depends on `keel` (facade) or `keel-core`
//! directly, and returns the appropriate path prefix for generated code.

use proc_macro2::TokenStream;
use proc_macro_crate::{crate_name, FoundCrate};
use quote::quote;

/// Returns the token stream for accessing `keel_core` types.
///
/// If the user depends on `keel`, returns `::keel` (the facade re-exports
/// every `keel_core` module at its root). Otherwise returns `::keel_core`.
pub fn keel_core_path() -> TokenStream {
    if let Ok(found) = crate_name("keel") {
        match found {
            // Inside keel's own test targets the lib is still an extern crate.
            FoundCrate::Itself => quote!(::keel),
            FoundCrate::Name(name) => {
                let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
                quote!(::#ident)
            }
        }
    } else if let Ok(found) = crate_name("keel-core") {
        match found {
            FoundCrate::Itself => quote!(::keel_core),
            FoundCrate::Name(name) => {
                let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
                quote!(::#ident)
            }
        }
    } else {
        // Fallback - assume keel_core is available (for error messages)
        quote!(::keel_core)
    }
}
