use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Type};

use crate::crate_path::keel_core_path;

pub fn expand(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match generate(&input) {
        Ok(output) => output.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// Per-field configuration parsed from `#[inject(...)]`.
struct FieldSpec {
    name: Option<String>,
    optional: bool,
}

fn generate(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let ident = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    ident,
                    "#[derive(Inject)] only works on structs with named fields:\n\
                     \n  #[derive(Inject, Clone)]\n  struct MyService {\n      #[inject] dep: OtherService,\n  }",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                ident,
                "#[derive(Inject)] only works on structs; enums and unions are not supported",
            ))
        }
    };

    let krate = keel_core_path();
    let mut assignments: Vec<TokenStream2> = Vec::new();

    for field in fields {
        let Some(spec) = parse_inject_attr(field)? else {
            continue;
        };
        let field_name = field.ident.as_ref().unwrap();
        let field_type = &field.ty;

        let name_expr = match &spec.name {
            Some(name) => quote! { ::core::option::Option::Some(#name) },
            None => quote! { ::core::option::Option::None },
        };

        let assignment = if spec.optional {
            if let Some(inner) = option_inner(field_type) {
                // Option<T> fields absorb the lookup result directly.
                quote! {
                    self.#field_name =
                        #krate::inject::resolve_optional::<#inner>(container, #name_expr)?;
                }
            } else {
                // Plain fields keep their provider-constructed value when the
                // dependency is missing.
                quote! {
                    if let ::core::option::Option::Some(value) =
                        #krate::inject::resolve_optional::<#field_type>(container, #name_expr)?
                    {
                        self.#field_name = value;
                    }
                }
            }
        } else {
            match &spec.name {
                Some(name) => quote! {
                    self.#field_name = container.resolve_named::<#field_type>(#name)?;
                },
                None => quote! {
                    self.#field_name = container.resolve::<#field_type>()?;
                },
            }
        };
        assignments.push(assignment);
    }

    Ok(quote! {
        impl #krate::inject::Inject for #ident {
            fn inject(
                &mut self,
                container: &#krate::container::Container,
            ) -> ::core::result::Result<(), #krate::error::CoreError> {
                #(#assignments)*
                ::core::result::Result::Ok(())
            }
        }
    })
}

/// Parse `#[inject]`, `#[inject(name = "...")]`, `#[inject(optional)]`, or a
/// combination. Returns `None` for fields without the attribute.
fn parse_inject_attr(field: &syn::Field) -> syn::Result<Option<FieldSpec>> {
    let Some(attr) = field.attrs.iter().find(|a| a.path().is_ident("inject")) else {
        return Ok(None);
    };

    let mut spec = FieldSpec {
        name: None,
        optional: false,
    };

    match &attr.meta {
        syn::Meta::Path(_) => {}
        _ => {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value: syn::LitStr = meta.value()?.parse()?;
                    spec.name = Some(value.value());
                    Ok(())
                } else if meta.path.is_ident("optional") {
                    spec.optional = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `name = \"...\"` or `optional`"))
                }
            })?;
        }
    }

    Ok(Some(spec))
}

/// For `Option<T>`, the inner `T`.
fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }
    let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        syn::GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}
