//! # Accessor Derive
//!
//! `#[derive(Accessors)]` generates, for every named field of a struct:
//!
//! - `const fn <field>(&self) -> Ty` (field types must be `Copy`),
//! - `fn set_<field>(&mut self, value: Ty) -> &mut Self`,
//! - `const fn with_<field>(mut self, value: Ty) -> Self`.
//!
//! Fields marked `#[accessors(skip)]` get nothing; `#[accessors(no_get)]`
//! suppresses only the getter (for fields that are not `Copy` or already
//! have a hand-written one).

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive getters and builder-style setters.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Accessors;
///
/// #[derive(Accessors, Default)]
/// struct Flags {
///     writable: bool,
///     #[accessors(skip)]
///     _reserved: u8,
/// }
///
/// let mut f = Flags::default().with_writable(true);
/// assert!(f.writable());
/// f.set_writable(false);
/// assert!(!f.writable());
/// ```
#[proc_macro_derive(Accessors, attributes(accessors))]
pub fn derive_accessors(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Accessors only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Accessors does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Accessors can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let opts = FieldOptions::parse(&field.attrs);
        if opts.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        if !opts.no_get {
            methods.push(quote! {
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> #ty {
                    self.#fname
                }
            });
        }

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    no_get: bool,
}

impl FieldOptions {
    fn parse(attrs: &[syn::Attribute]) -> Self {
        let mut opts = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("accessors") {
                continue;
            }

            // Accept `skip`, `skip = true`, and `no_get`.
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    opts.skip = if meta.input.is_empty() {
                        true
                    } else {
                        meta.value()?.parse::<LitBool>()?.value
                    };
                } else if meta.path.is_ident("no_get") {
                    opts.no_get = true;
                }
                Ok(())
            });
        }
        opts
    }
}
