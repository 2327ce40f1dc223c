//! Derive macros for eventstore-tools
//!
//! This crate removes the boilerplate of declaring event types.
//!
//! # Available Macros
//!
//! - `#[derive(DomainEvent)]` - Gives a payload type its stable type tag
//! - `#[derive(EventSet)]` - Turns an enum of domain events into the closed
//!   event set of an aggregate
//!
//! # Example
//!
//! ```ignore
//! use eventstore_tools_macros::{DomainEvent, EventSet};
//!
//! #[derive(DomainEvent, Serialize, Deserialize, Clone, Debug)]
//! #[domain_event(name = "OrderPlaced")]
//! struct OrderPlaced { order_id: String }
//!
//! #[derive(DomainEvent, Serialize, Deserialize, Clone, Debug)]
//! struct OrderShipped { order_id: String }
//!
//! #[derive(EventSet, Clone, Debug)]
//! enum OrderEvent {
//!     Placed(OrderPlaced),
//!     Shipped(OrderShipped),
//! }
//!
//! assert_eq!(OrderEvent::event_types(), &["OrderPlaced", "OrderShipped"]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, Type, parse_macro_input};

/// Derive macro for domain events
///
/// Implements `eventstore_tools_core::event::DomainEvent`. The type tag is
/// the type's name unless `#[domain_event(name = "...")]` says otherwise.
/// The tag is persisted with every record, so renaming the type later needs
/// the attribute to keep old records readable.
///
/// # Attributes
///
/// - `#[domain_event(name = "Tag")]` - Use `Tag` as the type tag
///
/// # Example
///
/// ```ignore
/// #[derive(DomainEvent, Serialize, Deserialize)]
/// #[domain_event(name = "AccountOpened")]
/// struct Opened { owner: String }
///
/// assert_eq!(Opened::EVENT_TYPE, "AccountOpened");
/// ```
#[proc_macro_derive(DomainEvent, attributes(domain_event))]
pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let event_type = match event_type_name(&input.attrs) {
        Ok(Some(tag)) => tag,
        Ok(None) => LitStr::new(&name.to_string(), name.span()),
        Err(err) => return err.to_compile_error().into(),
    };
    if event_type.value().trim().is_empty() {
        return syn::Error::new_spanned(event_type, "event type tag must not be empty")
            .to_compile_error()
            .into();
    }

    let expanded = quote! {
        impl #impl_generics ::eventstore_tools_core::event::DomainEvent for #name #ty_generics #where_clause {
            const EVENT_TYPE: &'static str = #event_type;
        }
    };

    TokenStream::from(expanded)
}

/// Derive macro for event sets
///
/// Implements `eventstore_tools_core::event::EventSet` for an enum whose
/// variants each wrap exactly one `DomainEvent`, plus `From<Event>` for every
/// wrapped type.
///
/// # Panics
///
/// This macro will produce a compile error (not a runtime panic) if:
/// - Applied to a non-enum type or an enum without variants
/// - A variant does not wrap exactly one unnamed field
///
/// # Example
///
/// ```ignore
/// #[derive(EventSet, Clone, Debug)]
/// enum AccountEvent {
///     Opened(Opened),
///     Deposited(Deposited),
/// }
///
/// let decoded = AccountEvent::decode("Deposited", br#"{"amount":5}"#)?;
/// ```
#[proc_macro_derive(EventSet)]
pub fn derive_event_set(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let Data::Enum(data_enum) = &input.data else {
        return syn::Error::new_spanned(input, "#[derive(EventSet)] can only be used on enums")
            .to_compile_error()
            .into();
    };
    if data_enum.variants.is_empty() {
        return syn::Error::new_spanned(input, "#[derive(EventSet)] needs at least one variant")
            .to_compile_error()
            .into();
    }

    let mut variants = Vec::new();
    let mut types: Vec<&Type> = Vec::new();
    for variant in &data_enum.variants {
        match &variant.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                variants.push(&variant.ident);
                types.extend(fields.unnamed.iter().map(|field| &field.ty));
            }
            _ => {
                return syn::Error::new_spanned(
                    variant,
                    "EventSet variants must wrap exactly one domain event, like `Placed(OrderPlaced)`",
                )
                .to_compile_error()
                .into();
            }
        }
    }

    let core = quote! { ::eventstore_tools_core::event };
    let expanded = quote! {
        impl #core::EventSet for #name {
            fn event_type(&self) -> &'static str {
                match self {
                    #( Self::#variants(_) => <#types as #core::DomainEvent>::EVENT_TYPE, )*
                }
            }

            fn encode(&self) -> ::std::result::Result<::std::vec::Vec<u8>, #core::EventError> {
                match self {
                    #( Self::#variants(event) => #core::DomainEvent::to_json(event), )*
                }
            }

            fn decode(
                event_type: &str,
                data: &[u8],
            ) -> ::std::result::Result<::std::option::Option<Self>, #core::EventError> {
                #(
                    if event_type == <#types as #core::DomainEvent>::EVENT_TYPE {
                        return <#types as #core::DomainEvent>::from_json(data)
                            .map(|event| ::std::option::Option::Some(Self::#variants(event)));
                    }
                )*
                ::std::result::Result::Ok(::std::option::Option::None)
            }

            fn event_types() -> &'static [&'static str] {
                const TYPES: &[&str] = &[ #( <#types as #core::DomainEvent>::EVENT_TYPE ),* ];
                TYPES
            }
        }

        #(
            impl ::std::convert::From<#types> for #name {
                fn from(event: #types) -> Self {
                    Self::#variants(event)
                }
            }
        )*
    };

    TokenStream::from(expanded)
}

/// Tag given by `#[domain_event(name = "...")]`, if any.
fn event_type_name(attrs: &[Attribute]) -> syn::Result<Option<LitStr>> {
    let mut tag = None;
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("domain_event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                tag = Some(meta.value()?.parse::<LitStr>()?);
                Ok(())
            } else {
                Err(meta.error("unsupported domain_event attribute, expected `name`"))
            }
        })?;
    }
    Ok(tag)
}
