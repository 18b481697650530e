//! Compile time helpers for Teleinfo checksums
use proc_macro::TokenStream;
use quote::quote;
use syn::{Ident, LitStr};

/// Sum the characters of a Teleinfo label at compile time.
///
/// The label can be given as a string literal or as a bare identifier:
///
/// ```ignore
/// const ADCO: u64 = teleinfo_checksum_str!("ADCO");
/// assert_eq!(ADCO, teleinfo_checksum_str!(ADCO));
/// ```
///
/// Teleinfo labels are 7 bits ASCII, any other character is rejected.
#[proc_macro]
pub fn teleinfo_checksum_str(input: TokenStream) -> TokenStream {
    let (value, span) = if let Ok(label) = syn::parse::<LitStr>(input.clone()) {
        (label.value(), label.span())
    } else {
        match syn::parse::<Ident>(input) {
            Ok(label) => (label.to_string(), label.span()),
            Err(e) => return e.to_compile_error().into(),
        }
    };

    if let Some(c) = value.chars().find(|c| !c.is_ascii()) {
        return syn::Error::new(
            span,
            format!("Teleinfo label `{value}` contains non ASCII character `{c}`"),
        )
        .to_compile_error()
        .into();
    }

    let checksum: u64 = value.chars().map(|c| c as u64).sum();
    let expanded: proc_macro2::TokenStream = quote! { #checksum };
    expanded.into()
}
