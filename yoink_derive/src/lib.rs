//! `#[derive(Shape)]`: generates a `yoink::Shape` describing where a struct's
//! managed-pointer fields live, from fields tagged `#[yoink(ptr)]`.
//!
//! Replaces the original source's `BEGIN_PTRS`/`END_PTRS` sentinel-member
//! trick (two zero-sized fields bracketing the pointer slice, with the shape
//! recovered via offset subtraction at the call site) with a compile-time
//! derive: every `#[yoink(ptr)]` field must be a `yoink::ManagedPtr` and the
//! tagged fields must be mutually contiguous, so their combined span is a
//! single `[bptrs, bptrs + nptrs)` word range matching what `Shape` records.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Data, DeriveInput, Error, Field, Fields, Ident, parse_macro_input};

const WORD: usize = core::mem::size_of::<usize>();

fn has_ptr_attr(field: &Field) -> bool {
    field.attrs.iter().any(|attr| {
        if !attr.path().is_ident("yoink") {
            return false;
        }
        let mut found = false;
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("ptr") {
                found = true;
            }
            Ok(())
        });
        found
    })
}

fn derive_shape_impl(input: DeriveInput) -> Result<proc_macro2::TokenStream, Error> {
    let name = input.ident;

    let Data::Struct(data) = input.data else {
        return Err(Error::new(
            Span::call_site(),
            "#[derive(Shape)] only supports structs",
        ));
    };
    let Fields::Named(fields) = data.fields else {
        return Err(Error::new(
            Span::call_site(),
            "#[derive(Shape)] requires named fields",
        ));
    };

    let field_names: Vec<&Ident> = fields
        .named
        .iter()
        .map(|f| f.ident.as_ref().expect("named field"))
        .collect();
    let ptr_indices: Vec<usize> = fields
        .named
        .iter()
        .enumerate()
        .filter(|(_, f)| has_ptr_attr(f))
        .map(|(i, _)| i)
        .collect();

    if ptr_indices.is_empty() {
        return Ok(quote! {
            impl ::yoink::HasShape for #name {
                const SHAPE: ::yoink::Shape = ::yoink::Shape::OPAQUE;
            }
        });
    }

    let first = ptr_indices[0];
    let last = ptr_indices[ptr_indices.len() - 1];
    if last - first + 1 != ptr_indices.len() {
        return Err(Error::new(
            Span::call_site(),
            "#[yoink(ptr)] fields must be mutually contiguous: no untagged field may sit between two tagged fields",
        ));
    }

    let first_field = field_names[first];
    let last_field = field_names[last];
    let nptrs = ptr_indices.len() as u32;

    // The byte span between the first and last tagged field, divided by the
    // word size, is `Shape::bptrs`/`nptrs`; the two const asserts below
    // reject a tagged field that isn't pointer-sized or that leaves padding
    // in the span, which is what contiguity actually requires at the byte
    // level (a non-`ManagedPtr` tagged field of the wrong size fails one of
    // these rather than silently producing a wrong shape).
    Ok(quote! {
        impl ::yoink::HasShape for #name {
            const SHAPE: ::yoink::Shape = {
                const BEGIN: usize = ::core::mem::offset_of!(#name, #first_field);
                const END: usize = ::core::mem::offset_of!(#name, #last_field)
                    + ::core::mem::size_of::<::yoink::ManagedPtr>();
                const _: () = assert!(
                    BEGIN % #WORD == 0,
                    "#[yoink(ptr)] fields must start at a pointer-sized word boundary",
                );
                const _: () = assert!(
                    END - BEGIN == #nptrs as usize * #WORD,
                    "#[yoink(ptr)] fields must be mutually contiguous ManagedPtr slots with no padding between them",
                );
                ::yoink::Shape::new((BEGIN / #WORD) as u32, #nptrs)
            };
        }
    })
}

/// Derive [`yoink::HasShape`] from `#[yoink(ptr)]`-tagged fields.
///
/// Every tagged field must be a `yoink::ManagedPtr` and all tagged fields
/// must be mutually contiguous (no untagged field between the first and the
/// last one); the derive computes their combined byte span via
/// `core::mem::offset_of!` and turns it into a `Shape`. A struct with no
/// tagged fields derives `Shape::OPAQUE`.
#[proc_macro_derive(Shape, attributes(yoink))]
pub fn derive_shape(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match derive_shape_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn shape_body(input: DeriveInput) -> String {
        derive_shape_impl(input).unwrap().to_string()
    }

    #[test]
    fn no_tagged_fields_yields_opaque() {
        let input: DeriveInput = parse_quote! {
            struct Leaf {
                value: usize,
            }
        };
        let out = shape_body(input);
        assert!(out.contains("OPAQUE"));
    }

    #[test]
    fn contiguous_tagged_fields_compile() {
        let input: DeriveInput = parse_quote! {
            struct Cons {
                #[yoink(ptr)]
                car: yoink::ManagedPtr,
                #[yoink(ptr)]
                cdr: yoink::ManagedPtr,
            }
        };
        let out = shape_body(input);
        assert!(out.contains("offset_of"));
        assert!(out.contains("Shape :: new"));
    }

    #[test]
    fn non_contiguous_tagged_fields_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Node {
                #[yoink(ptr)]
                left: yoink::ManagedPtr,
                value: usize,
                #[yoink(ptr)]
                right: yoink::ManagedPtr,
            }
        };
        let err = derive_shape_impl(input).unwrap_err();
        assert!(err.to_string().contains("mutually contiguous"));
    }

    #[test]
    fn non_struct_input_rejected() {
        let input: DeriveInput = parse_quote! {
            enum NotAStruct {
                A,
                B,
            }
        };
        let err = derive_shape_impl(input).unwrap_err();
        assert!(err.to_string().contains("only supports structs"));
    }
}
