use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Error, Field, Fields, GenericArgument, LitStr, PathArguments, Type};

pub fn derive_accessors(input: TokenStream) -> TokenStream {
    let input: DeriveInput = match syn::parse2(input) {
        Ok(input) => input,
        Err(err) => return err.to_compile_error(),
    };

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            other => {
                return Error::new_spanned(other, "Accessors can only be derived for structs with named fields")
                    .to_compile_error();
            }
        },
        _ => {
            return Error::new_spanned(ident, "Accessors can only be derived for structs with named fields")
                .to_compile_error();
        }
    };

    let mut constants = Vec::new();
    let mut names = Vec::new();

    for field in fields {
        let options = match FieldOptions::parse(field) {
            Ok(options) => options,
            Err(err) => return err.to_compile_error(),
        };
        if options.skip {
            continue;
        }

        let Some(field_ident) = field.ident.as_ref() else {
            continue;
        };
        let raw = field_ident.to_string();
        let raw = raw.strip_prefix("r#").unwrap_or(&raw);
        let name = options.rename.unwrap_or_else(|| raw.to_owned());
        let constant = format_ident!("{}", raw.to_uppercase());
        let value_ty = option_inner(&field.ty).unwrap_or(&field.ty);
        let doc = format!("Typed accessor for the `{name}` attribute.");

        constants.push(quote! {
            #[doc = #doc]
            pub const #constant: ::docmodel::document::TypedField<#value_ty> =
                ::docmodel::document::TypedField::new(#name);
        });
        names.push(name);
    }

    quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#constants)*

            /// Attribute names covered by the generated accessors.
            pub const ACCESSOR_NAMES: &'static [&'static str] = &[#(#names),*];
        }
    }
}

///
/// FieldOptions
///

#[derive(Default)]
struct FieldOptions {
    rename: Option<String>,
    skip: bool,
}

impl FieldOptions {
    fn parse(field: &Field) -> syn::Result<Self> {
        let mut options = Self::default();

        for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("accessor")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    let value: LitStr = meta.value()?.parse()?;
                    options.rename = Some(value.value());
                    Ok(())
                } else if meta.path.is_ident("skip") {
                    options.skip = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `rename = \"...\"` or `skip`"))
                }
            })?;
        }

        Ok(options)
    }
}

/// `T` for a field typed `Option<T>`.
fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }

    match &segment.arguments {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|arg| match arg {
            GenericArgument::Type(inner) => Some(inner),
            _ => None,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_constants_and_names() {
        let output = derive_accessors(quote! {
            struct Post {
                title: String,
                #[accessor(rename = "view_count")]
                views: Option<i64>,
                #[accessor(skip)]
                cache: Vec<u8>,
            }
        })
        .to_string();

        assert!(output.contains("pub const TITLE"));
        assert!(output.contains("TypedField < i64 >"));
        assert!(output.contains("\"view_count\""));
        assert!(!output.contains("CACHE"));
    }

    #[test]
    fn test_rejects_tuple_structs() {
        let output = derive_accessors(quote! { struct Pair(i32, i32); }).to_string();
        assert!(output.contains("compile_error"));
    }
}
