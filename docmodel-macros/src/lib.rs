//! Procedural macros for the docmodel project.
//!
//! - `#[derive(Accessors)]` generates a typed accessor constant per named
//!   field of a struct, so schema attributes can be read and written without
//!   spelling out attribute names.

#[allow(unused_extern_crates)]
extern crate self as docmodel_macros;

use proc_macro::TokenStream;

mod accessors;

/// Generates one `TypedField` constant per named field.
///
/// ```ignore
/// #[derive(Accessors)]
/// struct Post {
///     title: String,
///     #[accessor(rename = "view_count")]
///     views: Option<i64>,
///     #[accessor(skip)]
///     cache: (),
/// }
///
/// Post::TITLE.set(&mut model, &"Hello".to_owned())?;
/// let views: Option<i64> = Post::VIEWS.get(&model)?;
/// ```
///
/// `Option<T>` fields produce `TypedField<T>`: absence is already expressed
/// by the accessor's `Option` return.
#[proc_macro_derive(Accessors, attributes(accessor))]
pub fn derive_accessors(input: TokenStream) -> TokenStream {
    accessors::derive_accessors(input.into()).into()
}
