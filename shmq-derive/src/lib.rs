use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `ShmSafe` trait.
///
/// Generates `unsafe impl ShmSafe` after verifying, at compile time, that a
/// type is plausible to place in memory shared between processes:
///
/// 1. **Stable layout**: `#[repr(C)]`, `#[repr(transparent)]`, or an integer
///    repr for enums. The default Rust layout may differ between compilation
///    units, so it is rejected.
/// 2. **No pointer-bearing fields**: virtual addresses are process-specific.
///    `Vec`, `Box`, `String`, `Rc`, `Arc`, `Mutex`, references, and raw
///    pointers are all rejected with an explanation.
/// 3. **Recursive safety**: every field type must itself be `ShmSafe`,
///    enforced through generated `where` bounds.
///
/// The impl is still `unsafe` at heart: the macro cannot check that
/// concurrent access is mediated by atomics, or that the type tolerates its
/// destructor never running (a crashed process unmaps without dropping).
/// Those obligations stay with the author of the type.
///
/// # Example
///
/// ```
/// # use shmq::ShmSafe;
/// use std::sync::atomic::AtomicU64;
///
/// #[derive(ShmSafe)]
/// #[repr(C)]
/// struct Cursor {
///     position: AtomicU64,
///     scratch: [u8; 64],
/// }
/// ```
#[proc_macro_derive(ShmSafe)]
pub fn derive_shm_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    check_repr(&input)?;

    let field_types = field_types(&input.data)?;
    field_types.iter().try_for_each(check_field_type)?;

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let krate = crate_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote! {
            #ty: #krate::__ShmSafePrivate
        });
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #krate::__ShmSafePrivate for #name #ty_generics {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #krate::__ShmSafePrivate for #name #ty_generics
            where
                #(#predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

/// Resolves the path to the `shmq` crate, which may be renamed in the
/// caller's Cargo.toml or be the crate currently being compiled.
fn crate_path() -> proc_macro2::TokenStream {
    match crate_name("shmq") {
        Ok(FoundCrate::Itself) => quote!(::shmq),
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Err(_) => quote!(::shmq),
    }
}

fn repr_ident_is_stable(ident: &syn::Ident) -> bool {
    const INT_REPRS: &[&str] = &[
        "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64", "i128", "isize",
    ];
    ident == "C" || ident == "transparent" || INT_REPRS.iter().any(|&r| ident == r)
}

fn attr_has_stable_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }

    let mut stable = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident() {
            if repr_ident_is_stable(ident) {
                stable = true;
            }
        }
        // Consume arguments of modifiers like align(128) or packed(N) so
        // they can ride along with a stable repr.
        if meta.input.peek(syn::token::Paren) {
            let content;
            syn::parenthesized!(content in meta.input);
            content.parse::<proc_macro2::TokenStream>()?;
        }
        Ok(())
    })?;
    Ok(stable)
}

fn check_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if attr_has_stable_repr(attr)? {
            return Ok(());
        }
    }

    let help = if matches!(input.data, Data::Enum(_)) {
        "ShmSafe requires #[repr(C)], #[repr(transparent)], or #[repr(u8/i32/etc)] for enums\n\
         help: add #[repr(C)] or #[repr(u8)] above this item"
    } else {
        "ShmSafe requires #[repr(C)] or #[repr(transparent)]\n\
         help: add #[repr(C)] above this item"
    };
    Err(Error::new(input.span(), help))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of_fields(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(fields) => fields.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(fields) => fields.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(s) => Ok(of_fields(&s.fields)),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of_fields(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "ShmSafe cannot be derived for unions",
        )),
    }
}

/// Walks a field type rejecting anything that embeds a process-local address.
fn check_field_type(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    reject_forbidden(&segment.ident, field_ty, segment.ident.span())?;

                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner) = arg {
                                    walk(inner, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret) = &args.output {
                                walk(ret, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
            }

            Type::Reference(r) => {
                return Err(Error::new(
                    r.span(),
                    format!(
                        "Field type `{}` contains a reference.\n\
                         References are process-specific and cannot live in shared memory.\n\
                         help: use inline data or atomics instead",
                        quote!(#field_ty),
                    ),
                ));
            }

            Type::Ptr(p) => {
                return Err(Error::new(
                    p.span(),
                    format!(
                        "Field type `{}` contains a raw pointer.\n\
                         Pointers are process-specific and cannot live in shared memory.\n\
                         help: use integer offsets into the region instead",
                        quote!(#field_ty),
                    ),
                ));
            }

            Type::Tuple(t) => {
                for elem in &t.elems {
                    walk(elem, field_ty)?;
                }
            }
            Type::Array(a) => walk(&a.elem, field_ty)?,
            Type::Slice(s) => walk(&s.elem, field_ty)?,
            Type::Group(g) => walk(&g.elem, field_ty)?,
            Type::Paren(p) => walk(&p.elem, field_ty)?,

            // Remaining variants (Never, Infer, Macro, TraitObject, ...) either
            // cannot appear as field types or carry no nested types to check.
            _ => {}
        }

        Ok(())
    }

    walk(field_ty, field_ty)
}

fn reject_forbidden(ident: &Ident, field_ty: &Type, span: proc_macro2::Span) -> syn::Result<()> {
    const HEAP: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
    const COUNTED: &[&str] = &["Rc", "Arc"];
    const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

    let msg = if HEAP.iter().any(|&n| ident == n) {
        format!(
            "Field type `{}` contains `{}` which owns a heap allocation.\n\
             Shared memory cannot contain pointer types.\n\
             help: use inline data like `[T; N]` instead",
            quote!(#field_ty),
            ident,
        )
    } else if COUNTED.iter().any(|&n| ident == n) {
        format!(
            "Field type `{}` contains `{}` which uses reference counting.\n\
             Shared memory cannot contain pointer types.\n\
             help: use inline data or atomics instead",
            quote!(#field_ty),
            ident,
        )
    } else if PROCESS_LOCAL.iter().any(|&n| ident == n) {
        format!(
            "Field type `{}` contains `{}` which is process-local.\n\
             `std::sync::{}` does not synchronize across process boundaries.\n\
             help: use atomic types (AtomicU64, AtomicBool, ...) instead",
            quote!(#field_ty),
            ident,
            ident,
        )
    } else {
        return Ok(());
    };

    Err(Error::new(span, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn repr_c_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn repr_transparent_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Foo(u32);
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn int_repr_enum_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(u8)]
            enum Mode {
                A,
                B,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn missing_repr_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn repr_align_alone_rejected() {
        let input: DeriveInput = parse_quote! {
            #[repr(align(64))]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn repr_c_with_align_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C, align(128))]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn vec_field_rejected() {
        let ty: Type = parse_quote!(Vec<u8>);
        assert!(check_field_type(&ty).is_err());
    }

    #[test]
    fn nested_box_rejected() {
        let ty: Type = parse_quote!([Option<Box<u8>>; 4]);
        assert!(check_field_type(&ty).is_err());
    }

    #[test]
    fn reference_rejected() {
        let ty: Type = parse_quote!(&'static u8);
        assert!(check_field_type(&ty).is_err());
    }

    #[test]
    fn raw_pointer_rejected() {
        let ty: Type = parse_quote!(*mut u8);
        assert!(check_field_type(&ty).is_err());
    }

    #[test]
    fn mutex_rejected() {
        let ty: Type = parse_quote!(std::sync::Mutex<u64>);
        assert!(check_field_type(&ty).is_err());
    }

    #[test]
    fn atomics_and_arrays_accepted() {
        let ty: Type = parse_quote!([std::sync::atomic::AtomicU64; 8]);
        assert!(check_field_type(&ty).is_ok());
    }
}
