use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

struct TestOptions {
    timeout_secs: u64,
    start_paused: bool,
}

fn parse_options(attr: TokenStream) -> syn::Result<TestOptions> {
    let mut options = TestOptions {
        timeout_secs: 60,
        start_paused: false,
    };
    if attr.is_empty() {
        return Ok(options);
    }

    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                options.timeout_secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if path.is_ident("start_paused") => {
                options.start_paused = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `start_paused`",
                ));
            }
        }
    }
    Ok(options)
}

/// Runs an async test on a fresh current-thread runtime, failing it if the body
/// does not finish within the timeout (default 60 seconds).
///
/// `#[tokio_timeout_test(10, start_paused)]` additionally starts the runtime
/// with a paused clock; timers then auto-advance whenever the runtime is idle,
/// while the outer wall-clock guard still applies.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    let start_paused = options.start_paused;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    if #start_paused {
                        builder.start_paused(true);
                    }
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
