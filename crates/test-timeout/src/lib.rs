//! `#[tokio_timeout_test]`: runs an async test on its own multi-threaded
//! runtime, fails it once the deadline passes, and installs a test-writer
//! tracing subscriber filtered by `RUST_LOG`.
//!
//! Crates using the attribute need `tokio` and `tracing-subscriber` (with
//! the `env-filter` feature) available to their tests.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let path = attr.path();
    path.segments.len() == 2 && path.segments[0].ident == "tokio" && path.segments[1].ident == "test"
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    let attrs = attrs.into_iter().filter(|attr| !is_tokio_test(attr));
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();

            let deadline = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_multi_thread()
                            .worker_threads(2)
                            .enable_all()
                            .build()
                            .expect("build test runtime");
                        // The timer has to be created inside the runtime.
                        let finished = runtime.block_on(async move {
                            tokio::time::timeout(deadline, async move #block).await
                        });
                        runtime.shutdown_timeout(std::time::Duration::from_secs(1));
                        finished.is_ok()
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");

            // Covers a runtime that hangs while shutting down.
            match done_rx.recv_timeout(deadline + std::time::Duration::from_secs(5)) {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} timed out after {}s", #name, #secs)
                }
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited without reporting", #name)
                }
            }
        }
    })
}
