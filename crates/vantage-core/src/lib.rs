// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Ambient services shared by every vantage crate: subscriber setup and the
//! diagnostics sink that components receive at construction.

mod diagnostics;

pub use diagnostics::{
    CaptureDiagnostics, CapturedEvent, Diagnostics, DiagnosticsExt, SharedDiagnostics,
    TracingDiagnostics,
};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
