//! Structured logging and optional OpenTelemetry span export.
//!
//! Spans and log fields carry tenant ids and operation names only. Key
//! material, salts, passwords and tokens must never appear in any span
//! attribute or log field.
//!
//! Log level is taken from `RUST_LOG` when set, otherwise from
//! `SEALKIT_LOG_LEVEL` via [`Config`](crate::config::Config) (default `info`).

pub mod init;

pub use init::init_telemetry;
