//! Fileflow application wiring
//!
//! Builds every adapter, worker and service from [`fileflow_core::Config`] and
//! owns the background tasks until shutdown.

pub mod setup;
