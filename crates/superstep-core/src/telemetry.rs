// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber initialization for worker processes and tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! superstep_core::telemetry::init_subscriber();
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: `info`)

/// Install a fmt subscriber writing to stderr, filtered by `RUST_LOG`.
///
/// Returns `false` when a global subscriber was already installed, which
/// makes the call safe to repeat (every test may call it).
pub fn init_subscriber() -> bool {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::Registry::default()
        .with(fmt)
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_subscriber_is_repeatable() {
        init_subscriber();
        assert!(!init_subscriber());
    }
}
