//! Runtime configuration for a [`DeviceContext`](crate::device::DeviceContext).
//!
//! Every knob has a sensible default and can be overridden from the
//! environment with [`ContextConfig::from_env`]:
//!
//! | Variable | Field |
//! |---|---|
//! | `WMATRIX_BACKEND` | [`backend`](ContextConfig::backend) (`cpu` or `wgpu`) |
//! | `WMATRIX_QUEUES` | [`queues`](ContextConfig::queues) |
//! | `WMATRIX_MAX_RELEASE_RETRIES` | [`max_release_retries`](ContextConfig::max_release_retries) |
//! | `WMATRIX_RELEASE_BACKOFF_US` | [`release_backoff`](ContextConfig::release_backoff) |
//! | `WMATRIX_TILE_THRESHOLD` | [`tile_threshold`](ContextConfig::tile_threshold) |
//! | `WMATRIX_MEMORY_LIMIT` | [`memory_limit`](ContextConfig::memory_limit) |

use core::time::Duration;

use tracing::warn;

use crate::backend::BackendKind;

/// Settings applied when a context is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Backend used by [`DeviceContext::from_config`](crate::device::DeviceContext::from_config).
    pub backend: BackendKind,
    /// Number of independent command queues the CPU backend runs.
    pub queues: usize,
    /// Caps how often a busy buffer release is retried. `None` retries until it succeeds.
    pub max_release_retries: Option<u32>,
    /// Base pause between two release attempts of the same buffer.
    pub release_backoff: Duration,
    /// Smallest dimension for which the tiled GEMM partitions its operands.
    pub tile_threshold: usize,
    /// Simulated device memory for the CPU backend, in bytes.
    pub memory_limit: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cpu,
            queues: 2,
            max_release_retries: None,
            release_backoff: Duration::from_micros(50),
            tile_threshold: 64,
            memory_limit: None,
        }
    }
}

impl ContextConfig {
    /// Builds a configuration from the defaults, overridden by `WMATRIX_*`
    /// environment variables. Unparsable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(lookup);
        let mut cfg = Self::default();

        if let Some(kind) = env.parse("WMATRIX_BACKEND") {
            cfg.backend = kind;
        }
        if let Some(queues) = env.parse::<usize>("WMATRIX_QUEUES") {
            cfg.queues = queues.max(1);
        }
        if let Some(raw) = env.var("WMATRIX_MAX_RELEASE_RETRIES") {
            match raw.as_str() {
                "" | "none" | "unbounded" => cfg.max_release_retries = None,
                other => match other.parse() {
                    Ok(retries) => cfg.max_release_retries = Some(retries),
                    Err(_) => unparsable("WMATRIX_MAX_RELEASE_RETRIES", other),
                },
            }
        }
        if let Some(us) = env.parse::<u64>("WMATRIX_RELEASE_BACKOFF_US") {
            cfg.release_backoff = Duration::from_micros(us);
        }
        if let Some(threshold) = env.parse::<usize>("WMATRIX_TILE_THRESHOLD") {
            cfg.tile_threshold = threshold;
        }
        if let Some(limit) = env.parse::<usize>("WMATRIX_MEMORY_LIMIT") {
            cfg.memory_limit = Some(limit);
        }

        cfg
    }

    /// Selects the backend.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the number of CPU command queues (at least one).
    #[must_use]
    pub fn with_queues(mut self, queues: usize) -> Self {
        self.queues = queues.max(1);
        self
    }

    /// Caps release retries.
    #[must_use]
    pub const fn with_max_release_retries(mut self, retries: Option<u32>) -> Self {
        self.max_release_retries = retries;
        self
    }

    /// Sets the pause between release retries.
    #[must_use]
    pub const fn with_release_backoff(mut self, backoff: Duration) -> Self {
        self.release_backoff = backoff;
        self
    }

    /// Sets the tiled GEMM threshold.
    #[must_use]
    pub const fn with_tile_threshold(mut self, threshold: usize) -> Self {
        self.tile_threshold = threshold;
        self
    }

    /// Limits simulated CPU device memory.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn var(&self, name: &str) -> Option<String> {
        (self.0)(name).map(|v| v.trim().to_ascii_lowercase())
    }

    fn parse<T: core::str::FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.var(name)?;
        let parsed = raw.parse().ok();
        if parsed.is_none() {
            unparsable(name, &raw);
        }
        parsed
    }
}

fn unparsable(name: &str, raw: &str) {
    warn!(variable = name, value = raw, "ignoring unparsable setting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[test]
    fn defaults_retry_forever_on_two_queues() {
        let cfg = ContextConfig::default();
        assert_eq!(cfg.queues, 2);
        assert_eq!(cfg.max_release_retries, None);
        assert_eq!(cfg.backend, BackendKind::Cpu);
    }

    #[test]
    fn builder_clamps_queue_count() {
        let cfg = ContextConfig::default()
            .with_queues(0)
            .with_max_release_retries(Some(3));
        assert_eq!(cfg.queues, 1);
        assert_eq!(cfg.max_release_retries, Some(3));
    }

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_owned())
        }
    }

    #[test]
    fn environment_overrides_defaults() {
        let cfg = ContextConfig::from_lookup(lookup(&[
            ("WMATRIX_BACKEND", " GPU "),
            ("WMATRIX_QUEUES", "0"),
            ("WMATRIX_MAX_RELEASE_RETRIES", "5"),
            ("WMATRIX_TILE_THRESHOLD", "128"),
        ]));
        assert_eq!(cfg.backend, BackendKind::Wgpu);
        assert_eq!(cfg.queues, 1);
        assert_eq!(cfg.max_release_retries, Some(5));
        assert_eq!(cfg.tile_threshold, 128);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unparsable_values_warn_and_keep_defaults() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let cfg = tracing::subscriber::with_default(subscriber, || {
            ContextConfig::from_lookup(lookup(&[
                ("WMATRIX_BACKEND", "tpu"),
                ("WMATRIX_MAX_RELEASE_RETRIES", "forever"),
                ("WMATRIX_QUEUES", "many"),
            ]))
        });
        let defaults = ContextConfig::default();
        assert_eq!(cfg.backend, defaults.backend);
        assert_eq!(cfg.max_release_retries, defaults.max_release_retries);
        assert_eq!(cfg.queues, defaults.queues);

        let log = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        for name in ["WMATRIX_BACKEND", "WMATRIX_MAX_RELEASE_RETRIES", "WMATRIX_QUEUES"] {
            assert!(log.contains(name), "no warning for {name}: {log}");
        }
        assert_eq!(log.matches("WARN").count(), 3);
    }
}
