//! Test-only helpers shared across the workspace: one-time logging setup,
//! scratch directories, and (behind `future_timeout`) an async timeout
//! combinator for tests that must not hang CI forever.
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

#[cfg(feature = "future_timeout")]
pub mod timeout;

use std::sync::Once;

static LOG_SETUP: Once = Once::new();

/// Initialize a `tracing` subscriber from `RUST_LOG` (or `debug` if unset),
/// once per process. Call at the top of any test that wants to see log
/// output; safe to call from every test in a module, only the first call
/// does anything.
pub fn maybe_start_logging() {
    LOG_SETUP.call_once(|| {
        let _ = dotenvy::dotenv();
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// A fresh temporary directory that is removed when the returned guard is
/// dropped.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    tempfile::tempdir()
}

/// Assert that two `f64`s are within `eps` of each other, printing both on
/// failure. Plain `assert_eq!` on floats derived from the same arithmetic
/// in different orders (mapper/reducer associativity tests, in
/// particular) is too strict.
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $eps:expr) => {{
        let (l, r, eps) = (&$left, &$right, $eps);
        assert!(
            (l - r).abs() <= eps,
            "assertion failed: `(left ~= right)`\n  left: `{:?}`\n right: `{:?}`\n   eps: `{:?}`",
            l,
            r,
            eps
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_eq_within_epsilon() {
        assert_approx_eq!(1.0001_f64, 1.0002_f64, 1e-3);
    }

    #[test]
    #[should_panic]
    fn approx_eq_outside_epsilon_panics() {
        assert_approx_eq!(1.0_f64, 2.0_f64, 1e-3);
    }

    #[test]
    fn tmp_dir_creates_and_cleans_up() {
        let dir = tmp_dir().unwrap();
        assert!(dir.path().exists());
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!path.exists());
    }
}
