use std::env;
use std::ffi::OsStr;

/// Sets an environment variable for the lifetime of the guard, restoring the previous value
/// (or removing the variable) on drop.
///
/// Configuration constants are read from `MEDIA_UPLOAD_*` variables the first time they are
/// accessed, so tests that exercise them scope the override with one of these and run under
/// `#[serial]`.
///
/// ```no_run
/// use utils::EnvVarGuard;
///
/// let _guard = EnvVarGuard::set("MEDIA_UPLOAD_LOG_FORMAT", "json");
/// ```
pub struct EnvVarGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, value: impl AsRef<OsStr>) -> Self {
        let prev = env::var(key).ok();
        // SAFETY: callers serialize environment mutation (tests run under #[serial]).
        unsafe { env::set_var(key, value) };
        Self { key, prev }
    }

    pub fn remove(key: &'static str) -> Self {
        let prev = env::var(key).ok();
        // SAFETY: see `set`.
        unsafe { env::remove_var(key) };
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // SAFETY: see `set`.
        match self.prev.take() {
            Some(v) => unsafe { env::set_var(self.key, v) },
            None => unsafe { env::remove_var(self.key) },
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial(config_env)]
    fn test_set_restores_previous_value() {
        let key = "MEDIA_UPLOAD_GUARD_TEST_RESTORE";
        let _outer = EnvVarGuard::set(key, "outer");

        {
            let _inner = EnvVarGuard::set(key, "inner");
            assert_eq!(env::var(key).unwrap(), "inner");
        }

        assert_eq!(env::var(key).unwrap(), "outer");
    }

    #[test]
    #[serial(config_env)]
    fn test_set_removes_unset_variable() {
        let key = "MEDIA_UPLOAD_GUARD_TEST_UNSET";
        let _clear = EnvVarGuard::remove(key);

        {
            let _guard = EnvVarGuard::set(key, "1");
            assert_eq!(env::var(key).unwrap(), "1");
        }

        assert!(env::var(key).is_err());
    }

    #[test]
    #[serial(config_env)]
    fn test_remove_restores_value() {
        let key = "MEDIA_UPLOAD_GUARD_TEST_REMOVE";
        let _outer = EnvVarGuard::set(key, "kept");

        {
            let _removed = EnvVarGuard::remove(key);
            assert!(env::var(key).is_err());
        }

        assert_eq!(env::var(key).unwrap(), "kept");
    }
}
