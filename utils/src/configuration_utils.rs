use std::str::FromStr;

use tracing::{Level, event, info, warn};

#[cfg(not(feature = "elevated_information_level"))]
pub const INFORMATION_LOG_LEVEL: Level = Level::DEBUG;
#[cfg(feature = "elevated_information_level")]
pub const INFORMATION_LOG_LEVEL: Level = Level::INFO;

/// Controls how a value is parsed from an environment string if it's present.
pub trait ParsableConfigValue: std::fmt::Debug + Sized {
    fn parse_user_value(value: &str) -> Option<Self>;

    /// Parse the value, returning the default if it can't be parsed or isn't set.
    /// Issue a warning if it can't be parsed.
    fn parse(variable_name: &str, value: Option<String>, default: Self) -> Self {
        match value {
            Some(v) => match Self::parse_user_value(&v) {
                Some(v) => {
                    info!("Config: {variable_name} = {v:?} (user set)");
                    v
                },
                None => {
                    warn!(
                        "Configuration value {v} for {variable_name} cannot be parsed into correct type; \
                         reverting to default."
                    );
                    info!("Config: {variable_name} = {default:?} (default due to parse error)");
                    default
                },
            },
            None => {
                event!(INFORMATION_LOG_LEVEL, "Config: {variable_name} = {default:?} (default)");
                default
            },
        }
    }
}

/// Most values work with the FromStr implementation; bool and Option<T> get custom parsing below.
pub trait FromStrParseable: FromStr + std::fmt::Debug {}

impl<T: FromStrParseable> ParsableConfigValue for T {
    fn parse_user_value(value: &str) -> Option<Self> {
        value.trim().parse::<T>().ok()
    }
}

impl FromStrParseable for usize {}
impl FromStrParseable for u32 {}
impl FromStrParseable for u64 {}
impl FromStrParseable for i64 {}
impl FromStrParseable for f64 {}
impl FromStrParseable for String {}

/// - true: "1","true","yes","y","on"
/// - false: "0","false","no","n","off"
fn parse_bool_value(value: &str) -> Option<bool> {
    let t = value.trim().to_ascii_lowercase();

    match t.as_str() {
        "0" | "false" | "no" | "n" | "off" => Some(false),
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        _ => None,
    }
}

impl ParsableConfigValue for bool {
    fn parse_user_value(value: &str) -> Option<Self> {
        parse_bool_value(value)
    }
}

/// Lets the default be None when nothing is set, and Some(value) when the user sets it.
impl<T: ParsableConfigValue> ParsableConfigValue for Option<T> {
    fn parse_user_value(value: &str) -> Option<Self> {
        T::parse_user_value(value).map(Some)
    }
}

// Reexport this so that dependencies don't need lazy_static themselves.
pub use lazy_static::lazy_static;

/// Declares constants that are read once, on first access, from `MEDIA_UPLOAD_<NAME>` in the
/// environment, falling back to the given default.
///
/// # Example
/// ```rust
/// utils::configurable_constants! {
///    /// Minimum spacing between progress notifications.
///    ref NOTIFICATION_SPACING_MS: u64 = 50;
/// }
///
/// assert_eq!(*NOTIFICATION_SPACING_MS, 50);
/// ```
#[macro_export]
macro_rules! configurable_constants {
    ($(
        $(#[$meta:meta])*
        ref $name:ident : $type:ty = $value:expr;
    )+) => {
        $(
            #[allow(unused_imports)]
            use $crate::configuration_utils::*;

            lazy_static! {
                $(#[$meta])*
                pub static ref $name: $type = {
                    let default_value: $type = $value;
                    let maybe_env_value = std::env::var(concat!("MEDIA_UPLOAD_", stringify!($name))).ok();
                    <$type>::parse(stringify!($name), maybe_env_value, default_value)
                };
            }
        )+
    };
}

/// Same as `configurable_constants!`, but the environment is only consulted in debug builds.
#[macro_export]
macro_rules! test_configurable_constants {
    ($(
        $(#[$meta:meta])*
        ref $name:ident : $type:ty = $value:expr;
    )+) => {
        $(
            #[allow(unused_imports)]
            use $crate::configuration_utils::*;

            lazy_static! {
                $(#[$meta])*
                pub static ref $name: $type = {
                    #[cfg(debug_assertions)]
                    {
                        let default_value: $type = $value;
                        let maybe_env_value = std::env::var(concat!("MEDIA_UPLOAD_", stringify!($name))).ok();
                        <$type>::parse(stringify!($name), maybe_env_value, default_value)
                    }
                    #[cfg(not(debug_assertions))]
                    {
                        $value
                    }
                };
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::EnvVarGuard;

    #[test]
    fn test_bool_parsing() {
        for v in ["1", "true", "YES", " y ", "On"] {
            assert_eq!(bool::parse_user_value(v), Some(true), "{v}");
        }
        for v in ["0", "false", "No", "n", "OFF"] {
            assert_eq!(bool::parse_user_value(v), Some(false), "{v}");
        }
        assert_eq!(bool::parse_user_value("maybe"), None);
        assert_eq!(bool::parse_user_value(""), None);
    }

    #[test]
    fn test_parse_falls_back_to_default() {
        assert_eq!(u64::parse("X", Some("not-a-number".to_owned()), 7), 7);
        assert_eq!(u64::parse("X", None, 7), 7);
        assert_eq!(u64::parse("X", Some(" 12 ".to_owned()), 7), 12);
    }

    #[test]
    fn test_option_parsing() {
        assert_eq!(Option::<String>::parse("X", None, None), None);
        assert_eq!(Option::<String>::parse("X", Some("json".to_owned()), None), Some("json".to_owned()));
        assert_eq!(Option::<u32>::parse("X", Some("abc".to_owned()), Some(3)), Some(3));
    }

    configurable_constants! {
        ref CONFIG_UTILS_TEST_VALUE: u64 = 5;
        ref CONFIG_UTILS_TEST_FLAG: bool = false;
    }

    #[test]
    #[serial(config_env)]
    fn test_constants_read_from_environment() {
        let _value = EnvVarGuard::set("MEDIA_UPLOAD_CONFIG_UTILS_TEST_VALUE", "42");
        let _flag = EnvVarGuard::set("MEDIA_UPLOAD_CONFIG_UTILS_TEST_FLAG", "yes");

        assert_eq!(*CONFIG_UTILS_TEST_VALUE, 42);
        assert!(*CONFIG_UTILS_TEST_FLAG);
    }

    test_configurable_constants! {
        ref CONFIG_UTILS_DEBUG_ONLY_VALUE: usize = 3;
    }

    #[test]
    #[serial(config_env)]
    fn test_debug_only_constants() {
        let _value = EnvVarGuard::set("MEDIA_UPLOAD_CONFIG_UTILS_DEBUG_ONLY_VALUE", "9");

        let expected = if cfg!(debug_assertions) { 9 } else { 3 };
        assert_eq!(*CONFIG_UTILS_DEBUG_ONLY_VALUE, expected);
    }
}
