#![cfg_attr(feature = "strict", deny(warnings))]

pub mod configuration_utils;
pub use configuration_utils::ParsableConfigValue;

mod guards;
pub use guards::EnvVarGuard;

// configurable_constants! and test_configurable_constants! are exported at the crate root via #[macro_export].
