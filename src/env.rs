//! Runtime environment for the client, read from `STYLESTREAM_ENV`.
//!
//! | value                  | effect                                          |
//! |------------------------|-------------------------------------------------|
//! | `test`                 | file-backed credentials, temp config directory  |
//! | `development` / `dev`  | `debug` default log filter                      |
//! | anything else, unset   | production                                      |
//!
//! Headless hosts without a secret service can also set
//! `STYLESTREAM_NO_KEYRING=1` to keep the API key in the config directory.

/// Selects the [`Environment`].
pub const ENV_VAR: &str = "STYLESTREAM_ENV";

/// Forces file-backed credentials outside test mode.
pub const NO_KEYRING_VAR: &str = "STYLESTREAM_NO_KEYRING";

/// Where the client is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Normal installs.
    #[default]
    Production,
    /// Local development against a dev server.
    Development,
    /// Automated tests.
    Test,
}

impl Environment {
    /// Read `STYLESTREAM_ENV`.
    #[must_use]
    pub fn current() -> Self {
        std::env::var(ENV_VAR)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Self {
        match value.trim() {
            "test" => Self::Test,
            "development" | "dev" => Self::Development,
            _ => Self::Production,
        }
    }

    /// `true` under automated tests.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Log filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production | Self::Test => "info",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Test => "test",
        })
    }
}

/// Shorthand for `Environment::current().is_test()`.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

/// Whether credentials bypass the OS keyring for a file in the config dir.
#[must_use]
pub fn should_skip_keyring() -> bool {
    is_test_mode() || std::env::var(NO_KEYRING_VAR).is_ok_and(|v| v == "1" || v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Environment::parse("test"), Environment::Test);
        assert_eq!(Environment::parse(" dev "), Environment::Development);
        assert_eq!(Environment::parse("development"), Environment::Development);
        assert_eq!(Environment::parse("staging"), Environment::Production);
        assert_eq!(Environment::parse(""), Environment::Production);
    }

    #[test]
    fn test_default_log_filter() {
        assert_eq!(Environment::Development.default_log_filter(), "debug");
        assert_eq!(Environment::Production.default_log_filter(), "info");
    }

    #[test]
    fn test_display() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::default().to_string(), "production");
    }
}
