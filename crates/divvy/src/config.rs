use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Number of worker slots in the pool. At least 1.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(into = "u32", try_from = "u32")]
pub struct Slots(u32);

impl Slots {
    pub fn into_inner(self) -> u32 {
        self.0
    }
}

impl Default for Slots {
    fn default() -> Self {
        Slots(1)
    }
}

impl TryFrom<u32> for Slots {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value < 1 {
            Err("slot count must be at least 1".to_string())
        } else {
            Ok(Slots(value))
        }
    }
}

impl From<Slots> for u32 {
    fn from(slots: Slots) -> u32 {
        slots.0
    }
}

impl FromStr for Slots {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value
            .parse::<u32>()
            .map_err(|err| format!("slot count: {err}"))?;
        Self::try_from(value)
    }
}

impl fmt::Display for Slots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Minimum log level to output.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_slog_level(self) -> slog::Level {
        match self {
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(format!("unknown log level `{value}`")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.pad(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_from_str() {
        assert_eq!("5".parse::<Slots>().unwrap(), Slots(5));
        assert_eq!(
            "0".parse::<Slots>().unwrap_err(),
            "slot count must be at least 1"
        );
        assert!("x".parse::<Slots>().unwrap_err().starts_with("slot count:"));
    }

    #[test]
    fn slots_deserialize_rejects_zero() {
        assert_eq!(serde_json::from_str::<Slots>("3").unwrap(), Slots(3));
        assert!(serde_json::from_str::<Slots>("0").is_err());
    }

    #[test]
    fn slots_default_is_one() {
        assert_eq!(Slots::default(), Slots(1));
    }

    #[test]
    fn log_level_round_trip() {
        for level in [
            LogLevel::Error,
            LogLevel::Warning,
            LogLevel::Info,
            LogLevel::Debug,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
        assert_eq!(
            "verbose".parse::<LogLevel>().unwrap_err(),
            "unknown log level `verbose`"
        );
    }
}
