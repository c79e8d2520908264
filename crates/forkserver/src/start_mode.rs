// crates/forkserver/src/start_mode.rs
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use crate::error::ConfigError;

/// Triggers that may start the global fork server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartMode {
    /// Lazily, on the first operation that needs the helper.
    OnDemand = 0,
}

impl StartMode {
    pub const ALL: [StartMode; 1] = [StartMode::OnDemand];

    pub const fn name(self) -> &'static str {
        match self {
            StartMode::OnDemand => "ondemand",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Immutable set of permitted start triggers. Empty means "never
/// auto-start"; that is also how it prints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartModeSet(u8);

impl StartModeSet {
    pub const EMPTY: StartModeSet = StartModeSet(0);

    pub fn contains(self, mode: StartMode) -> bool {
        self.0 & mode.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<StartMode> for StartModeSet {
    fn from(mode: StartMode) -> Self {
        StartModeSet(mode.bit())
    }
}

impl BitOr<StartMode> for StartModeSet {
    type Output = StartModeSet;

    fn bitor(self, mode: StartMode) -> StartModeSet {
        StartModeSet(self.0 | mode.bit())
    }
}

impl FromStr for StartModeSet {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text == "never" {
            return Ok(StartModeSet::EMPTY);
        }
        let mut set = StartModeSet::EMPTY;
        for token in text.split(',') {
            let token = token.trim();
            match token {
                "ondemand" => set = set | StartMode::OnDemand,
                other => return Err(ConfigError::InvalidMode(other.to_string())),
            }
        }
        Ok(set)
    }
}

impl fmt::Display for StartModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("never");
        }
        let mut first = true;
        for mode in StartMode::ALL {
            if self.contains(mode) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(mode.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Pre-flight check for a start-mode string. Logs the parse error and
/// returns false on invalid input.
pub fn validate(text: &str) -> bool {
    match text.parse::<StartModeSet>() {
        Ok(_) => true,
        Err(err) => {
            tracing::error!("{err}");
            false
        }
    }
}
