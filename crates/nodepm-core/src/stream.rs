//! Leveled output lines and terminal records produced by every process kind.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output classifier. Tells a consumer how to interpret a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Level {
    Stdout,
    Stderr,
    Public,
    Operator,
    Unknown,
    Structure,
    Warning,
    OpsError,
    Critical,
    Statsd,
    Debug,
    ResultJson,
    ResultYaml,
    ResultToml,
    ResultHrd,
    ResultJob,
}

impl Level {
    pub fn code(self) -> u16 {
        match self {
            Level::Stdout => 1,
            Level::Stderr => 2,
            Level::Public => 3,
            Level::Operator => 4,
            Level::Unknown => 5,
            Level::Structure => 6,
            Level::Warning => 7,
            Level::OpsError => 8,
            Level::Critical => 9,
            Level::Statsd => 10,
            Level::Debug => 11,
            Level::ResultJson => 20,
            Level::ResultYaml => 21,
            Level::ResultToml => 22,
            Level::ResultHrd => 23,
            Level::ResultJob => 30,
        }
    }
}

impl From<Level> for u16 {
    fn from(level: Level) -> Self {
        level.code()
    }
}

impl TryFrom<u16> for Level {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        let level = match code {
            1 => Level::Stdout,
            2 => Level::Stderr,
            3 => Level::Public,
            4 => Level::Operator,
            5 => Level::Unknown,
            6 => Level::Structure,
            7 => Level::Warning,
            8 => Level::OpsError,
            9 => Level::Critical,
            10 => Level::Statsd,
            11 => Level::Debug,
            20 => Level::ResultJson,
            21 => Level::ResultYaml,
            22 => Level::ResultToml,
            23 => Level::ResultHrd,
            30 => Level::ResultJob,
            other => return Err(format!("unknown message level {other}")),
        };
        Ok(level)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Flags: u16 {
        const EXIT_SUCCESS = 1 << 0;
        const EXIT_ERROR = 1 << 1;
        const STREAM = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    level: Level,
    flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<u32>,
}

impl Meta {
    pub fn new(level: Level, flags: Flags) -> Self {
        Self {
            level,
            flags,
            code: None,
        }
    }

    pub fn with_code(code: u32, level: Level, flags: Flags) -> Self {
        Self {
            level,
            flags,
            code: Some(code),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn code(&self) -> Option<u32> {
        self.code
    }

    /// True if every bit of `flag` is set.
    pub fn is(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set(&mut self, flag: Flags) {
        self.flags.insert(flag);
    }

    pub fn is_terminal(&self) -> bool {
        self.flags.intersects(Flags::EXIT_SUCCESS | Flags::EXIT_ERROR)
    }
}

/// One line of process output, or the terminal record closing a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub meta: Meta,
    pub message: String,
}

impl Message {
    pub fn new(meta: Meta, message: impl Into<String>) -> Self {
        Self {
            meta,
            message: message.into(),
        }
    }

    pub fn line(level: Level, message: impl Into<String>) -> Self {
        Self::new(Meta::new(level, Flags::empty()), message)
    }

    pub fn exit_success(level: Level, message: impl Into<String>) -> Self {
        Self::new(Meta::with_code(0, level, Flags::EXIT_SUCCESS), message)
    }

    pub fn exit_error(code: Option<u32>, level: Level, message: impl Into<String>) -> Self {
        let meta = match code {
            Some(code) => Meta::with_code(code, level, Flags::EXIT_ERROR),
            None => Meta::new(level, Flags::EXIT_ERROR),
        };
        Self::new(meta, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.meta.is_terminal()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:::{}", self.meta.level.code(), self.message)
    }
}

/// Receiving half of a process output stream. Closed after the terminal message.
pub type MessageStream = tokio::sync::mpsc::Receiver<Message>;
