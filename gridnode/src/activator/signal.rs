/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Platform-neutral signal names.
//!
//! Administrators name signals the POSIX way (`SIGTERM`, `SIGHUP`, ...)
//! or by raw number. Each target maps the names it supports to OS
//! numbers; Windows only supports `SIGTERM` (delivered as Ctrl-Break)
//! and `SIGKILL` (process termination).

use std::str::FromStr;

use strum::IntoEnumIterator;

/// Errors produced when parsing or mapping a signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signal `{0}`")]
    Unknown(String),

    #[error("signal {0} is not supported on this platform")]
    Unsupported(Signal),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter
)]
pub enum Signal {
    #[strum(serialize = "SIGHUP")]
    Hup,
    #[strum(serialize = "SIGINT")]
    Int,
    #[strum(serialize = "SIGQUIT")]
    Quit,
    #[strum(serialize = "SIGILL")]
    Ill,
    #[strum(serialize = "SIGTRAP")]
    Trap,
    #[strum(serialize = "SIGABRT")]
    Abrt,
    #[strum(serialize = "SIGBUS")]
    Bus,
    #[strum(serialize = "SIGFPE")]
    Fpe,
    #[strum(serialize = "SIGKILL")]
    Kill,
    #[strum(serialize = "SIGUSR1")]
    Usr1,
    #[strum(serialize = "SIGSEGV")]
    Segv,
    #[strum(serialize = "SIGUSR2")]
    Usr2,
    #[strum(serialize = "SIGPIPE")]
    Pipe,
    #[strum(serialize = "SIGALRM")]
    Alrm,
    #[strum(serialize = "SIGTERM")]
    Term,
    #[strum(serialize = "SIGCHLD")]
    Chld,
    #[strum(serialize = "SIGCONT")]
    Cont,
    #[strum(serialize = "SIGSTOP")]
    Stop,
    #[strum(serialize = "SIGTSTP")]
    Tstp,
    #[strum(serialize = "SIGTTIN")]
    Ttin,
    #[strum(serialize = "SIGTTOU")]
    Ttou,
}

impl Signal {
    /// The OS signal number, if this platform supports the signal.
    #[cfg(unix)]
    pub fn number(self) -> Option<i32> {
        Some(match self {
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Ill => libc::SIGILL,
            Self::Trap => libc::SIGTRAP,
            Self::Abrt => libc::SIGABRT,
            Self::Bus => libc::SIGBUS,
            Self::Fpe => libc::SIGFPE,
            Self::Kill => libc::SIGKILL,
            Self::Usr1 => libc::SIGUSR1,
            Self::Segv => libc::SIGSEGV,
            Self::Usr2 => libc::SIGUSR2,
            Self::Pipe => libc::SIGPIPE,
            Self::Alrm => libc::SIGALRM,
            Self::Term => libc::SIGTERM,
            Self::Chld => libc::SIGCHLD,
            Self::Cont => libc::SIGCONT,
            Self::Stop => libc::SIGSTOP,
            Self::Tstp => libc::SIGTSTP,
            Self::Ttin => libc::SIGTTIN,
            Self::Ttou => libc::SIGTTOU,
        })
    }

    #[cfg(windows)]
    pub fn number(self) -> Option<i32> {
        match self {
            Self::Term => Some(15),
            Self::Kill => Some(9),
            _ => None,
        }
    }

    /// Look up a signal by OS number.
    pub fn from_number(number: i32) -> Option<Self> {
        Self::iter().find(|s| s.number() == Some(number))
    }

    /// Parse a signal name (`SIGTERM`) or a raw number (`15`).
    pub fn parse(name: &str) -> Result<Self, SignalError> {
        let name = name.trim();
        let signal = match name.parse::<i32>() {
            Ok(n) if n > 0 => Self::from_number(n),
            Ok(_) => None,
            Err(_) => Signal::from_str(name).ok(),
        }
        .ok_or_else(|| SignalError::Unknown(name.to_string()))?;
        if signal.number().is_none() {
            return Err(SignalError::Unsupported(signal));
        }
        Ok(signal)
    }

    /// Signals that indicate the process crashed.
    pub fn is_crash(self) -> bool {
        matches!(
            self,
            Self::Abrt | Self::Ill | Self::Bus | Self::Fpe | Self::Segv
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(Signal::parse("SIGTERM").unwrap(), Signal::Term);
        assert_eq!(Signal::parse(" SIGKILL ").unwrap(), Signal::Kill);
        assert_eq!(Signal::Term.to_string(), "SIGTERM");
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            Signal::parse("SIGFOO"),
            Err(SignalError::Unknown("SIGFOO".to_string()))
        );
        assert!(matches!(Signal::parse("0"), Err(SignalError::Unknown(_))));
        assert!(matches!(Signal::parse("-9"), Err(SignalError::Unknown(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_numbers() {
        assert_eq!(Signal::parse("9").unwrap(), Signal::Kill);
        assert_eq!(
            Signal::parse(&libc::SIGHUP.to_string()).unwrap(),
            Signal::Hup
        );
        assert!(Signal::parse("1000").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_table_round_trip() {
        for signal in Signal::iter() {
            let n = signal.number().unwrap();
            assert_eq!(Signal::from_number(n), Some(signal));
        }
    }
}
