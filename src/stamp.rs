//! Module implement the session time codec.
//!
//! Session times are seconds since UNIX epoch. On disk they appear as
//! w3 datetime strings in local time, `%Y-%m-%dT%H:%M:%S±hh:mm`. Some
//! destination filesystems reject `:` in file names, in which case the
//! compatible form replaces every `:` with `-`. The parser accepts both
//! forms at all times, regardless of which form the writer emits.

use chrono::{DateTime, FixedOffset, Local, TimeZone};

use std::{convert::TryFrom, fmt, result};

use crate::{Error, Result};

/// A session timestamp, seconds since UNIX epoch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionTime(pub i64);

impl SessionTime {
    /// Current wall-clock time, truncated to seconds.
    pub fn now() -> SessionTime {
        SessionTime(Local::now().timestamp())
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    /// Render the timestamp as used in file names. `compatible` picks
    /// the `-`-for-`:` form.
    pub fn to_string_with(&self, compatible: bool) -> String {
        let dt = Local.timestamp(self.0, 0);
        let s = dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string();
        if compatible {
            s.replace(':', "-")
        } else {
            s
        }
    }
}

impl fmt::Display for SessionTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self.to_string_with(false))
    }
}

impl TryFrom<&str> for SessionTime {
    type Error = Error;

    fn try_from(text: &str) -> Result<SessionTime> {
        // normalize the compatible form back to w3 before parsing; the
        // date part always uses `-`, so only positions after the `T`
        // are rewritten.
        let text = match text.find('T') {
            Some(n) => {
                let (date, time) = text.split_at(n);
                format!("{}{}", date, normalize_time_part(time)?)
            }
            None => err_at!(ParsingError, msg: "no time part in {:?}", text)?,
        };

        let dt: DateTime<FixedOffset> =
            err_at!(ParsingError, DateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%:z"))?;
        Ok(SessionTime(dt.timestamp()))
    }
}

impl TryFrom<&[u8]> for SessionTime {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<SessionTime> {
        let text = err_at!(ParsingError, std::str::from_utf8(bytes))?;
        SessionTime::try_from(text)
    }
}

// `time` is the `T...` tail, like "T04-22-01-07-00" or "T04:22:01-07:00".
// Rebuild it as "T04:22:01-07:00".
fn normalize_time_part(time: &str) -> Result<String> {
    let b = time.as_bytes();
    if b.len() != 15 {
        err_at!(ParsingError, msg: "bad time part {:?}", time)?
    }
    for (i, sep) in [(3, true), (6, true), (9, false), (12, true)].iter() {
        let ok = match (b[*i], sep) {
            (b':', true) | (b'-', true) => true,
            (b'+', false) | (b'-', false) => true,
            _ => false,
        };
        if !ok {
            err_at!(ParsingError, msg: "bad time part {:?}", time)?
        }
    }

    let mut s = String::with_capacity(15);
    s.push('T');
    s.push_str(&time[1..3]);
    s.push(':');
    s.push_str(&time[4..6]);
    s.push(':');
    s.push_str(&time[7..9]);
    s.push_str(&time[9..10]); // zone sign
    s.push_str(&time[10..12]);
    s.push(':');
    s.push_str(&time[13..15]);
    Ok(s)
}

#[cfg(test)]
#[path = "stamp_test.rs"]
mod stamp_test;
