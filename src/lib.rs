//! Workplace celebration assistant: birthday tracking, special-day
//! observances, and thread engagement for a Slack-shaped chat platform.

pub mod canvas;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod engagement;
pub mod error;
pub mod imagegen;
pub mod images;
pub mod llm;
pub mod messages;
pub mod messaging;
pub mod observance;
pub mod ops;
pub mod personality;
pub mod pipeline;
pub mod profile;
pub mod rate_limit;
pub mod scheduler;
pub mod thread_tracker;
pub mod time_model;

use std::sync::Arc;

/// Opaque platform user identifier (Slack member ID).
pub type UserId = Arc<str>;

/// Opaque platform channel identifier.
pub type ChannelId = Arc<str>;

/// A thread root's platform timestamp, used as the thread identity.
pub type ThreadTs = Arc<str>;

/// Calendar month-day pair (1..12, 1..31), independent of year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct MonthDay {
    pub month: u8,
    pub day: u8,
}

impl MonthDay {
    pub fn new(month: u8, day: u8) -> Option<Self> {
        if !(1..=12).contains(&month) {
            return None;
        }
        let max_day = match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 => 29, // Feb 29 is a valid calendar entry independent of leap-year policy.
            _ => unreachable!(),
        };
        if !(1..=max_day).contains(&day) {
            return None;
        }
        Some(Self { month, day })
    }

    /// True for the Feb-29 leap day.
    pub fn is_leap_day(&self) -> bool {
        self.month == 2 && self.day == 29
    }
}

impl std::fmt::Display for MonthDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}/{:02}", self.day, self.month)
    }
}

/// Re-exported top-level result alias.
pub use error::Result;
