//! Common types used throughout Lifetrack.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A functional area of the application with its own sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Dashboard,
    Finance,
    Health,
    Calendar,
    Nutrition,
    Habits,
}

impl Domain {
    /// Every known domain, in display order.
    pub const ALL: [Domain; 6] = [
        Domain::Dashboard,
        Domain::Finance,
        Domain::Health,
        Domain::Calendar,
        Domain::Nutrition,
        Domain::Habits,
    ];

    /// Get the stable name of this domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Dashboard => "dashboard",
            Domain::Finance => "finance",
            Domain::Health => "health",
            Domain::Calendar => "calendar",
            Domain::Nutrition => "nutrition",
            Domain::Habits => "habits",
        }
    }

    /// Read endpoint used when no override is configured.
    pub fn default_endpoint(&self) -> String {
        format!("/api/v1/{}", self.as_str())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown domain: {}", s)))
    }
}

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Get the method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether the method mutates server state.
    pub fn is_write(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a deferred write operation.
///
/// Stored alongside the opaque payload so a queued operation can be
/// described to the user and grouped for ordered replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FoodLog,
    Transaction,
    Income,
    HabitCheckIn,
    WorkoutLog,
    CalendarEvent,
    Other(String),
}

impl OperationKind {
    /// Get a stable label for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::FoodLog => "food_log",
            OperationKind::Transaction => "transaction",
            OperationKind::Income => "income",
            OperationKind::HabitCheckIn => "habit_check_in",
            OperationKind::WorkoutLog => "workout_log",
            OperationKind::CalendarEvent => "calendar_event",
            OperationKind::Other(name) => name,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
