//! Priority bands for scheduled work

use serde::{Deserialize, Serialize};

/// Priority band carried by every scheduled unit of work.
///
/// Bands are ordered: `Background < Low < Medium < High < UserInitiated`.
/// A task's priority may be elevated while it is pending or executing, but it
/// never decreases until the task finishes or is re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Priority {
    Background,
    #[default]
    Low,
    Medium,
    High,
    UserInitiated,
}

impl Priority {
    /// Reconstruct a priority from its `repr(u8)` discriminant.
    ///
    /// Out-of-range values clamp to the highest band; they can only come from
    /// a corrupted atomic cell, which we treat as an elevated task.
    pub(crate) fn from_repr(value: u8) -> Self {
        match value {
            0 => Self::Background,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::UserInitiated,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::UserInitiated => write!(f, "user-initiated"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "user-initiated" | "userinitiated" => Ok(Self::UserInitiated),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_PRIORITIES: [Priority; 5] = [
        Priority::Background,
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::UserInitiated,
    ];

    fn any_priority() -> impl Strategy<Value = Priority> {
        proptest::sample::select(ALL_PRIORITIES.to_vec())
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Background < Priority::Low);
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::UserInitiated);
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::Background.to_string(), "background");
        assert_eq!(Priority::Low.to_string(), "low");
        assert_eq!(Priority::Medium.to_string(), "medium");
        assert_eq!(Priority::High.to_string(), "high");
        assert_eq!(Priority::UserInitiated.to_string(), "user-initiated");
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("user-initiated".parse::<Priority>().unwrap(), Priority::UserInitiated);
        assert!("invalid".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serde() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"high\"");

        let priority: Priority = serde_json::from_str("\"user-initiated\"").unwrap();
        assert_eq!(priority, Priority::UserInitiated);
    }

    proptest! {
        #[test]
        fn prop_ordering_agrees_with_discriminants(a in any_priority(), b in any_priority()) {
            prop_assert_eq!(a.cmp(&b), (a as u8).cmp(&(b as u8)));
        }

        #[test]
        fn prop_repr_round_trips(priority in any_priority()) {
            prop_assert_eq!(Priority::from_repr(priority as u8), priority);
        }
    }
}
