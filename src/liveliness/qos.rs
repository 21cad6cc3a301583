//! QoS profile and its key-expression encoding.
//!
//! ```text
//! <reliability>:<durability>:<history>,<depth>:<deadline_s>,<deadline_ns>:<lifespan_s>,<lifespan_ns>:<liveliness>,<lease_s>,<lease_ns>
//! ```
//!
//! Enum values use the numbering of `rmw/types.h`. An empty field decodes to
//! the default for that position.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::TokenError;

/// History policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum History {
    /// Let the middleware decide.
    SystemDefault,
    /// Keep at most `depth` samples.
    #[default]
    KeepLast,
    /// Keep everything, bounded only by resources.
    KeepAll,
}

/// Reliability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// Let the middleware decide.
    SystemDefault,
    /// Retransmit until delivered.
    #[default]
    Reliable,
    /// Deliver at most once, no retransmission.
    BestEffort,
}

/// Durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Durability {
    /// Let the middleware decide.
    SystemDefault,
    /// Replay the last samples to late joiners.
    TransientLocal,
    /// No replay.
    #[default]
    Volatile,
}

/// Liveliness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Liveliness {
    /// Let the middleware decide.
    SystemDefault,
    /// Asserted by the middleware.
    #[default]
    Automatic,
    /// Asserted by the user per topic.
    ManualByTopic,
}

macro_rules! qos_codes {
    ($ty:ident { $($variant:ident = $code:expr),+ $(,)? }) => {
        impl $ty {
            fn code(self) -> u8 {
                match self {
                    $($ty::$variant => $code,)+
                }
            }

            fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

qos_codes!(History { SystemDefault = 0, KeepLast = 1, KeepAll = 2 });
qos_codes!(Reliability { SystemDefault = 0, Reliable = 1, BestEffort = 2 });
qos_codes!(Durability { SystemDefault = 0, TransientLocal = 1, Volatile = 2 });
qos_codes!(Liveliness { SystemDefault = 0, Automatic = 1, ManualByTopic = 3 });

/// QoS profile attached to every topic and service endpoint.
///
/// A zero duration means "unspecified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QosProfile {
    /// History policy.
    pub history: History,
    /// Queue depth for [`History::KeepLast`].
    pub depth: usize,
    /// Reliability policy.
    pub reliability: Reliability,
    /// Durability policy.
    pub durability: Durability,
    /// Expected maximum period between samples.
    pub deadline: Duration,
    /// Age after which samples are discarded.
    pub lifespan: Duration,
    /// Liveliness policy.
    pub liveliness: Liveliness,
    /// Lease duration for liveliness assertions.
    pub liveliness_lease_duration: Duration,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            history: History::KeepLast,
            depth: 10,
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            deadline: Duration::ZERO,
            lifespan: Duration::ZERO,
            liveliness: Liveliness::Automatic,
            liveliness_lease_duration: Duration::ZERO,
        }
    }
}

impl QosProfile {
    /// Profile used for services and clients unless overridden.
    pub fn services_default() -> Self {
        Self::default()
    }

    /// Set history to keep-last with the given depth.
    pub fn keep_last(mut self, depth: usize) -> Self {
        self.history = History::KeepLast;
        self.depth = depth;
        self
    }

    /// Set history to keep-all.
    pub fn keep_all(mut self) -> Self {
        self.history = History::KeepAll;
        self
    }

    /// Set the reliability policy.
    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Set the durability policy.
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Maximum number of queued items, or `None` when unbounded.
    pub fn queue_bound(&self) -> Option<usize> {
        match self.history {
            History::KeepAll => None,
            History::KeepLast | History::SystemDefault => Some(self.depth),
        }
    }
}

fn fmt_duration(d: Duration) -> String {
    format!("{},{}", d.as_secs(), d.subsec_nanos())
}

impl fmt::Display for QosProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{},{}:{}:{}:{},{}",
            self.reliability.code(),
            self.durability.code(),
            self.history.code(),
            self.depth,
            fmt_duration(self.deadline),
            fmt_duration(self.lifespan),
            self.liveliness.code(),
            fmt_duration(self.liveliness_lease_duration),
        )
    }
}

fn invalid(value: &str) -> TokenError {
    TokenError::InvalidField {
        field: "qos",
        value: value.to_string(),
    }
}

fn parse_or<T: FromStr>(part: &str, default: T, whole: &str) -> Result<T, TokenError> {
    if part.is_empty() {
        return Ok(default);
    }
    part.parse().map_err(|_| invalid(whole))
}

fn parse_code<T>(
    part: &str,
    default: T,
    from_code: fn(u8) -> Option<T>,
    whole: &str,
) -> Result<T, TokenError> {
    if part.is_empty() {
        return Ok(default);
    }
    part.parse::<u8>()
        .ok()
        .and_then(from_code)
        .ok_or_else(|| invalid(whole))
}

fn parse_duration(secs: &str, nanos: &str, whole: &str) -> Result<Duration, TokenError> {
    let secs: u64 = parse_or(secs, 0, whole)?;
    let nanos: u32 = parse_or(nanos, 0, whole)?;
    if nanos >= 1_000_000_000 {
        return Err(invalid(whole));
    }
    Ok(Duration::new(secs, nanos))
}

impl FromStr for QosProfile {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [reliability, durability, history, deadline, lifespan, liveliness] = fields[..] else {
            return Err(invalid(s));
        };

        let (history, depth) = history.split_once(',').ok_or_else(|| invalid(s))?;
        let (deadline_s, deadline_ns) = deadline.split_once(',').ok_or_else(|| invalid(s))?;
        let (lifespan_s, lifespan_ns) = lifespan.split_once(',').ok_or_else(|| invalid(s))?;
        let mut lv = liveliness.splitn(3, ',');
        let (Some(liveliness), Some(lease_s), Some(lease_ns)) = (lv.next(), lv.next(), lv.next())
        else {
            return Err(invalid(s));
        };

        let default = QosProfile::default();
        Ok(Self {
            reliability: parse_code(reliability, default.reliability, Reliability::from_code, s)?,
            durability: parse_code(durability, default.durability, Durability::from_code, s)?,
            history: parse_code(history, default.history, History::from_code, s)?,
            depth: parse_or(depth, default.depth, s)?,
            deadline: parse_duration(deadline_s, deadline_ns, s)?,
            lifespan: parse_duration(lifespan_s, lifespan_ns, s)?,
            liveliness: parse_code(liveliness, default.liveliness, Liveliness::from_code, s)?,
            liveliness_lease_duration: parse_duration(lease_s, lease_ns, s)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_encoding() {
        assert_eq!(QosProfile::default().to_string(), "1:2:1,10:0,0:0,0:1,0,0");
    }

    #[test]
    fn parses_what_it_prints() {
        let qos = QosProfile {
            history: History::KeepAll,
            depth: 0,
            reliability: Reliability::BestEffort,
            durability: Durability::TransientLocal,
            deadline: Duration::new(1, 500),
            lifespan: Duration::from_millis(250),
            liveliness: Liveliness::ManualByTopic,
            liveliness_lease_duration: Duration::from_secs(3),
        };
        assert_eq!(qos.to_string().parse::<QosProfile>().unwrap(), qos);
    }

    #[test]
    fn empty_fields_fall_back_to_defaults() {
        let qos: QosProfile = "::,:,:,:,,".parse().unwrap();
        assert_eq!(qos, QosProfile::default());
    }

    #[test]
    fn rejects_malformed_profiles() {
        for bad in ["", "1:2:1", "9:2:1,10:0,0:0,0:1,0,0", "1:2:1,x:0,0:0,0:1,0,0", "1:2:1,10:0,2000000000:0,0:1,0,0"] {
            assert!(bad.parse::<QosProfile>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn queue_bound_follows_history() {
        assert_eq!(QosProfile::default().keep_last(3).queue_bound(), Some(3));
        assert_eq!(QosProfile::default().keep_all().queue_bound(), None);
    }
}
