//! Domain types shared by the sync engine and the CLI.
//!
//! The server versions a team's whole mutable state as one unit, so there is
//! one [`ConcurrencyToken`] per client session rather than one per resource.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque version marker for the team state, e.g. `W/"team:abc:rev:42"`.
///
/// Sent as `If-Match` on writes and adopted from `ETag` headers and from the
/// `currentEtag` field of conflict responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyToken(pub String);

impl ConcurrencyToken {
    /// Returns `None` for empty or whitespace-only markers.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ConcurrencyToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConcurrencyToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Entity tags
// ---------------------------------------------------------------------------

/// Coarse category of what changed in a team-state change event.
///
/// Strings the client does not recognise decode to [`EntityTag::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum EntityTag {
    Task,
    TaskCompletion,
    PenaltyRule,
    Invite,
    TeamMember,
    TeamState,
    Unknown,
    /// Sentinel from the monthly close run: too much changed, resync everything.
    CloseRun,
}

impl EntityTag {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityTag::Task => "task",
            EntityTag::TaskCompletion => "task_completion",
            EntityTag::PenaltyRule => "penalty_rule",
            EntityTag::Invite => "invite",
            EntityTag::TeamMember => "team_member",
            EntityTag::TeamState => "team_state",
            EntityTag::Unknown => "unknown",
            EntityTag::CloseRun => "close_run",
        }
    }

    /// Whether seeing this tag forces a refresh of every cache region.
    pub fn requires_full_refresh(self) -> bool {
        matches!(self, EntityTag::Unknown | EntityTag::CloseRun)
    }

    /// Cache regions whose contents depend on this entity family.
    ///
    /// Empty for tags that require a full refresh.
    pub fn dependent_regions(self) -> &'static [CacheRegion] {
        match self {
            EntityTag::Task | EntityTag::TaskCompletion => &[
                CacheRegion::Tasks,
                CacheRegion::Home,
                CacheRegion::MonthlySummary,
            ],
            EntityTag::PenaltyRule => &[CacheRegion::PenaltyRules, CacheRegion::MonthlySummary],
            EntityTag::Invite | EntityTag::TeamMember | EntityTag::TeamState => &[
                CacheRegion::Profile,
                CacheRegion::TeamMembers,
                CacheRegion::CurrentInvite,
            ],
            EntityTag::Unknown | EntityTag::CloseRun => &[],
        }
    }
}

impl From<&str> for EntityTag {
    fn from(s: &str) -> Self {
        match s.trim() {
            "task" => EntityTag::Task,
            "task_completion" => EntityTag::TaskCompletion,
            "penalty_rule" => EntityTag::PenaltyRule,
            "invite" => EntityTag::Invite,
            "team_member" => EntityTag::TeamMember,
            "team_state" => EntityTag::TeamState,
            "close_run" => EntityTag::CloseRun,
            _ => EntityTag::Unknown,
        }
    }
}

impl From<String> for EntityTag {
    fn from(s: String) -> Self {
        EntityTag::from(s.as_str())
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cache regions
// ---------------------------------------------------------------------------

/// A named slice of the client's query cache that can be refetched on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheRegion {
    /// The signed-in member's profile (`me`).
    Profile,
    TeamMembers,
    CurrentInvite,
    /// Day/week task overview.
    Home,
    Tasks,
    PenaltyRules,
    MonthlySummary,
}

impl CacheRegion {
    pub const ALL: [CacheRegion; 7] = [
        CacheRegion::Profile,
        CacheRegion::TeamMembers,
        CacheRegion::CurrentInvite,
        CacheRegion::Home,
        CacheRegion::Tasks,
        CacheRegion::PenaltyRules,
        CacheRegion::MonthlySummary,
    ];

    /// The query key the UI layer registers this region under.
    pub fn key(self) -> &'static str {
        match self {
            CacheRegion::Profile => "me",
            CacheRegion::TeamMembers => "team-members",
            CacheRegion::CurrentInvite => "current-invite",
            CacheRegion::Home => "home",
            CacheRegion::Tasks => "tasks",
            CacheRegion::PenaltyRules => "rules",
            CacheRegion::MonthlySummary => "monthly-summary",
        }
    }
}

impl fmt::Display for CacheRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// Revision events
// ---------------------------------------------------------------------------

/// One change notification from the team event stream.
///
/// `revision` is always > 0; revisions are strictly increasing per team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionEvent {
    pub revision: u64,
    pub entity: EntityTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
    /// Free-form server hints such as `{"action": "join"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hints: BTreeMap<String, String>,
}

impl RevisionEvent {
    pub fn new(revision: u64, entity: EntityTag) -> Self {
        Self {
            revision,
            entity,
            team_id: None,
            changed_at: None,
            hints: BTreeMap::new(),
        }
    }
}
