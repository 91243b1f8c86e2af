//! Stage registry and session status resolution
//!
//! The registry is an ordered, immutable list of pipeline stages built once
//! per process. The resolver turns the free-text `status` column of a
//! session back into a canonical [`StageSlug`]. That column has been written
//! by many code paths over time (`pending_thesis`, `antithesis_complete`,
//! `synthesis_error`, `active`, ...), so resolution never fails: an
//! unrecognised status degrades to the first stage with a warning.

use crate::{DialecticError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::warn;

/// Canonical stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSlug {
    Thesis,
    Antithesis,
    Synthesis,
    Parenthesis,
    Paralysis,
}

impl StageSlug {
    /// Every slug, in pipeline order
    pub const ALL: [StageSlug; 5] = [
        Self::Thesis,
        Self::Antithesis,
        Self::Synthesis,
        Self::Parenthesis,
        Self::Paralysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thesis => "thesis",
            Self::Antithesis => "antithesis",
            Self::Synthesis => "synthesis",
            Self::Parenthesis => "parenthesis",
            Self::Paralysis => "paralysis",
        }
    }

    /// Session status written while this stage is generating
    pub fn generating_status(&self) -> String {
        format!("{}_generating", self.as_str())
    }

    /// Session status written once every model finished this stage
    pub fn complete_status(&self) -> String {
        format!("{}_complete", self.as_str())
    }

    /// Session status written when this stage failed
    pub fn error_status(&self) -> String {
        format!("{}_error", self.as_str())
    }
}

impl std::fmt::Display for StageSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageSlug {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thesis" => Ok(Self::Thesis),
            "antithesis" => Ok(Self::Antithesis),
            "synthesis" => Ok(Self::Synthesis),
            "parenthesis" => Ok(Self::Parenthesis),
            "paralysis" => Ok(Self::Paralysis),
            _ => Err(format!("Invalid stage slug: {}", s)),
        }
    }
}

/// One entry in the stage registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Canonical key
    pub name: String,
    /// Human-readable label
    pub display_name: String,
    /// Position in the pipeline, starting at 1
    pub ordinal: u32,
    pub slug: StageSlug,
}

impl StageDefinition {
    pub fn new(slug: StageSlug, display_name: impl Into<String>, ordinal: u32) -> Self {
        Self {
            name: slug.as_str().to_string(),
            display_name: display_name.into(),
            ordinal,
            slug,
        }
    }
}

/// Which rule produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A registered slug appears inside the status
    Substring,
    /// The status has the `(pending_)?<slug>(_suffix)?` shape
    Pattern,
    /// The status is one of the pre-stage sentinels (`active`, `session_started`)
    EarlySentinel,
    /// Nothing matched; the first stage was used
    Fallback,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Substring => write!(f, "substring"),
            Self::Pattern => write!(f, "pattern"),
            Self::EarlySentinel => write!(f, "early_sentinel"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A resolved stage together with the rule that matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResolution {
    pub slug: StageSlug,
    pub rule: Resolution,
}

const EARLY_SENTINELS: [&str; 2] = ["active", "session_started"];

fn status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:pending_)?([a-z]+)(?:_complete|_error|_generating)?$")
            .unwrap_or_else(|e| unreachable!("static status pattern is valid: {e}"))
    })
}

/// Ordered, immutable list of pipeline stages
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    /// Build a registry, rejecting empty lists, non-increasing ordinals and
    /// duplicate slugs.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self> {
        if stages.is_empty() {
            return Err(DialecticError::StageConfig(
                "Stage registry must contain at least one stage".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (idx, stage) in stages.iter().enumerate() {
            if !seen.insert(stage.slug) {
                return Err(DialecticError::StageConfig(format!(
                    "Duplicate stage slug: {}",
                    stage.slug
                )));
            }
            if idx > 0 && stage.ordinal <= stages[idx - 1].ordinal {
                return Err(DialecticError::StageConfig(format!(
                    "Stage ordinals must be strictly increasing ({} follows {})",
                    stage.ordinal,
                    stages[idx - 1].ordinal
                )));
            }
        }

        Ok(Self { stages })
    }

    /// The process-wide standard registry
    pub fn standard() -> &'static StageRegistry {
        static REGISTRY: OnceLock<StageRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| Self {
            stages: standard_stages(),
        })
    }

    /// First stage (ordinal order). The registry is never empty.
    pub fn first(&self) -> &StageDefinition {
        &self.stages[0]
    }

    pub fn get(&self, slug: StageSlug) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.slug == slug)
    }

    pub fn contains(&self, slug: StageSlug) -> bool {
        self.get(slug).is_some()
    }

    /// The stage that follows `slug`, `None` after the last one
    pub fn next_after(&self, slug: StageSlug) -> Option<&StageDefinition> {
        let idx = self.stages.iter().position(|s| s.slug == slug)?;
        self.stages.get(idx + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Map a session status to a canonical stage slug.
    ///
    /// Returns `None` only for a missing or empty status.
    pub fn resolve(&self, status: Option<&str>) -> Option<StageSlug> {
        self.resolve_detailed(status).map(|r| r.slug)
    }

    /// Like [`resolve`](Self::resolve), also reporting which rule matched.
    pub fn resolve_detailed(&self, status: Option<&str>) -> Option<StageResolution> {
        let raw = status?;
        if raw.is_empty() {
            return None;
        }
        let status = raw.trim().to_lowercase();

        // Longest contained slug wins so `antithesis` beats `thesis`.
        // Strict comparison keeps the first-registered stage on a tie.
        let mut best: Option<&StageDefinition> = None;
        for stage in &self.stages {
            if status.contains(stage.slug.as_str()) {
                let longer = best
                    .map(|b| stage.slug.as_str().len() > b.slug.as_str().len())
                    .unwrap_or(true);
                if longer {
                    best = Some(stage);
                }
            }
        }
        if let Some(stage) = best {
            return Some(StageResolution {
                slug: stage.slug,
                rule: Resolution::Substring,
            });
        }

        if let Some(captured) = status_pattern()
            .captures(&status)
            .and_then(|c| c.get(1))
        {
            if let Ok(slug) = captured.as_str().parse::<StageSlug>() {
                if self.contains(slug) {
                    return Some(StageResolution {
                        slug,
                        rule: Resolution::Pattern,
                    });
                }
            }
        }

        if EARLY_SENTINELS.contains(&status.as_str()) {
            return Some(StageResolution {
                slug: self.first().slug,
                rule: Resolution::EarlySentinel,
            });
        }

        warn!(status = %raw, "could not derive stage from status: `{}`", raw);
        Some(StageResolution {
            slug: self.first().slug,
            rule: Resolution::Fallback,
        })
    }
}

fn standard_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new(StageSlug::Thesis, "Thesis", 1),
        StageDefinition::new(StageSlug::Antithesis, "Antithesis", 2),
        StageDefinition::new(StageSlug::Synthesis, "Synthesis", 3),
        StageDefinition::new(StageSlug::Parenthesis, "Parenthesis", 4),
        StageDefinition::new(StageSlug::Paralysis, "Paralysis", 5),
    ]
}

/// Resolve a session status against the standard registry
pub fn resolve_stage(status: Option<&str>) -> Option<StageSlug> {
    StageRegistry::standard().resolve(status)
}
