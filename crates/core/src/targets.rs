use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::actor::ActorId;

/// Longest relationship chain followed for hybrid targets.
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Who acts on a step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TargetSpec", into = "TargetSpec")]
pub enum StepTarget {
    /// Every member of the named role.
    Role(String),
    /// The identity one relationship hop away from the submitter.
    Relationship(String),
    /// Role holders found along the submitter's relationship chain.
    Hybrid { role: String, relationship: String },
    /// Resolved by the engine without a human.
    System,
}

impl StepTarget {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    pub fn validate(&self) -> Result<(), String> {
        let blank = |value: &str| value.trim().is_empty();
        match self {
            Self::Role(role) if blank(role) => Err("role target needs a role name".to_owned()),
            Self::Relationship(relation) if blank(relation) => {
                Err("relationship target needs a relationship name".to_owned())
            }
            Self::Hybrid { role, relationship } if blank(role) || blank(relationship) => {
                Err("hybrid target needs both a role and a relationship".to_owned())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for StepTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role(role) => write!(f, "role:{role}"),
            Self::Relationship(relation) => write!(f, "relationship:{relation}"),
            Self::Hybrid { role, relationship } => write!(f, "hybrid:{role}@{relationship}"),
            Self::System => f.write_str("system"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Role,
    Relationship,
    Hybrid,
    System,
}

/// Wire shape: `{"targetType": "...", "targetValue": ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub target_type: TargetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<TargetValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetValue {
    Name(String),
    Hybrid { role: String, relationship: String },
}

impl TryFrom<TargetSpec> for StepTarget {
    type Error = String;

    fn try_from(spec: TargetSpec) -> Result<Self, Self::Error> {
        match (spec.target_type, spec.target_value) {
            (TargetKind::Role, Some(TargetValue::Name(role))) => Ok(Self::Role(role)),
            (TargetKind::Relationship, Some(TargetValue::Name(relation))) => {
                Ok(Self::Relationship(relation))
            }
            (TargetKind::Hybrid, Some(TargetValue::Hybrid { role, relationship })) => {
                Ok(Self::Hybrid { role, relationship })
            }
            (TargetKind::System, _) => Ok(Self::System),
            (kind, None) => Err(format!("target type {kind:?} requires a targetValue")),
            (TargetKind::Hybrid, Some(TargetValue::Name(_))) => {
                Err("hybrid targetValue must be an object with role and relationship".to_owned())
            }
            (kind, Some(TargetValue::Hybrid { .. })) => {
                Err(format!("target type {kind:?} takes a plain string targetValue"))
            }
        }
    }
}

impl From<StepTarget> for TargetSpec {
    fn from(target: StepTarget) -> Self {
        let (target_type, target_value) = match target {
            StepTarget::Role(role) => (TargetKind::Role, Some(TargetValue::Name(role))),
            StepTarget::Relationship(relation) => {
                (TargetKind::Relationship, Some(TargetValue::Name(relation)))
            }
            StepTarget::Hybrid { role, relationship } => {
                (TargetKind::Hybrid, Some(TargetValue::Hybrid { role, relationship }))
            }
            StepTarget::System => (TargetKind::System, None),
        };
        Self { target_type, target_value }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Identity directory: role membership and reporting relationships.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn members_of_role(&self, role: &str) -> Result<BTreeSet<ActorId>, DirectoryError>;

    async fn relationship_target(
        &self,
        actor: &ActorId,
        relation: &str,
    ) -> Result<Option<ActorId>, DirectoryError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActorSet {
    Actors(BTreeSet<ActorId>),
    System,
}

impl ActorSet {
    pub fn contains(&self, actor: &ActorId) -> bool {
        match self {
            Self::Actors(actors) => actors.contains(actor),
            Self::System => false,
        }
    }

    pub fn actors(&self) -> Vec<ActorId> {
        match self {
            Self::Actors(actors) => actors.iter().cloned().collect(),
            Self::System => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("role `{role}` has no members")]
    EmptyRole { role: String },
    #[error("`{actor}` has no `{relation}` relationship")]
    BrokenRelationship { actor: String, relation: String },
    #[error("no `{role}` holder found along the `{relationship}` chain of `{actor}`")]
    NoHybridMatch { role: String, relationship: String, actor: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl ResolutionError {
    /// Directory outages are retried; everything else means the step is stuck
    /// until someone fixes the directory data.
    pub fn is_unresolvable(&self) -> bool {
        !matches!(self, Self::Directory(_))
    }
}

pub struct TargetResolver<'a> {
    directory: &'a dyn Directory,
    timeout: Duration,
}

impl<'a> TargetResolver<'a> {
    pub fn new(directory: &'a dyn Directory, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    pub async fn resolve(
        &self,
        target: &StepTarget,
        submitter: &ActorId,
    ) -> Result<ActorSet, ResolutionError> {
        match target {
            StepTarget::Role(role) => {
                let members = self.role_members(role).await?;
                if members.is_empty() {
                    return Err(ResolutionError::EmptyRole { role: role.clone() });
                }
                Ok(ActorSet::Actors(members))
            }
            StepTarget::Relationship(relation) => {
                let Some(target) = self.hop(submitter, relation).await? else {
                    return Err(ResolutionError::BrokenRelationship {
                        actor: submitter.to_string(),
                        relation: relation.clone(),
                    });
                };
                Ok(ActorSet::Actors(BTreeSet::from([target])))
            }
            StepTarget::Hybrid { role, relationship } => {
                let chain = self.chain(submitter, relationship).await?;
                if chain.is_empty() {
                    return Err(ResolutionError::BrokenRelationship {
                        actor: submitter.to_string(),
                        relation: relationship.clone(),
                    });
                }
                let members = self.role_members(role).await?;
                let matched: BTreeSet<ActorId> =
                    chain.into_iter().filter(|actor| members.contains(actor)).collect();
                if matched.is_empty() {
                    return Err(ResolutionError::NoHybridMatch {
                        role: role.clone(),
                        relationship: relationship.clone(),
                        actor: submitter.to_string(),
                    });
                }
                Ok(ActorSet::Actors(matched))
            }
            StepTarget::System => Ok(ActorSet::System),
        }
    }

    async fn role_members(&self, role: &str) -> Result<BTreeSet<ActorId>, DirectoryError> {
        tokio::time::timeout(self.timeout, self.directory.members_of_role(role))
            .await
            .map_err(|_| DirectoryError::Timeout(self.timeout))?
    }

    async fn hop(
        &self,
        actor: &ActorId,
        relation: &str,
    ) -> Result<Option<ActorId>, DirectoryError> {
        tokio::time::timeout(self.timeout, self.directory.relationship_target(actor, relation))
            .await
            .map_err(|_| DirectoryError::Timeout(self.timeout))?
    }

    async fn chain(
        &self,
        submitter: &ActorId,
        relation: &str,
    ) -> Result<Vec<ActorId>, DirectoryError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([submitter.clone()]);
        let mut current = submitter.clone();

        while chain.len() < MAX_CHAIN_DEPTH {
            let Some(next) = self.hop(&current, relation).await? else {
                break;
            };
            if !visited.insert(next.clone()) {
                break;
            }
            chain.push(next.clone());
            current = next;
        }

        Ok(chain)
    }
}

/// Fixed directory held in memory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    roles: HashMap<String, BTreeSet<ActorId>>,
    relationships: HashMap<(ActorId, String), ActorId>,
    unavailable: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role_member(mut self, role: &str, actor: impl Into<String>) -> Self {
        self.roles.entry(normalize_key(role)).or_default().insert(ActorId::new(actor));
        self
    }

    pub fn with_relationship(
        mut self,
        actor: impl Into<String>,
        relation: &str,
        target: impl Into<String>,
    ) -> Self {
        self.relationships
            .insert((ActorId::new(actor), normalize_key(relation)), ActorId::new(target));
        self
    }

    /// Simulates an outage: every lookup fails until toggled back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("static directory switched off".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn members_of_role(&self, role: &str) -> Result<BTreeSet<ActorId>, DirectoryError> {
        self.check_available()?;
        Ok(self.roles.get(&normalize_key(role)).cloned().unwrap_or_default())
    }

    async fn relationship_target(
        &self,
        actor: &ActorId,
        relation: &str,
    ) -> Result<Option<ActorId>, DirectoryError> {
        self.check_available()?;
        Ok(self.relationships.get(&(actor.clone(), normalize_key(relation))).cloned())
    }
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
