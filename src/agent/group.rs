//! Group agents.
//!
//! A group owns its own key pair. The group secret is wrapped once for every
//! member's public key, so any unlocked member (including another unlocked
//! group) can recover it. Membership edits are staged with [`GroupAgent::add_member`]
//! and [`GroupAgent::revoke_member`] and only become visible after
//! [`GroupAgent::apply`].

use crate::agent::identity::{Agent, AgentKeys};
use crate::agent::storage::AgentStorage;
use crate::crypto::{self, KeyPair, PublicKeys, WrappedKey};
use crate::error::NodeError;
use crate::types::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One member's copy of the group secret
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub public: PublicKeys,
    pub wrapped: WrappedKey,
}

#[derive(Debug, Clone, Default)]
struct StagedChanges {
    add: BTreeMap<AgentId, PublicKeys>,
    revoke: BTreeSet<AgentId>,
}

impl StagedChanges {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.revoke.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAgent {
    keys: AgentKeys,
    members: BTreeMap<AgentId, Membership>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_data: Option<serde_json::Value>,
    #[serde(skip)]
    staged: StagedChanges,
    #[serde(skip)]
    opened_by: Option<AgentId>,
}

impl GroupAgent {
    /// Create a group for `members`. The returned group is locked; unlock it
    /// through any of the members.
    pub fn create(members: &[&Agent]) -> Result<Self, NodeError> {
        if members.is_empty() {
            return Err(NodeError::InvalidArgument(
                "a group needs at least one member".to_string(),
            ));
        }
        let pair = KeyPair::generate();
        let secret = pair.secret_bytes();
        let mut memberships = BTreeMap::new();
        for member in members {
            memberships.insert(
                member.id(),
                Membership {
                    public: *member.public_keys(),
                    wrapped: crypto::wrap_key(&secret, member.public_keys())?,
                },
            );
        }
        let keys = AgentKeys::unlocked(pair);
        debug!(group_id = %keys.id(), members = memberships.len(), "Created group");
        Ok(Self {
            keys: keys.locked_copy(),
            members: memberships,
            name: None,
            user_data: None,
            staged: StagedChanges::default(),
            opened_by: None,
        })
    }

    pub(crate) fn keys(&self) -> &AgentKeys {
        &self.keys
    }

    pub fn id(&self) -> AgentId {
        self.keys.id()
    }

    pub fn is_locked(&self) -> bool {
        self.keys.is_locked()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), NodeError> {
        self.keys.key_pair()?;
        self.name = Some(name.to_string());
        Ok(())
    }

    pub fn user_data(&self) -> Option<&serde_json::Value> {
        self.user_data.as_ref()
    }

    pub fn set_user_data(&mut self, data: serde_json::Value) -> Result<(), NodeError> {
        self.keys.key_pair()?;
        self.user_data = Some(data);
        Ok(())
    }

    /// Unlock with an unlocked member. The member may itself be a group.
    pub fn unlock(&mut self, member: &Agent) -> Result<(), NodeError> {
        if member.is_locked() {
            return Err(NodeError::AccessDenied(format!(
                "member {} must be unlocked to open group {}",
                member.id(),
                self.id()
            )));
        }
        let membership = self.members.get(&member.id()).ok_or_else(|| {
            NodeError::AccessDenied(format!(
                "agent {} is not a member of group {}",
                member.id(),
                self.id()
            ))
        })?;
        let secret = member.key_pair()?.unwrap_key(&membership.wrapped)?;
        self.keys.install(KeyPair::from_secret_bytes(&secret))?;
        self.opened_by = Some(member.id());
        debug!(group_id = %self.id(), member_id = %member.id(), "Group unlocked");
        Ok(())
    }

    pub fn lock(&mut self) {
        self.keys.lock();
        self.opened_by = None;
    }

    /// The member used for the current unlock.
    pub fn opening_agent(&self) -> Option<AgentId> {
        self.opened_by
    }

    pub fn has_member(&self, id: AgentId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.members.keys().copied()
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn add_member(&mut self, member: &Agent) -> Result<(), NodeError> {
        self.keys.key_pair()?;
        let id = member.id();
        if id == self.id() {
            return Err(NodeError::InvalidArgument(
                "a group cannot be its own member".to_string(),
            ));
        }
        self.staged.revoke.remove(&id);
        self.staged.add.insert(id, *member.public_keys());
        Ok(())
    }

    pub fn revoke_member(&mut self, id: AgentId) -> Result<(), NodeError> {
        self.keys.key_pair()?;
        self.staged.add.remove(&id);
        if self.members.contains_key(&id) {
            self.staged.revoke.insert(id);
        }
        Ok(())
    }

    /// Commit staged membership changes.
    pub fn apply(&mut self) -> Result<(), NodeError> {
        let pair = self.keys.key_pair()?;
        let remaining = self
            .members
            .keys()
            .filter(|id| !self.staged.revoke.contains(id))
            .count()
            + self
                .staged
                .add
                .keys()
                .filter(|id| !self.members.contains_key(id))
                .count();
        if remaining == 0 {
            return Err(NodeError::InvalidArgument(format!(
                "revoking every member would make group {} unreachable",
                self.id()
            )));
        }

        let secret = pair.secret_bytes();
        let mut added = BTreeMap::new();
        for (id, public) in &self.staged.add {
            added.insert(
                *id,
                Membership {
                    public: *public,
                    wrapped: crypto::wrap_key(&secret, public)?,
                },
            );
        }

        let staged = std::mem::take(&mut self.staged);
        for id in &staged.revoke {
            self.members.remove(id);
        }
        self.members.extend(added);
        debug!(
            group_id = %self.id(),
            added = staged.add.len(),
            revoked = staged.revoke.len(),
            "Applied group membership changes"
        );
        Ok(())
    }

    pub(crate) fn locked_copy(&self) -> Self {
        Self {
            keys: self.keys.locked_copy(),
            members: self.members.clone(),
            name: self.name.clone(),
            user_data: self.user_data.clone(),
            staged: StagedChanges::default(),
            opened_by: None,
        }
    }
}

const MAX_GROUP_DEPTH: usize = 8;

/// Unlock `group` for `reader`, either directly or through a chain of nested
/// member groups looked up in `storage`.
pub fn unlock_for(
    group: &mut GroupAgent,
    reader: &Agent,
    storage: &dyn AgentStorage,
) -> Result<(), NodeError> {
    let mut visited = BTreeSet::new();
    if unlock_recursive(group, reader, storage, &mut visited, 0) {
        Ok(())
    } else {
        Err(NodeError::AccessDenied(format!(
            "no membership path from agent {} to group {}",
            reader.id(),
            group.id()
        )))
    }
}

fn unlock_recursive(
    group: &mut GroupAgent,
    reader: &Agent,
    storage: &dyn AgentStorage,
    visited: &mut BTreeSet<AgentId>,
    depth: usize,
) -> bool {
    if depth > MAX_GROUP_DEPTH || !visited.insert(group.id()) {
        return false;
    }
    if group.has_member(reader.id()) {
        return group.unlock(reader).is_ok();
    }
    let members: Vec<AgentId> = group.member_ids().collect();
    for member_id in members {
        let Ok(Agent::Group(mut sub)) = storage.get_agent(member_id) else {
            continue;
        };
        if unlock_recursive(&mut sub, reader, storage, visited, depth + 1)
            && group.unlock(&Agent::Group(sub)).is_ok()
        {
            return true;
        }
    }
    false
}
