//! Records held by the store: items, share grants and history entries, plus
//! the [`Actor`] on whose behalf every operation runs.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ItemId = Uuid;

/// Longest item name accepted, in characters.
pub const MAX_NAME_LEN: usize = 255;

/// Platform roles.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Receptionist,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Receptionist => "receptionist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" => Some(Role::Patient),
            "doctor" => Some(Role::Doctor),
            "receptionist" => Some(Role::Receptionist),
            _ => None,
        }
    }
}

/// The caller of an operation.
///
/// A receptionist only ever acts for the doctor they are assigned to; an
/// unassigned receptionist can read nothing and change nothing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Actor {
    Patient {
        id: String,
    },
    Doctor {
        id: String,
    },
    Receptionist {
        id: String,
        assigned_doctor_id: Option<String>,
    },
}

impl Actor {
    pub fn patient(id: impl Into<String>) -> Self {
        Actor::Patient { id: id.into() }
    }

    pub fn doctor(id: impl Into<String>) -> Self {
        Actor::Doctor { id: id.into() }
    }

    pub fn receptionist(id: impl Into<String>, assigned_doctor_id: Option<String>) -> Self {
        Actor::Receptionist {
            id: id.into(),
            assigned_doctor_id,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Actor::Patient { id } | Actor::Doctor { id } | Actor::Receptionist { id, .. } => id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Actor::Patient { .. } => Role::Patient,
            Actor::Doctor { .. } => Role::Doctor,
            Actor::Receptionist { .. } => Role::Receptionist,
        }
    }

    /// Identity whose tree this actor reads and writes. `None` for a
    /// receptionist without an assigned doctor.
    pub fn acting_owner(&self) -> Option<&str> {
        match self {
            Actor::Patient { id } | Actor::Doctor { id } => Some(id),
            Actor::Receptionist {
                assigned_doctor_id, ..
            } => assigned_doctor_id.as_deref(),
        }
    }

    /// Role recorded as `owner_type` on items this actor creates.
    pub fn acting_owner_role(&self) -> Role {
        match self {
            Actor::Patient { .. } => Role::Patient,
            Actor::Doctor { .. } | Actor::Receptionist { .. } => Role::Doctor,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Folder,
    File,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Folder => "folder",
            ItemKind::File => "file",
        }
    }
}

/// A folder or file metadata node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub owner_id: String,
    pub owner_type: Role,
    pub name: String,
    pub kind: ItemKind,
    pub parent_id: Option<ItemId>,
    pub file_ref: Option<String>,
    pub size: Option<u64>,
    pub extension: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: u64,
}

impl Item {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields supplied when creating an item.
#[derive(Clone, Debug)]
pub struct NewItem {
    pub owner_id: String,
    pub owner_type: Role,
    pub kind: ItemKind,
    pub name: String,
    pub parent_id: Option<ItemId>,
    pub file_ref: Option<String>,
    pub size: Option<u64>,
    pub extension: Option<String>,
    pub category: Option<String>,
}

impl NewItem {
    pub fn folder(
        owner_id: impl Into<String>,
        owner_type: Role,
        name: impl Into<String>,
        parent_id: Option<ItemId>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            owner_type,
            kind: ItemKind::Folder,
            name: name.into(),
            parent_id,
            file_ref: None,
            size: None,
            extension: None,
            category: None,
        }
    }

    pub fn file(
        owner_id: impl Into<String>,
        owner_type: Role,
        name: impl Into<String>,
        parent_id: Option<ItemId>,
        file_ref: impl Into<String>,
        size: u64,
        extension: Option<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            owner_type,
            kind: ItemKind::File,
            name: name.into(),
            parent_id,
            file_ref: Some(file_ref.into()),
            size: Some(size),
            extension,
            category: None,
        }
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }
}

/// One step of a breadcrumb trail.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breadcrumb {
    pub id: ItemId,
    pub name: String,
}

/// A directed, revocable read-access edge from an owner's item to a
/// recipient.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareGrant {
    pub id: Uuid,
    pub item_id: ItemId,
    pub granted_by: String,
    pub granted_to: String,
    #[serde(default)]
    pub granted_to_type: Option<Role>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_by: Option<String>,
}

impl ShareGrant {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Upload,
    Rename,
    Share,
    Delete,
    Move,
    Revoke,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Upload => "upload",
            ActionType::Rename => "rename",
            ActionType::Share => "share",
            ActionType::Delete => "delete",
            ActionType::Move => "move",
            ActionType::Revoke => "revoke",
        }
    }
}

/// An immutable fact in the audit history of one item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub id: Uuid,
    /// Global insertion order, assigned by the history log.
    pub sequence: u64,
    pub item_id: ItemId,
    pub action: ActionType,
    pub performed_by: String,
    pub performed_by_type: Role,
    pub occurred_at: DateTime<Utc>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub shared_with_id: Option<String>,
    pub shared_with_type: Option<Role>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Hex SHA-256 of the previous entry in the log; empty for the first.
    #[serde(default)]
    pub prev_digest: String,
    #[serde(default)]
    pub digest: String,
}

impl HistoryEntry {
    /// A fresh, unsequenced entry performed by `actor` on `item_id`.
    pub fn new(item_id: ItemId, action: ActionType, actor: &Actor) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            item_id,
            action,
            performed_by: actor.id().to_string(),
            performed_by_type: actor.role(),
            occurred_at: Utc::now(),
            old_value: None,
            new_value: None,
            shared_with_id: None,
            shared_with_type: None,
            metadata: serde_json::Value::Null,
            prev_digest: String::new(),
            digest: String::new(),
        }
    }

    pub fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    pub fn shared_with(mut self, id: impl Into<String>, role: Option<Role>) -> Self {
        self.shared_with_id = Some(id.into());
        self.shared_with_type = role;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Normalise and check an item name. Returns the trimmed name.
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidName("name must not be empty".into()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(Error::InvalidName(format!("{trimmed:?} is reserved")));
    }
    if trimmed
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::InvalidName(
            "name must not contain path separators or control characters".into(),
        ));
    }
    Ok(trimmed.to_string())
}
