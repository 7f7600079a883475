//! The single writer of items and grants.
//!
//! Every mutation runs authorize, validate, apply, log in that order.
//! Nothing is written when authorization or validation fails, and the
//! history append that follows a successful apply is best effort. Changes to
//! existing items and grants hold the commit lock from the read of the
//! current state through the history append, so the log records them in the
//! order they were applied.

use crate::access::{can_mutate, can_read, can_share, can_write_root};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::history::HistoryLog;
use crate::model::{
    ActionType, Actor, Breadcrumb, HistoryEntry, Item, ItemId, NewItem, Role, ShareGrant,
};
use crate::sharing::{SharedGroup, SharingLedger};
use crate::storage::{ItemStore, StoreConfig, TreeView};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata for a new file. The bytes are already in the blob store under
/// `file_ref`.
#[derive(Clone, Debug)]
pub struct Upload {
    pub name: String,
    pub parent_id: Option<ItemId>,
    pub file_ref: String,
    pub size: u64,
    pub extension: Option<String>,
    pub category: Option<String>,
}

/// Result of a share request.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ShareOutcome {
    pub grant: ShareGrant,
    /// False when an active grant already existed and was returned as is.
    pub created: bool,
}

/// One active grant issued by the caller, with the item it covers.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SharedItem {
    pub grant: ShareGrant,
    pub item: Item,
}

/// A file to put in a download, with its path inside the archive.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DownloadEntry {
    pub item_id: ItemId,
    pub path: String,
    pub file_ref: String,
    pub size: Option<u64>,
}

/// Per-item result of a bulk operation.
#[derive(Debug)]
pub struct ItemOutcome<T> {
    pub item_id: ItemId,
    pub result: Result<T>,
}

impl<T> ItemOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct MutationEngine {
    items: ItemStore,
    ledger: SharingLedger,
    history: HistoryLog,
    events: EventBus,
    commit: Mutex<()>,
}

fn acting_owner(actor: &Actor) -> Result<&str> {
    actor.acting_owner().ok_or_else(|| {
        Error::NotAuthorized(format!("receptionist {} has no assigned doctor", actor.id()))
    })
}

fn denied(actor: &Actor, what: &str, id: ItemId) -> Error {
    tracing::debug!(actor = actor.id(), role = actor.role().as_str(), %id, what, "denied");
    Error::NotAuthorized(format!("{} may not {what} {id}", actor.id()))
}

fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

impl MutationEngine {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let history = match config.history_dir() {
            Some(dir) => HistoryLog::open(dir)?,
            None => HistoryLog::in_memory(),
        };
        Ok(Self {
            items: ItemStore::open(config)?,
            ledger: SharingLedger::open(config)?,
            history,
            events: EventBus::new(),
            commit: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            items: ItemStore::in_memory(),
            ledger: SharingLedger::in_memory(),
            history: HistoryLog::in_memory(),
            events: EventBus::new(),
            commit: Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn ledger(&self) -> &SharingLedger {
        &self.ledger
    }

    pub fn history_log(&self) -> &HistoryLog {
        &self.history
    }

    fn record(&self, entry: HistoryEntry) {
        let (item, action) = (entry.item_id, entry.action);
        if let Err(err) = self.history.append(entry) {
            tracing::warn!(%item, action = action.as_str(), %err, "history append lost");
        }
    }

    /// The item, provided neither it nor an ancestor is deleted.
    fn live(&self, id: ItemId) -> Result<Item> {
        self.items.view(|view| {
            let item = view.get(id).ok_or(Error::NotFound(id))?;
            if view.is_effectively_deleted(id)? {
                return Err(Error::NotFound(id));
            }
            Ok(item.clone())
        })
    }

    fn check_read(
        &self,
        view: &TreeView<'_>,
        actor: &Actor,
        id: ItemId,
        grants: &[ShareGrant],
    ) -> Result<Item> {
        let item = view.get(id).ok_or(Error::NotFound(id))?;
        let ancestry = view.resolver().ancestors(id)?;
        if item.is_deleted() || ancestry.iter().any(|a| a.is_deleted()) {
            return Err(Error::NotFound(id));
        }
        if !can_read(actor, item, &ancestry, grants) {
            return Err(denied(actor, "read", id));
        }
        Ok(item.clone())
    }

    /// Fetch an item the actor may read.
    pub fn get(&self, actor: &Actor, id: ItemId) -> Result<Item> {
        let grants = self.ledger.active_grants_for(actor.id());
        self.items
            .view(|view| self.check_read(&view, actor, id, &grants))
    }

    /// Check that `actor` may create under `parent_id` and return the owner
    /// the new item will belong to.
    fn authorize_create(&self, actor: &Actor, parent_id: Option<ItemId>) -> Result<String> {
        let owner = acting_owner(actor)?;
        match parent_id {
            Some(pid) => match self.items.get(pid) {
                Ok(parent) if !can_mutate(actor, &parent) => Err(denied(actor, "write into", pid)),
                // a missing or unusable parent is reported by the repository
                _ => Ok(owner.to_string()),
            },
            None if can_write_root(actor, owner) => Ok(owner.to_string()),
            None => Err(Error::NotAuthorized(format!(
                "{} may not write to the root of {owner}",
                actor.id()
            ))),
        }
    }

    pub fn create_folder(
        &self,
        actor: &Actor,
        name: &str,
        parent_id: Option<ItemId>,
        category: Option<String>,
    ) -> Result<Item> {
        let owner = self.authorize_create(actor, parent_id)?;
        let item = self.items.create(
            NewItem::folder(owner, actor.acting_owner_role(), name, parent_id)
                .with_category(category),
        )?;
        tracing::info!(id = %item.id, owner = %item.owner_id, by = actor.id(), "folder created");
        self.record(
            HistoryEntry::new(item.id, ActionType::Upload, actor)
                .values(None, Some(item.name.clone()))
                .metadata(json!({ "kind": "folder", "parent_id": item.parent_id })),
        );
        self.events.send(Event::Created {
            id: item.id,
            owner: item.owner_id.clone(),
        });
        Ok(item)
    }

    pub fn upload(&self, actor: &Actor, upload: Upload) -> Result<Item> {
        let owner = self.authorize_create(actor, upload.parent_id)?;
        let extension = upload.extension.or_else(|| extension_of(upload.name.trim()));
        let item = self.items.create(
            NewItem::file(
                owner,
                actor.acting_owner_role(),
                upload.name,
                upload.parent_id,
                upload.file_ref,
                upload.size,
                extension,
            )
            .with_category(upload.category),
        )?;
        tracing::info!(id = %item.id, owner = %item.owner_id, by = actor.id(), size = upload.size, "file uploaded");
        self.record(
            HistoryEntry::new(item.id, ActionType::Upload, actor)
                .values(None, Some(item.name.clone()))
                .metadata(json!({
                    "kind": "file",
                    "parent_id": item.parent_id,
                    "size": item.size,
                    "extension": item.extension,
                })),
        );
        self.events.send(Event::Created {
            id: item.id,
            owner: item.owner_id.clone(),
        });
        Ok(item)
    }

    pub fn rename(
        &self,
        actor: &Actor,
        id: ItemId,
        new_name: &str,
        expected_revision: Option<u64>,
    ) -> Result<Item> {
        let _commit = self.commit.lock();
        let item = self.live(id)?;
        if !can_mutate(actor, &item) {
            return Err(denied(actor, "rename", id));
        }
        let renamed = self
            .items
            .rename(id, new_name, expected_revision.or(Some(item.revision)))?;
        tracing::info!(%id, from = %item.name, to = %renamed.name, "item renamed");
        self.record(
            HistoryEntry::new(id, ActionType::Rename, actor)
                .values(Some(item.name), Some(renamed.name.clone())),
        );
        self.events.send(Event::Renamed {
            id,
            name: renamed.name.clone(),
        });
        Ok(renamed)
    }

    /// Move an item under `new_parent`, or to the owner's root with `None`.
    pub fn move_item(
        &self,
        actor: &Actor,
        id: ItemId,
        new_parent: Option<ItemId>,
        expected_revision: Option<u64>,
    ) -> Result<Item> {
        let _commit = self.commit.lock();
        let item = self.live(id)?;
        if !can_mutate(actor, &item) {
            return Err(denied(actor, "move", id));
        }
        if let Some(pid) = new_parent {
            if let Ok(parent) = self.items.get(pid) {
                if !can_mutate(actor, &parent) {
                    return Err(denied(actor, "move into", pid));
                }
            }
        }
        let moved = self
            .items
            .move_item(id, new_parent, expected_revision.or(Some(item.revision)))?;
        tracing::info!(%id, from = ?item.parent_id, to = ?moved.parent_id, "item moved");
        self.record(
            HistoryEntry::new(id, ActionType::Move, actor)
                .values(
                    item.parent_id.map(|p| p.to_string()),
                    moved.parent_id.map(|p| p.to_string()),
                )
                .metadata(json!({ "name": moved.name })),
        );
        self.events.send(Event::Moved {
            id,
            new_parent: moved.parent_id,
        });
        Ok(moved)
    }

    /// Soft-delete an item and its subtree. Grants on the subtree stay
    /// active but stop resolving. Returns every id that was marked.
    pub fn delete(
        &self,
        actor: &Actor,
        id: ItemId,
        expected_revision: Option<u64>,
    ) -> Result<Vec<ItemId>> {
        let _commit = self.commit.lock();
        let item = self.live(id)?;
        if !can_mutate(actor, &item) {
            return Err(denied(actor, "delete", id));
        }
        let marked = self
            .items
            .soft_delete(id, expected_revision.or(Some(item.revision)))?;
        tracing::info!(%id, cascade = marked.len(), "item deleted");
        self.record(
            HistoryEntry::new(id, ActionType::Delete, actor)
                .values(Some(item.name), None)
                .metadata(json!({ "kind": item.kind.as_str(), "cascade": marked.len() })),
        );
        self.events.send(Event::Deleted {
            id,
            cascade: marked.len(),
        });
        Ok(marked)
    }

    /// Grant `recipient` read access to an item and, for a folder, to
    /// everything beneath it.
    pub fn share(
        &self,
        actor: &Actor,
        id: ItemId,
        recipient: &str,
        recipient_type: Option<Role>,
    ) -> Result<ShareOutcome> {
        acting_owner(actor)?;
        let _commit = self.commit.lock();
        let item = self.live(id)?;
        if !can_share(actor, &item) {
            return Err(denied(actor, "share", id));
        }
        let (grant, created) =
            self.ledger
                .grant(&item, &item.owner_id, recipient, recipient_type)?;
        if created {
            tracing::info!(%id, grant = %grant.id, to = %grant.granted_to, "item shared");
            self.record(
                HistoryEntry::new(id, ActionType::Share, actor)
                    .shared_with(grant.granted_to.clone(), grant.granted_to_type)
                    .metadata(json!({ "grant_id": grant.id })),
            );
            self.events.send(Event::Shared {
                id,
                grant: grant.id,
                principal: grant.granted_to.clone(),
            });
        }
        Ok(ShareOutcome { grant, created })
    }

    pub fn revoke(&self, actor: &Actor, grant_id: Uuid) -> Result<ShareGrant> {
        let owner = acting_owner(actor)?;
        let _commit = self.commit.lock();
        let revoked = self.ledger.revoke(grant_id, owner)?;
        tracing::info!(grant = %grant_id, item = %revoked.item_id, "grant revoked");
        self.record(
            HistoryEntry::new(revoked.item_id, ActionType::Revoke, actor)
                .shared_with(revoked.granted_to.clone(), revoked.granted_to_type)
                .metadata(json!({ "grant_id": grant_id })),
        );
        self.events.send(Event::Revoked {
            id: revoked.item_id,
            grant: grant_id,
            principal: revoked.granted_to.clone(),
        });
        Ok(revoked)
    }

    pub fn delete_many(&self, actor: &Actor, ids: &[ItemId]) -> Vec<ItemOutcome<Vec<ItemId>>> {
        ids.iter()
            .map(|id| ItemOutcome {
                item_id: *id,
                result: self.delete(actor, *id, None),
            })
            .collect()
    }

    pub fn share_many(
        &self,
        actor: &Actor,
        ids: &[ItemId],
        recipient: &str,
        recipient_type: Option<Role>,
    ) -> Vec<ItemOutcome<ShareOutcome>> {
        ids.iter()
            .map(|id| ItemOutcome {
                item_id: *id,
                result: self.share(actor, *id, recipient, recipient_type),
            })
            .collect()
    }

    /// Children of `parent_id`, or the actor's own root level. A recipient
    /// may list inside any folder a grant covers.
    pub fn list_items(&self, actor: &Actor, parent_id: Option<ItemId>) -> Result<Vec<Item>> {
        let Some(owner) = actor.acting_owner() else {
            return Ok(Vec::new());
        };
        match parent_id {
            None => Ok(self.items.list_children(owner, None, false)),
            Some(pid) => {
                let parent = self.get(actor, pid)?;
                if !parent.is_folder() {
                    return Err(Error::InvalidParent(format!("{} is not a folder", parent.name)));
                }
                let shared = parent.owner_id != owner;
                Ok(self.items.list_children(owner, Some(pid), shared))
            }
        }
    }

    /// Trail from the root to the item's parent, cut down to the part the
    /// actor can see. A recipient's trail starts at the shared folder.
    pub fn breadcrumbs(&self, actor: &Actor, id: ItemId) -> Result<Vec<Breadcrumb>> {
        let grants = self.ledger.active_grants_for(actor.id());
        self.items.view(|view| {
            self.check_read(&view, actor, id, &grants)?;
            let resolver = view.resolver();
            let chain = resolver.ancestors(id)?;
            // nearest first; stop at the first ancestor the actor cannot read
            let mut visible = Vec::new();
            for (depth, ancestor) in chain.iter().enumerate() {
                if !can_read(actor, ancestor, &chain[depth + 1..], &grants) {
                    break;
                }
                visible.push(Breadcrumb {
                    id: ancestor.id,
                    name: ancestor.name.clone(),
                });
            }
            visible.reverse();
            Ok(visible)
        })
    }

    /// Grants addressed to the actor. Receptionists never read through
    /// grants, so nothing is listed for them.
    pub fn shared_with_me(&self, actor: &Actor) -> Vec<SharedGroup> {
        if matches!(actor, Actor::Receptionist { .. }) {
            return Vec::new();
        }
        self.ledger.list_shared_with_me(actor.id(), &self.items)
    }

    /// Active grants the actor (or the doctor they act for) has issued on
    /// items that still exist.
    pub fn shared_by_me(&self, actor: &Actor) -> Vec<SharedItem> {
        let Some(owner) = actor.acting_owner() else {
            return Vec::new();
        };
        let grants = self.ledger.list_shared_by_me(owner);
        self.items.view(|view| {
            grants
                .into_iter()
                .filter_map(|grant| {
                    let item = view.get(grant.item_id)?;
                    match view.is_effectively_deleted(item.id) {
                        Ok(false) => Some(SharedItem {
                            item: item.clone(),
                            grant,
                        }),
                        Ok(true) => None,
                        Err(err) => {
                            tracing::warn!(item = %item.id, grant = %grant.id, %err, "skipping shared item with a broken ancestry");
                            None
                        }
                    }
                })
                .collect()
        })
    }

    /// Audit trail of an item, oldest first. The owner keeps access after
    /// the item is deleted; anyone else needs read access to the live item.
    pub fn history(&self, actor: &Actor, id: ItemId) -> Result<Vec<HistoryEntry>> {
        let item = self.items.get(id)?;
        if !can_mutate(actor, &item) {
            self.get(actor, id)?;
        }
        Ok(self.history.entries_for(id))
    }

    /// Whether `actor` should hear about changes to `id`: its owner (even
    /// once deleted) or anyone who can read it.
    pub fn observes(&self, actor: &Actor, id: ItemId) -> bool {
        match self.items.get(id) {
            Ok(item) if can_mutate(actor, &item) => true,
            Ok(_) => self.get(actor, id).is_ok(),
            Err(_) => false,
        }
    }

    /// Files to deliver for `id`: the file itself, or every live file under
    /// a folder with its path relative to the folder's parent.
    pub fn download_plan(&self, actor: &Actor, id: ItemId) -> Result<Vec<DownloadEntry>> {
        let grants = self.ledger.active_grants_for(actor.id());
        self.items.view(|view| {
            let root = self.check_read(&view, actor, id, &grants)?;
            let subtree = view.live_subtree(root.id);
            let mut paths: HashMap<ItemId, String> = HashMap::new();
            let mut out = Vec::new();
            // breadth-first, so a parent's path is known before its children
            for item in subtree {
                let path = match item.parent_id.and_then(|p| paths.get(&p)) {
                    Some(parent_path) if item.id != root.id => {
                        format!("{parent_path}/{}", item.name)
                    }
                    _ => item.name.clone(),
                };
                if let Some(file_ref) = item.file_ref.clone().filter(|_| !item.is_folder()) {
                    out.push(DownloadEntry {
                        item_id: item.id,
                        path: path.clone(),
                        file_ref,
                        size: item.size,
                    });
                }
                paths.insert(item.id, path);
            }
            Ok(out)
        })
    }

    pub fn download_many(
        &self,
        actor: &Actor,
        ids: &[ItemId],
    ) -> Vec<ItemOutcome<Vec<DownloadEntry>>> {
        ids.iter()
            .map(|id| ItemOutcome {
                item_id: *id,
                result: self.download_plan(actor, *id),
            })
            .collect()
    }
}
