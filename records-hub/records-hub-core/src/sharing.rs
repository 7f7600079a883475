//! Share grants and the views derived from them.
//!
//! A grant on a folder is never copied onto its descendants; coverage is
//! computed when a view is read, so items added to a shared folder later
//! are visible to the recipient and deleted ones drop out.

use crate::error::{Error, Result};
use crate::model::{Item, ItemId, Role, ShareGrant};
use crate::storage::disk::RecordDir;
use crate::storage::{sort_for_display, ItemStore, StoreConfig};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Everything one owner has shared with a recipient.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SharedGroup {
    pub granted_by: String,
    /// Items the grants point at directly.
    pub roots: Vec<Item>,
    /// Roots plus every live descendant of a shared folder.
    pub items: Vec<Item>,
    pub grants: Vec<ShareGrant>,
}

pub struct SharingLedger {
    grants: RwLock<HashMap<Uuid, ShareGrant>>,
    disk: Option<RecordDir>,
}

impl SharingLedger {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let (grants, disk) = match config.grants_dir() {
            Some(dir) => {
                let disk = RecordDir::open(dir)?;
                let grants = disk
                    .load_all::<ShareGrant>()?
                    .into_iter()
                    .map(|g| (g.id, g))
                    .collect();
                (grants, Some(disk))
            }
            None => (HashMap::new(), None),
        };
        Ok(Self {
            grants: RwLock::new(grants),
            disk,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    fn persist(&self, grant: &ShareGrant) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.write(grant.id, grant),
            None => Ok(()),
        }
    }

    /// Grant `granted_to` read access to `item`. Returns the grant and
    /// whether it was newly created; an active grant for the same pair is
    /// returned unchanged.
    pub fn grant(
        &self,
        item: &Item,
        granted_by: &str,
        granted_to: &str,
        granted_to_type: Option<Role>,
    ) -> Result<(ShareGrant, bool)> {
        if item.owner_id != granted_by {
            return Err(Error::NotOwner(item.id));
        }
        let granted_to = granted_to.trim();
        if granted_to.is_empty() {
            return Err(Error::InvalidName("recipient id must not be empty".into()));
        }
        if granted_to == granted_by {
            return Err(Error::SelfShare);
        }

        let mut grants = self.grants.write();
        if let Some(existing) = grants
            .values()
            .find(|g| g.is_active() && g.item_id == item.id && g.granted_to == granted_to)
        {
            return Ok((existing.clone(), false));
        }
        let grant = ShareGrant {
            id: Uuid::new_v4(),
            item_id: item.id,
            granted_by: granted_by.to_string(),
            granted_to: granted_to.to_string(),
            granted_to_type,
            created_at: Utc::now(),
            revoked_at: None,
            revoked_by: None,
        };
        self.persist(&grant)?;
        grants.insert(grant.id, grant.clone());
        Ok((grant, true))
    }

    /// Revoke an active grant. Only the granting owner may do so.
    pub fn revoke(&self, grant_id: Uuid, revoked_by: &str) -> Result<ShareGrant> {
        let mut grants = self.grants.write();
        let grant = match grants.get(&grant_id) {
            Some(g) if g.is_active() => g,
            _ => return Err(Error::NotFound(grant_id)),
        };
        if grant.granted_by != revoked_by {
            return Err(Error::NotAuthorized(format!(
                "grant {grant_id} was not issued by {revoked_by}"
            )));
        }
        let mut revoked = grant.clone();
        revoked.revoked_at = Some(Utc::now());
        revoked.revoked_by = Some(revoked_by.to_string());
        self.persist(&revoked)?;
        grants.insert(grant_id, revoked.clone());
        Ok(revoked)
    }

    pub fn get(&self, grant_id: Uuid) -> Result<ShareGrant> {
        self.grants
            .read()
            .get(&grant_id)
            .cloned()
            .ok_or(Error::NotFound(grant_id))
    }

    /// Active grants addressed to `user_id`.
    pub fn active_grants_for(&self, user_id: &str) -> Vec<ShareGrant> {
        let mut out: Vec<ShareGrant> = self
            .grants
            .read()
            .values()
            .filter(|g| g.is_active() && g.granted_to == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|g| g.created_at);
        out
    }

    /// Every grant ever made on `item_id`, revoked ones included.
    pub fn grants_for_item(&self, item_id: ItemId) -> Vec<ShareGrant> {
        let mut out: Vec<ShareGrant> = self
            .grants
            .read()
            .values()
            .filter(|g| g.item_id == item_id)
            .cloned()
            .collect();
        out.sort_by_key(|g| g.created_at);
        out
    }

    /// Active grants issued by `user_id`.
    pub fn list_shared_by_me(&self, user_id: &str) -> Vec<ShareGrant> {
        let mut out: Vec<ShareGrant> = self
            .grants
            .read()
            .values()
            .filter(|g| g.is_active() && g.granted_by == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|g| g.created_at);
        out
    }

    /// Items shared with `user_id`, grouped by the owner who shared them.
    /// Grants on items that are deleted (directly or through an ancestor)
    /// contribute nothing.
    pub fn list_shared_with_me(&self, user_id: &str, items: &ItemStore) -> Vec<SharedGroup> {
        let grants = self.active_grants_for(user_id);
        let mut groups: Vec<SharedGroup> = Vec::new();

        items.view(|view| {
            let mut seen: HashMap<String, HashSet<ItemId>> = HashMap::new();
            for grant in grants {
                let Some(root) = view.get(grant.item_id) else {
                    continue;
                };
                match view.is_effectively_deleted(root.id) {
                    Ok(false) => {}
                    Ok(true) => continue,
                    Err(err) => {
                        tracing::warn!(item = %root.id, grant = %grant.id, %err, "skipping shared item with a broken ancestry");
                        continue;
                    }
                }
                let idx = match groups.iter().position(|g| g.granted_by == grant.granted_by) {
                    Some(idx) => idx,
                    None => {
                        groups.push(SharedGroup {
                            granted_by: grant.granted_by.clone(),
                            roots: Vec::new(),
                            items: Vec::new(),
                            grants: Vec::new(),
                        });
                        groups.len() - 1
                    }
                };
                let group = &mut groups[idx];
                let seen_ids = seen.entry(grant.granted_by.clone()).or_default();
                if !group.roots.iter().any(|r| r.id == root.id) {
                    group.roots.push(root.clone());
                }
                for item in view.live_subtree(root.id) {
                    if seen_ids.insert(item.id) {
                        group.items.push(item.clone());
                    }
                }
                group.grants.push(grant);
            }
        });

        for group in &mut groups {
            sort_for_display(&mut group.roots);
            sort_for_display(&mut group.items);
        }
        groups.sort_by(|a, b| a.granted_by.cmp(&b.granted_by));
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewItem;

    struct Fixture {
        items: ItemStore,
        ledger: SharingLedger,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                items: ItemStore::in_memory(),
                ledger: SharingLedger::in_memory(),
            }
        }

        fn folder(&self, owner: &str, name: &str, parent: Option<ItemId>) -> Item {
            self.items
                .create(NewItem::folder(owner, Role::Doctor, name, parent))
                .unwrap()
        }

        fn file(&self, owner: &str, name: &str, parent: Option<ItemId>) -> Item {
            self.items
                .create(NewItem::file(owner, Role::Doctor, name, parent, "ref", 1, None))
                .unwrap()
        }
    }

    #[test]
    fn grant_is_idempotent_while_active() {
        let fx = Fixture::new();
        let labs = fx.folder("d1", "Labs", None);
        let (first, created) = fx.ledger.grant(&labs, "d1", "p1", Some(Role::Patient)).unwrap();
        assert!(created);
        let (again, created) = fx.ledger.grant(&labs, "d1", "p1", None).unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);
        assert_eq!(fx.ledger.list_shared_by_me("d1").len(), 1);
    }

    #[test]
    fn grant_requires_owner_and_other_recipient() {
        let fx = Fixture::new();
        let labs = fx.folder("d1", "Labs", None);
        assert!(matches!(
            fx.ledger.grant(&labs, "d2", "p1", None),
            Err(Error::NotOwner(_))
        ));
        assert!(matches!(
            fx.ledger.grant(&labs, "d1", "d1", None),
            Err(Error::SelfShare)
        ));
    }

    #[test]
    fn revoke_then_regrant_issues_new_grant() {
        let fx = Fixture::new();
        let labs = fx.folder("d1", "Labs", None);
        let (first, _) = fx.ledger.grant(&labs, "d1", "p1", None).unwrap();

        assert!(matches!(
            fx.ledger.revoke(first.id, "p1"),
            Err(Error::NotAuthorized(_))
        ));
        let revoked = fx.ledger.revoke(first.id, "d1").unwrap();
        assert!(revoked.revoked_at.is_some());
        assert_eq!(revoked.revoked_by.as_deref(), Some("d1"));
        assert!(matches!(fx.ledger.revoke(first.id, "d1"), Err(Error::NotFound(_))));
        assert!(fx.ledger.active_grants_for("p1").is_empty());

        let (second, created) = fx.ledger.grant(&labs, "d1", "p1", None).unwrap();
        assert!(created);
        assert_ne!(first.id, second.id);
        assert_eq!(fx.ledger.grants_for_item(labs.id).len(), 2);
    }

    #[test]
    fn shared_view_expands_folders_at_read_time() {
        let fx = Fixture::new();
        let labs = fx.folder("d1", "Labs", None);
        let cbc = fx.file("d1", "cbc.pdf", Some(labs.id));
        let scans = fx.folder("d2", "Scans", None);
        fx.ledger.grant(&labs, "d1", "p1", None).unwrap();
        fx.ledger.grant(&scans, "d2", "p1", None).unwrap();

        // added after the grant, still covered
        let lipids = fx.file("d1", "lipids.pdf", Some(labs.id));

        let groups = fx.ledger.list_shared_with_me("p1", &fx.items);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].granted_by, "d1");
        assert_eq!(groups[0].roots.len(), 1);
        let ids: Vec<_> = groups[0].items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![labs.id, cbc.id, lipids.id]);
        assert_eq!(groups[1].granted_by, "d2");
    }

    #[test]
    fn deleted_items_leave_the_shared_view() {
        let fx = Fixture::new();
        let labs = fx.folder("d1", "Labs", None);
        let cbc = fx.file("d1", "cbc.pdf", Some(labs.id));
        let notes = fx.file("d1", "notes.pdf", Some(labs.id));
        fx.ledger.grant(&labs, "d1", "p1", None).unwrap();
        fx.ledger.grant(&cbc, "d1", "p1", None).unwrap();

        fx.items.soft_delete(notes.id, None).unwrap();
        let groups = fx.ledger.list_shared_with_me("p1", &fx.items);
        assert_eq!(groups[0].items.len(), 2);
        assert_eq!(groups[0].roots.len(), 2);

        fx.items.soft_delete(labs.id, None).unwrap();
        assert!(fx.ledger.list_shared_with_me("p1", &fx.items).is_empty());
        // grants are not revoked by a delete
        assert_eq!(fx.ledger.active_grants_for("p1").len(), 2);
    }

    #[test]
    fn grants_survive_reopen() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = StoreConfig::persistent(tempdir.path());
        let items = ItemStore::open(&config).unwrap();
        let labs = items
            .create(NewItem::folder("d1", Role::Doctor, "Labs", None))
            .unwrap();
        let (kept, revoked) = {
            let ledger = SharingLedger::open(&config).unwrap();
            let (kept, _) = ledger.grant(&labs, "d1", "p1", None).unwrap();
            let (gone, _) = ledger.grant(&labs, "d1", "p2", None).unwrap();
            ledger.revoke(gone.id, "d1").unwrap();
            (kept, gone)
        };

        let ledger = SharingLedger::open(&config).unwrap();
        assert_eq!(ledger.get(kept.id).unwrap(), kept);
        assert!(!ledger.get(revoked.id).unwrap().is_active());
        assert_eq!(ledger.list_shared_by_me("d1").len(), 1);
    }
}
