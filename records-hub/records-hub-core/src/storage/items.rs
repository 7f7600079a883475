//! The item repository: folder and file nodes keyed by id, with a child
//! index per folder.
//!
//! Every public call takes the tree lock exactly once, so a multi-item
//! change such as a cascade delete is observed by readers either entirely
//! or not at all.

use crate::error::{Error, Result};
use crate::model::{validate_name, Breadcrumb, Item, ItemId, ItemKind, NewItem};
use crate::paths::PathResolver;
use crate::storage::disk::RecordDir;
use crate::storage::StoreConfig;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Tree {
    items: HashMap<ItemId, Item>,
    children: HashMap<ItemId, Vec<ItemId>>,
}

impl Tree {
    fn insert(&mut self, item: Item) {
        if let Some(pid) = item.parent_id {
            let kids = self.children.entry(pid).or_default();
            if !kids.contains(&item.id) {
                kids.push(item.id);
            }
        }
        self.items.insert(item.id, item);
    }

    fn detach(&mut self, id: ItemId, parent: Option<ItemId>) {
        if let Some(pid) = parent {
            if let Some(kids) = self.children.get_mut(&pid) {
                kids.retain(|k| *k != id);
            }
        }
    }

    fn resolver(&self) -> PathResolver<'_> {
        PathResolver::new(&self.items, &self.children)
    }

    /// Live (non-deleted) siblings that would sit next to an item named
    /// `name` under `parent` in `owner`'s tree.
    fn name_taken(
        &self,
        owner: &str,
        parent: Option<ItemId>,
        name: &str,
        except: Option<ItemId>,
    ) -> bool {
        let clash = |item: &Item| {
            Some(item.id) != except
                && !item.is_deleted()
                && item.owner_id == owner
                && item.name == name
        };
        match parent {
            Some(pid) => self
                .children
                .get(&pid)
                .into_iter()
                .flatten()
                .filter_map(|id| self.items.get(id))
                .any(clash),
            None => self
                .items
                .values()
                .filter(|i| i.parent_id.is_none())
                .any(clash),
        }
    }

    /// Check that `parent` may hold an item of `owner`.
    fn check_parent(&self, owner: &str, parent: ItemId) -> Result<()> {
        let Some(folder) = self.items.get(&parent) else {
            return Err(Error::InvalidParent(format!("parent {parent} does not exist")));
        };
        if !folder.is_folder() {
            return Err(Error::InvalidParent(format!("{} is not a folder", folder.name)));
        }
        if folder.is_deleted() {
            return Err(Error::InvalidParent(format!("{} has been deleted", folder.name)));
        }
        if folder.owner_id != owner {
            return Err(Error::InvalidParent(format!(
                "{} belongs to another owner",
                folder.name
            )));
        }
        Ok(())
    }

    fn live(&self, id: ItemId) -> Result<&Item> {
        match self.items.get(&id) {
            Some(item) if !item.is_deleted() => Ok(item),
            _ => Err(Error::NotFound(id)),
        }
    }
}

fn check_revision(item: &Item, expected: Option<u64>) -> Result<()> {
    match expected {
        Some(rev) if rev != item.revision => Err(Error::Conflict {
            id: item.id,
            expected: rev,
            found: item.revision,
        }),
        _ => Ok(()),
    }
}

/// Order used by every listing: folders before files, then alphabetical
/// (case-insensitive, exact name breaks ties).
pub fn sort_for_display(items: &mut [Item]) {
    items.sort_by(|a, b| {
        let kind_rank = |i: &Item| match i.kind {
            ItemKind::Folder => 0,
            ItemKind::File => 1,
        };
        kind_rank(a)
            .cmp(&kind_rank(b))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Read-only access to a consistent snapshot of the tree.
pub struct TreeView<'a> {
    tree: &'a Tree,
}

impl<'a> TreeView<'a> {
    pub fn get(&self, id: ItemId) -> Option<&'a Item> {
        self.tree.items.get(&id)
    }

    pub fn resolver(&self) -> PathResolver<'a> {
        self.tree.resolver()
    }

    /// Whether the item or any ancestor carries a deletion mark.
    pub fn is_effectively_deleted(&self, id: ItemId) -> Result<bool> {
        let item = self.get(id).ok_or(Error::NotFound(id))?;
        if item.is_deleted() {
            return Ok(true);
        }
        Ok(self.resolver().ancestors(id)?.iter().any(|a| a.is_deleted()))
    }

    /// The live item and its live descendants, breadth-first.
    pub fn live_subtree(&self, id: ItemId) -> Vec<&'a Item> {
        let Some(root) = self.get(id).filter(|i| !i.is_deleted()) else {
            return Vec::new();
        };
        let mut out = vec![root];
        out.extend(
            self.resolver()
                .descendants(id)
                .into_iter()
                .filter_map(|d| self.get(d))
                .filter(|i| !i.is_deleted()),
        );
        out
    }
}

pub struct ItemStore {
    tree: RwLock<Tree>,
    disk: Option<RecordDir>,
}

impl ItemStore {
    /// Open the store, loading any items persisted under the data directory.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut tree = Tree::default();
        let disk = match config.items_dir() {
            Some(dir) => {
                let disk = RecordDir::open(dir)?;
                for item in disk.load_all::<Item>()? {
                    tree.insert(item);
                }
                Some(disk)
            }
            None => None,
        };
        tracing::debug!(items = tree.items.len(), "item store opened");
        Ok(Self {
            tree: RwLock::new(tree),
            disk,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            disk: None,
        }
    }

    fn persist<'i>(&self, items: impl IntoIterator<Item = &'i Item>) -> Result<()> {
        if let Some(disk) = &self.disk {
            for item in items {
                disk.write(item.id, item)?;
            }
        }
        Ok(())
    }

    /// Write a batch of records as a unit. If any write fails, the ones
    /// already written are put back to their `previous` state.
    fn persist_all(&self, previous: &[Item], updated: &[Item]) -> Result<()> {
        let Some(disk) = &self.disk else {
            return Ok(());
        };
        for (done, item) in updated.iter().enumerate() {
            if let Err(err) = disk.write(item.id, item) {
                for prior in &previous[..done] {
                    if let Err(undo) = disk.write(prior.id, prior) {
                        tracing::error!(id = %prior.id, %undo, "failed to restore record after a partial write");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run `f` against a consistent snapshot of the tree.
    pub fn view<R>(&self, f: impl FnOnce(TreeView<'_>) -> R) -> R {
        let tree = self.tree.read();
        f(TreeView { tree: &tree })
    }

    pub fn len(&self) -> usize {
        self.tree.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create(&self, new: NewItem) -> Result<Item> {
        let name = validate_name(&new.name)?;
        let mut tree = self.tree.write();
        if let Some(pid) = new.parent_id {
            tree.check_parent(&new.owner_id, pid)?;
        }
        if tree.name_taken(&new.owner_id, new.parent_id, &name, None) {
            return Err(Error::NameConflict(name));
        }
        let now = Utc::now();
        let is_file = new.kind == ItemKind::File;
        let item = Item {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            owner_type: new.owner_type,
            name,
            kind: new.kind,
            parent_id: new.parent_id,
            file_ref: new.file_ref.filter(|_| is_file),
            size: new.size.filter(|_| is_file),
            extension: new.extension.filter(|_| is_file),
            category: new.category,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            revision: 1,
        };
        self.persist([&item])?;
        tree.insert(item.clone());
        Ok(item)
    }

    /// Fetch an item, including soft-deleted ones.
    pub fn get(&self, id: ItemId) -> Result<Item> {
        self.tree
            .read()
            .items
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    /// Live children of `parent` (or the owner's root level), sorted for
    /// display. With `include_shared`, the children of a given parent are
    /// returned whoever owns them.
    pub fn list_children(
        &self,
        owner_id: &str,
        parent_id: Option<ItemId>,
        include_shared: bool,
    ) -> Vec<Item> {
        let tree = self.tree.read();
        let mut out: Vec<Item> = match parent_id {
            None => tree
                .items
                .values()
                .filter(|i| i.parent_id.is_none() && i.owner_id == owner_id && !i.is_deleted())
                .cloned()
                .collect(),
            Some(pid) => {
                if tree.items.get(&pid).map_or(true, |p| p.is_deleted()) {
                    return Vec::new();
                }
                tree.children
                    .get(&pid)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| tree.items.get(id))
                    .filter(|i| !i.is_deleted() && (include_shared || i.owner_id == owner_id))
                    .cloned()
                    .collect()
            }
        };
        sort_for_display(&mut out);
        out
    }

    pub fn rename(&self, id: ItemId, new_name: &str, expected: Option<u64>) -> Result<Item> {
        let name = validate_name(new_name)?;
        let mut tree = self.tree.write();
        let item = tree.live(id)?;
        check_revision(item, expected)?;
        if tree.name_taken(&item.owner_id, item.parent_id, &name, Some(id)) {
            return Err(Error::NameConflict(name));
        }
        let mut updated = item.clone();
        updated.name = name;
        updated.updated_at = Utc::now();
        updated.revision += 1;
        self.persist([&updated])?;
        tree.items.insert(id, updated.clone());
        Ok(updated)
    }

    /// Reparent an item. `None` moves it to the owner's root level.
    pub fn move_item(
        &self,
        id: ItemId,
        new_parent: Option<ItemId>,
        expected: Option<u64>,
    ) -> Result<Item> {
        let mut tree = self.tree.write();
        let item = tree.live(id)?;
        check_revision(item, expected)?;
        if let Some(pid) = new_parent {
            if pid != id {
                tree.check_parent(&item.owner_id, pid)?;
            }
            if tree.resolver().would_cycle(id, pid)? {
                return Err(Error::CycleDetected { item: id, parent: pid });
            }
        }
        if tree.name_taken(&item.owner_id, new_parent, &item.name, Some(id)) {
            return Err(Error::NameConflict(item.name.clone()));
        }
        let old_parent = item.parent_id;
        let mut updated = item.clone();
        updated.parent_id = new_parent;
        updated.updated_at = Utc::now();
        updated.revision += 1;
        self.persist([&updated])?;
        tree.detach(id, old_parent);
        tree.insert(updated.clone());
        Ok(updated)
    }

    /// Mark the item and every live descendant deleted. Returns the ids that
    /// were marked, the item itself first.
    pub fn soft_delete(&self, id: ItemId, expected: Option<u64>) -> Result<Vec<ItemId>> {
        let mut tree = self.tree.write();
        let item = tree.live(id)?;
        check_revision(item, expected)?;
        let now = Utc::now();
        let mut previous = Vec::new();
        let mut marked = Vec::new();
        let ids = std::iter::once(id).chain(tree.resolver().descendants(id));
        for target in ids {
            if let Some(node) = tree.items.get(&target).filter(|n| !n.is_deleted()) {
                previous.push(node.clone());
                let mut node = node.clone();
                node.deleted_at = Some(now);
                node.updated_at = now;
                node.revision += 1;
                marked.push(node);
            }
        }
        self.persist_all(&previous, &marked)?;
        let ids = marked.iter().map(|n| n.id).collect();
        for node in marked {
            tree.items.insert(node.id, node);
        }
        Ok(ids)
    }

    pub fn breadcrumbs(&self, id: ItemId) -> Result<Vec<Breadcrumb>> {
        self.tree.read().resolver().breadcrumbs(id)
    }

    pub fn would_cycle(&self, id: ItemId, proposed_parent: ItemId) -> Result<bool> {
        self.tree.read().resolver().would_cycle(id, proposed_parent)
    }

    /// Ancestors of the item, nearest first.
    pub fn ancestors(&self, id: ItemId) -> Result<Vec<Item>> {
        let tree = self.tree.read();
        let out = tree.resolver().ancestors(id)?.into_iter().cloned().collect();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn folder(store: &ItemStore, owner: &str, name: &str, parent: Option<ItemId>) -> Item {
        store
            .create(NewItem::folder(owner, Role::Doctor, name, parent))
            .unwrap()
    }

    fn file(store: &ItemStore, owner: &str, name: &str, parent: Option<ItemId>) -> Item {
        store
            .create(NewItem::file(
                owner,
                Role::Doctor,
                name,
                parent,
                format!("blob-{name}"),
                10,
                Some("pdf".into()),
            ))
            .unwrap()
    }

    #[test]
    fn create_rejects_bad_parents() {
        let store = ItemStore::in_memory();
        let labs = folder(&store, "d1", "Labs", None);
        let cbc = file(&store, "d1", "cbc.pdf", Some(labs.id));

        let under_file = store.create(NewItem::folder("d1", Role::Doctor, "x", Some(cbc.id)));
        assert!(matches!(under_file, Err(Error::InvalidParent(_))));

        let foreign = store.create(NewItem::folder("d2", Role::Doctor, "x", Some(labs.id)));
        assert!(matches!(foreign, Err(Error::InvalidParent(_))));

        let missing = store.create(NewItem::folder("d1", Role::Doctor, "x", Some(Uuid::new_v4())));
        assert!(matches!(missing, Err(Error::InvalidParent(_))));

        store.soft_delete(labs.id, None).unwrap();
        let deleted = store.create(NewItem::folder("d1", Role::Doctor, "x", Some(labs.id)));
        assert!(matches!(deleted, Err(Error::InvalidParent(_))));
    }

    #[test]
    fn folders_never_carry_file_fields() {
        let store = ItemStore::in_memory();
        let mut new = NewItem::folder("d1", Role::Doctor, "Labs", None);
        new.file_ref = Some("stray".into());
        new.size = Some(3);
        let item = store.create(new).unwrap();
        assert_eq!(item.file_ref, None);
        assert_eq!(item.size, None);
        assert_eq!(item.revision, 1);
    }

    #[test]
    fn sibling_names_must_be_unique_per_owner() {
        let store = ItemStore::in_memory();
        let labs = folder(&store, "d1", "Labs", None);
        let dup = store.create(NewItem::folder("d1", Role::Doctor, "Labs", None));
        assert!(matches!(dup, Err(Error::NameConflict(_))));

        // another owner's root is a different namespace
        folder(&store, "d2", "Labs", None);

        // a deleted sibling frees the name
        store.soft_delete(labs.id, None).unwrap();
        folder(&store, "d1", "Labs", None);
    }

    #[test]
    fn list_children_sorts_folders_first_then_name() {
        let store = ItemStore::in_memory();
        let root = folder(&store, "d1", "root", None);
        file(&store, "d1", "b.pdf", Some(root.id));
        folder(&store, "d1", "Zeta", Some(root.id));
        file(&store, "d1", "A.pdf", Some(root.id));
        folder(&store, "d1", "alpha", Some(root.id));

        let names: Vec<_> = store
            .list_children("d1", Some(root.id), false)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["alpha", "Zeta", "A.pdf", "b.pdf"]);

        assert!(store.list_children("p1", Some(root.id), false).is_empty());
        assert_eq!(store.list_children("p1", Some(root.id), true).len(), 4);
        assert_eq!(store.list_children("d1", None, false).len(), 1);
    }

    #[test]
    fn rename_checks_revision_and_conflicts() {
        let store = ItemStore::in_memory();
        let a = folder(&store, "d1", "A", None);
        folder(&store, "d1", "C", None);

        let renamed = store.rename(a.id, "B", Some(a.revision)).unwrap();
        assert_eq!(renamed.name, "B");
        assert_eq!(renamed.revision, a.revision + 1);

        let stale = store.rename(a.id, "D", Some(a.revision));
        assert!(matches!(stale, Err(Error::Conflict { .. })));

        let clash = store.rename(a.id, "C", None);
        assert!(matches!(clash, Err(Error::NameConflict(_))));

        // same name as itself is fine
        assert!(store.rename(a.id, "B", None).is_ok());
        assert!(matches!(store.rename(a.id, " ", None), Err(Error::InvalidName(_))));
    }

    #[test]
    fn move_rejects_cycles_and_keeps_tree_intact() {
        let store = ItemStore::in_memory();
        let a = folder(&store, "d1", "a", None);
        let b = folder(&store, "d1", "b", Some(a.id));
        let c = folder(&store, "d1", "c", Some(b.id));

        assert!(matches!(
            store.move_item(a.id, Some(c.id), None),
            Err(Error::CycleDetected { .. })
        ));
        assert!(matches!(
            store.move_item(a.id, Some(a.id), None),
            Err(Error::CycleDetected { .. })
        ));
        assert_eq!(store.get(a.id).unwrap().parent_id, None);

        let moved = store.move_item(c.id, Some(a.id), None).unwrap();
        assert_eq!(moved.parent_id, Some(a.id));
        assert!(!store.would_cycle(c.id, a.id).unwrap());
        assert_eq!(store.list_children("d1", Some(b.id), false).len(), 0);
        assert_eq!(store.list_children("d1", Some(a.id), false).len(), 2);

        let to_root = store.move_item(c.id, None, None).unwrap();
        assert_eq!(to_root.parent_id, None);
        assert_eq!(store.list_children("d1", None, false).len(), 2);
    }

    #[test]
    fn move_into_file_or_foreign_folder_is_invalid() {
        let store = ItemStore::in_memory();
        let a = folder(&store, "d1", "a", None);
        let f = file(&store, "d1", "f.pdf", None);
        let theirs = folder(&store, "d2", "theirs", None);
        assert!(matches!(
            store.move_item(a.id, Some(f.id), None),
            Err(Error::InvalidParent(_))
        ));
        assert!(matches!(
            store.move_item(a.id, Some(theirs.id), None),
            Err(Error::InvalidParent(_))
        ));
    }

    #[test]
    fn soft_delete_cascades_and_hides_subtree() {
        let store = ItemStore::in_memory();
        let labs = folder(&store, "d1", "Labs", None);
        let y = folder(&store, "d1", "2024", Some(labs.id));
        let cbc = file(&store, "d1", "cbc.pdf", Some(y.id));

        let marked = store.soft_delete(labs.id, None).unwrap();
        assert_eq!(marked, vec![labs.id, y.id, cbc.id]);
        assert!(store.get(cbc.id).unwrap().is_deleted());
        assert!(store.list_children("d1", None, false).is_empty());
        assert!(store.list_children("d1", Some(y.id), false).is_empty());
        assert!(matches!(store.soft_delete(labs.id, None), Err(Error::NotFound(_))));
        assert!(matches!(store.rename(cbc.id, "x", None), Err(Error::NotFound(_))));

        // history needs the records, so breadcrumbs still resolve
        assert_eq!(store.breadcrumbs(cbc.id).unwrap().len(), 2);
    }

    #[test]
    fn items_survive_reopen() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = StoreConfig::persistent(tempdir.path());
        let (labs, cbc) = {
            let store = ItemStore::open(&config).unwrap();
            let labs = folder(&store, "d1", "Labs", None);
            let cbc = file(&store, "d1", "cbc.pdf", Some(labs.id));
            store.rename(cbc.id, "cbc-2024.pdf", None).unwrap();
            (labs, cbc)
        };

        let store = ItemStore::open(&config).unwrap();
        let reloaded = store.get(cbc.id).unwrap();
        assert_eq!(reloaded.name, "cbc-2024.pdf");
        assert_eq!(reloaded.parent_id, Some(labs.id));
        assert_eq!(store.list_children("d1", Some(labs.id), false).len(), 1);
        assert_eq!(
            store.breadcrumbs(cbc.id).unwrap(),
            vec![Breadcrumb {
                id: labs.id,
                name: "Labs".into()
            }]
        );
    }

    #[test]
    fn failed_cascade_leaves_no_partial_delete() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = StoreConfig::persistent(tempdir.path());
        let store = ItemStore::open(&config).unwrap();
        let labs = folder(&store, "d1", "Labs", None);
        let y2024 = folder(&store, "d1", "2024", Some(labs.id));
        let cbc = file(&store, "d1", "cbc.pdf", Some(y2024.id));

        // the last record of the cascade cannot be written
        let blocker = config
            .items_dir()
            .unwrap()
            .join(format!("{}.tmp", cbc.id));
        std::fs::create_dir(&blocker).unwrap();

        assert!(matches!(
            store.soft_delete(labs.id, None),
            Err(Error::StorageUnavailable(_))
        ));
        for id in [labs.id, y2024.id, cbc.id] {
            assert!(!store.get(id).unwrap().is_deleted());
        }
        drop(store);

        let reopened = ItemStore::open(&config).unwrap();
        for id in [labs.id, y2024.id, cbc.id] {
            let item = reopened.get(id).unwrap();
            assert!(!item.is_deleted());
            assert_eq!(item.revision, 1);
        }

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(reopened.soft_delete(labs.id, None).unwrap().len(), 3);
    }

    #[test]
    fn effective_deletion_follows_ancestors() {
        let store = ItemStore::in_memory();
        let labs = folder(&store, "d1", "Labs", None);
        let cbc = file(&store, "d1", "cbc.pdf", Some(labs.id));
        store.view(|v| assert!(!v.is_effectively_deleted(cbc.id).unwrap()));
        store.soft_delete(labs.id, None).unwrap();
        store.view(|v| {
            assert!(v.is_effectively_deleted(cbc.id).unwrap());
            assert!(v.live_subtree(labs.id).is_empty());
        });
    }
}
