//! Ancestry queries over the item forest.
//!
//! The resolver is the single authority for walking parent links. It never
//! truncates a chain: a parent id that does not resolve, or a walk longer
//! than the number of stored items, is reported as [`Error::Integrity`].

use crate::error::{Error, Result};
use crate::model::{Breadcrumb, Item, ItemId};
use std::collections::{HashMap, VecDeque};

pub struct PathResolver<'a> {
    items: &'a HashMap<ItemId, Item>,
    children: &'a HashMap<ItemId, Vec<ItemId>>,
}

impl<'a> PathResolver<'a> {
    pub fn new(
        items: &'a HashMap<ItemId, Item>,
        children: &'a HashMap<ItemId, Vec<ItemId>>,
    ) -> Self {
        Self { items, children }
    }

    fn item(&self, id: ItemId) -> Result<&'a Item> {
        self.items.get(&id).ok_or(Error::NotFound(id))
    }

    /// Ancestors of `id`, nearest first. The item itself is not included.
    pub fn ancestors(&self, id: ItemId) -> Result<Vec<&'a Item>> {
        let mut out = Vec::new();
        let mut current = self.item(id)?.parent_id;
        while let Some(pid) = current {
            if out.len() > self.items.len() {
                return Err(Error::Integrity(format!(
                    "parent chain of {id} does not terminate"
                )));
            }
            let parent = self.items.get(&pid).ok_or_else(|| {
                Error::Integrity(format!("item {id} has an ancestor {pid} that does not exist"))
            })?;
            out.push(parent);
            current = parent.parent_id;
        }
        Ok(out)
    }

    /// Trail from the root down to the item's parent. Empty for root-level
    /// items.
    pub fn breadcrumbs(&self, id: ItemId) -> Result<Vec<Breadcrumb>> {
        let mut trail: Vec<Breadcrumb> = self
            .ancestors(id)?
            .into_iter()
            .map(|a| Breadcrumb {
                id: a.id,
                name: a.name.clone(),
            })
            .collect();
        trail.reverse();
        Ok(trail)
    }

    /// Number of ancestors above `id`; zero at the root.
    pub fn depth(&self, id: ItemId) -> Result<usize> {
        Ok(self.ancestors(id)?.len())
    }

    /// Whether placing `id` under `proposed_parent` would close a loop.
    pub fn would_cycle(&self, id: ItemId, proposed_parent: ItemId) -> Result<bool> {
        if id == proposed_parent {
            return Ok(true);
        }
        self.item(proposed_parent)?;
        Ok(self
            .ancestors(proposed_parent)?
            .iter()
            .any(|ancestor| ancestor.id == id))
    }

    /// All descendants of `id` in breadth-first order, excluding `id`.
    pub fn descendants(&self, id: ItemId) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(kids) = self.children.get(&current) {
                for child in kids {
                    // a corrupted index must not spin forever
                    if *child == id || out.len() > self.items.len() {
                        continue;
                    }
                    out.push(*child);
                    queue.push_back(*child);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemKind, Role};
    use chrono::Utc;
    use uuid::Uuid;

    fn node(name: &str, parent: Option<ItemId>, kind: ItemKind) -> Item {
        Item {
            id: Uuid::new_v4(),
            owner_id: "d1".into(),
            owner_type: Role::Doctor,
            name: name.into(),
            kind,
            parent_id: parent,
            file_ref: None,
            size: None,
            extension: None,
            category: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            revision: 0,
        }
    }

    struct Fixture {
        items: HashMap<ItemId, Item>,
        children: HashMap<ItemId, Vec<ItemId>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                items: HashMap::new(),
                children: HashMap::new(),
            }
        }

        fn add(&mut self, name: &str, parent: Option<ItemId>, kind: ItemKind) -> ItemId {
            let item = node(name, parent, kind);
            let id = item.id;
            if let Some(pid) = parent {
                self.children.entry(pid).or_default().push(id);
            }
            self.items.insert(id, item);
            id
        }

        fn resolver(&self) -> PathResolver<'_> {
            PathResolver::new(&self.items, &self.children)
        }
    }

    #[test]
    fn breadcrumbs_run_from_root_to_parent() {
        let mut fx = Fixture::new();
        let labs = fx.add("Labs", None, ItemKind::Folder);
        let y2024 = fx.add("2024", Some(labs), ItemKind::Folder);
        let cbc = fx.add("cbc.pdf", Some(y2024), ItemKind::File);

        let names: Vec<_> = fx
            .resolver()
            .breadcrumbs(cbc)
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["Labs", "2024"]);
        assert!(fx.resolver().breadcrumbs(labs).unwrap().is_empty());
        assert_eq!(fx.resolver().depth(cbc).unwrap(), 2);
    }

    #[test]
    fn would_cycle_detects_self_and_descendants() {
        let mut fx = Fixture::new();
        let a = fx.add("a", None, ItemKind::Folder);
        let b = fx.add("b", Some(a), ItemKind::Folder);
        let c = fx.add("c", Some(b), ItemKind::Folder);
        let other = fx.add("other", None, ItemKind::Folder);

        let r = fx.resolver();
        assert!(r.would_cycle(a, a).unwrap());
        assert!(r.would_cycle(a, c).unwrap());
        assert!(r.would_cycle(b, c).unwrap());
        assert!(!r.would_cycle(c, a).unwrap());
        assert!(!r.would_cycle(a, other).unwrap());
        assert!(matches!(
            r.would_cycle(a, Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn broken_parent_link_is_an_integrity_error() {
        let mut fx = Fixture::new();
        let orphan = fx.add("orphan", Some(Uuid::new_v4()), ItemKind::File);
        assert!(matches!(
            fx.resolver().breadcrumbs(orphan),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn looping_chain_terminates_with_integrity_error() {
        let mut fx = Fixture::new();
        let a = fx.add("a", None, ItemKind::Folder);
        let b = fx.add("b", Some(a), ItemKind::Folder);
        fx.items.get_mut(&a).unwrap().parent_id = Some(b);
        assert!(matches!(
            fx.resolver().ancestors(b),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn descendants_are_breadth_first() {
        let mut fx = Fixture::new();
        let root = fx.add("root", None, ItemKind::Folder);
        let a = fx.add("a", Some(root), ItemKind::Folder);
        let b = fx.add("b", Some(root), ItemKind::Folder);
        let a1 = fx.add("a1", Some(a), ItemKind::File);
        let b1 = fx.add("b1", Some(b), ItemKind::File);

        let order = fx.resolver().descendants(root);
        assert_eq!(order.len(), 4);
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(a1));
        assert!(pos(b) < pos(b1));
        assert!(pos(a) < 2 && pos(b) < 2);
    }
}
