//! Read and write decisions.
//!
//! These are pure functions of the actor, the item, its ancestry and the
//! relevant grants. Callers gather the inputs under one snapshot so the
//! decision and the data it was made on agree.

use crate::model::{Actor, Item, ShareGrant};

/// Whether `actor` may see `item`.
///
/// `ancestry` is the item's ancestor chain (any order) and `grants` any set
/// of grants; only active grants addressed to the actor on the item or one
/// of its ancestors count.
pub fn can_read(actor: &Actor, item: &Item, ancestry: &[&Item], grants: &[ShareGrant]) -> bool {
    let Some(owner) = actor.acting_owner() else {
        return false;
    };
    if item.owner_id == owner {
        return true;
    }
    if let Actor::Receptionist { .. } = actor {
        return false;
    }
    grants.iter().any(|g| {
        g.is_active()
            && g.granted_to == actor.id()
            && (g.item_id == item.id || ancestry.iter().any(|a| a.id == g.item_id))
    })
}

/// Whether `actor` may rename, move, delete or create under `item`.
/// Share recipients never qualify.
pub fn can_mutate(actor: &Actor, item: &Item) -> bool {
    actor.acting_owner() == Some(item.owner_id.as_str())
}

pub fn can_share(actor: &Actor, item: &Item) -> bool {
    can_mutate(actor, item)
}

/// Whether `actor` may create items at the root of `owner_id`'s tree.
pub fn can_write_root(actor: &Actor, owner_id: &str) -> bool {
    actor.acting_owner() == Some(owner_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemKind, Role};
    use chrono::Utc;
    use uuid::Uuid;

    fn item(owner: &str, parent: Option<Uuid>) -> Item {
        Item {
            id: Uuid::new_v4(),
            owner_id: owner.into(),
            owner_type: Role::Doctor,
            name: "x".into(),
            kind: ItemKind::Folder,
            parent_id: parent,
            file_ref: None,
            size: None,
            extension: None,
            category: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            revision: 1,
        }
    }

    fn grant(item: &Item, to: &str) -> ShareGrant {
        ShareGrant {
            id: Uuid::new_v4(),
            item_id: item.id,
            granted_by: item.owner_id.clone(),
            granted_to: to.into(),
            granted_to_type: None,
            created_at: Utc::now(),
            revoked_at: None,
            revoked_by: None,
        }
    }

    #[test]
    fn owner_and_delegate_can_mutate() {
        let labs = item("d1", None);
        assert!(can_mutate(&Actor::doctor("d1"), &labs));
        assert!(can_mutate(&Actor::receptionist("r1", Some("d1".into())), &labs));
        assert!(!can_mutate(&Actor::receptionist("r1", Some("d2".into())), &labs));
        assert!(!can_mutate(&Actor::receptionist("r1", None), &labs));
        assert!(!can_share(&Actor::patient("p1"), &labs));
        assert!(can_write_root(&Actor::receptionist("r1", Some("d1".into())), "d1"));
        assert!(!can_write_root(&Actor::receptionist("r1", None), "d1"));
    }

    #[test]
    fn grant_on_ancestor_covers_descendants() {
        let labs = item("d1", None);
        let y2024 = item("d1", Some(labs.id));
        let cbc = item("d1", Some(y2024.id));
        let grants = vec![grant(&labs, "p1")];
        let patient = Actor::patient("p1");

        assert!(can_read(&patient, &labs, &[], &grants));
        assert!(can_read(&patient, &cbc, &[&y2024, &labs], &grants));
        assert!(!can_read(&Actor::patient("p2"), &cbc, &[&y2024, &labs], &grants));
        // reading never implies writing
        assert!(!can_mutate(&patient, &cbc));
    }

    #[test]
    fn revoked_grant_does_not_count() {
        let labs = item("d1", None);
        let mut g = grant(&labs, "p1");
        g.revoked_at = Some(Utc::now());
        assert!(!can_read(&Actor::patient("p1"), &labs, &[], &[g]));
    }

    #[test]
    fn receptionist_reads_only_through_their_doctor() {
        let labs = item("d1", None);
        let grants = vec![grant(&labs, "r2")];
        assert!(can_read(&Actor::receptionist("r1", Some("d1".into())), &labs, &[], &[]));
        assert!(!can_read(&Actor::receptionist("r2", None), &labs, &[], &grants));
        assert!(!can_read(&Actor::receptionist("r3", Some("d9".into())), &labs, &[], &[]));
    }
}
