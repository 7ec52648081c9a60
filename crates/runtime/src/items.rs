//! Bag slot operations. A bag's visible contents occupy unique integer
//! slots; hidden items carry no slot and are skipped by these APIs.

use crate::{EntityRef, RequestContext};
use models::{stack_merge, FieldValue, Ref};

/// The visible item occupying `slot` in `bag`, if any.
pub async fn item_in_slot(
    ctx: &mut RequestContext,
    bag: &EntityRef,
    slot: i64,
) -> anyhow::Result<Option<EntityRef>> {
    for r in content_refs(bag) {
        let item = ctx.resolve(&r).await?;
        let matches = {
            let item = item.read().unwrap();
            let hidden = matches!(item.get("is_hidden"), Some(FieldValue::Bool(true)));
            !hidden && item.get_int("slot") == Some(slot)
        };
        if matches {
            return Ok(Some(item));
        }
    }
    Ok(None)
}

/// Add `item` to `bag` at `slot`. If the slot's occupant stacks with the
/// item (same class, with `count`/`stackmax`), units merge up to the
/// occupant's capacity; otherwise an empty slot receives the whole item.
/// Returns the number of units moved.
pub async fn add_to_slot(
    ctx: &mut RequestContext,
    bag: &EntityRef,
    item: &EntityRef,
    slot: i64,
) -> anyhow::Result<i64> {
    let Some(occupant) = item_in_slot(ctx, bag, slot).await? else {
        return Ok(place_in_slot(ctx, bag, item, slot));
    };

    let (occ_class, occ_count, occ_max) = {
        let occ = occupant.read().unwrap();
        (
            occ.class.clone(),
            occ.get_int("count").unwrap_or(1),
            occ.get_int("stackmax").unwrap_or(1),
        )
    };
    let (new_class, new_count) = {
        let item = item.read().unwrap();
        (item.class.clone(), item.get_int("count").unwrap_or(1))
    };

    if occ_class != new_class {
        let bag_id = bag.read().unwrap().id.clone();
        return Err(models::Error::SlotOccupied(slot, bag_id).into());
    }

    let moved = stack_merge(occ_count, new_count, occ_max);
    occupant.write().unwrap().set("count", occ_count + moved);
    ctx.set_dirty(&occupant);

    let remaining = new_count - moved;
    {
        let mut item = item.write().unwrap();
        if remaining == 0 {
            item.del();
        } else {
            item.set("count", remaining);
        }
    }
    ctx.set_dirty(item);
    Ok(moved)
}

// Move the whole item into the empty slot: it inherits the bag's top
// container and extends its path, and the bag's contents gain its ref.
fn place_in_slot(ctx: &mut RequestContext, bag: &EntityRef, item: &EntityRef, slot: i64) -> i64 {
    let (bag_id, tcont, bag_path) = {
        let bag = bag.read().unwrap();
        let tcont = bag
            .get_str("tcont")
            .unwrap_or(bag.id.as_str())
            .to_string();
        let path = bag
            .get_str("path")
            .unwrap_or(bag.id.as_str())
            .to_string();
        (bag.id.clone(), tcont, path)
    };

    let moved = {
        let mut item = item.write().unwrap();
        let item_id = item.id.clone();
        item.set("slot", slot);
        item.set("tcont", tcont.as_str());
        item.set("container", bag_id.as_str());
        item.set("path", format!("{bag_path}/{item_id}").as_str());
        item.get_int("count").unwrap_or(1)
    };

    {
        let item_ref = item.read().unwrap().to_ref();
        let mut bag = bag.write().unwrap();
        match bag.fields.get_mut("items").and_then(FieldValue::as_map_mut) {
            Some(map) => {
                map.insert(item_ref.id.to_string(), FieldValue::Ref(item_ref));
            }
            None => {
                let mut map = models::OrderedHash::new();
                map.insert(item_ref.id.to_string(), FieldValue::Ref(item_ref));
                bag.set("items", FieldValue::Map(map));
            }
        }
    }

    ctx.set_dirty(bag);
    ctx.set_dirty(item);
    moved
}

fn content_refs(bag: &EntityRef) -> Vec<Ref> {
    let bag = bag.read().unwrap();
    bag.fields
        .get("items")
        .and_then(FieldValue::as_map)
        .map(|map| {
            map.iter()
                .filter_map(|(_, v)| v.as_ref_value().cloned())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Cache;
    use models::{EntityKind, Id};
    use std::sync::Arc;
    use store::MemStore;

    async fn context() -> RequestContext {
        let cache = Arc::new(Cache::new(Arc::new(MemStore::new())));
        RequestContext::new(cache, "test", None, None)
    }

    fn seed_item(ctx: &mut RequestContext, class: &str, slot: i64, count: i64, max: i64) -> EntityRef {
        let item = ctx.create(EntityKind::Item, class);
        {
            let mut item = item.write().unwrap();
            item.set("slot", slot);
            item.set("count", count);
            item.set("stackmax", max);
        }
        item
    }

    #[tokio::test]
    async fn test_stack_merge_into_occupied_slot() {
        let mut ctx = context().await;
        let bag = ctx.create(EntityKind::Bag, "backpack");

        let i2 = seed_item(&mut ctx, "pebble", 0, 3, 5);
        add_to_slot(&mut ctx, &bag, &i2, 0).await.unwrap();
        let i3 = seed_item(&mut ctx, "twig", 1, 1, 1);
        add_to_slot(&mut ctx, &bag, &i3, 1).await.unwrap();

        // Four more pebbles into slot 0: two fit, two remain.
        let incoming = seed_item(&mut ctx, "pebble", 0, 4, 5);
        let moved = add_to_slot(&mut ctx, &bag, &incoming, 0).await.unwrap();
        assert_eq!(moved, 2);
        assert_eq!(i2.read().unwrap().get_int("count"), Some(5));
        assert_eq!(incoming.read().unwrap().get_int("count"), Some(2));
        assert!(!incoming.read().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_full_merge_deletes_the_incoming_stack() {
        let mut ctx = context().await;
        let bag = ctx.create(EntityKind::Bag, "backpack");
        let occupant = seed_item(&mut ctx, "pebble", 0, 3, 5);
        add_to_slot(&mut ctx, &bag, &occupant, 0).await.unwrap();

        let incoming = seed_item(&mut ctx, "pebble", 0, 2, 5);
        let moved = add_to_slot(&mut ctx, &bag, &incoming, 0).await.unwrap();
        assert_eq!(moved, 2);
        assert!(incoming.read().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_mismatched_class_cannot_share_a_slot() {
        let mut ctx = context().await;
        let bag = ctx.create(EntityKind::Bag, "backpack");
        let occupant = seed_item(&mut ctx, "pebble", 0, 1, 1);
        add_to_slot(&mut ctx, &bag, &occupant, 0).await.unwrap();

        let incoming = seed_item(&mut ctx, "twig", 0, 1, 1);
        assert!(add_to_slot(&mut ctx, &bag, &incoming, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_hidden_items_are_not_slotted() {
        let mut ctx = context().await;
        let bag = ctx.create(EntityKind::Bag, "backpack");
        let hidden = seed_item(&mut ctx, "secret", 0, 1, 1);
        add_to_slot(&mut ctx, &bag, &hidden, 0).await.unwrap();
        hidden.write().unwrap().set("is_hidden", true);

        assert!(item_in_slot(&mut ctx, &bag, 0).await.unwrap().is_none());

        // The slot is free for a visible item.
        let visible = seed_item(&mut ctx, "pebble", 0, 1, 1);
        add_to_slot(&mut ctx, &bag, &visible, 0).await.unwrap();
        let found = item_in_slot(&mut ctx, &bag, 0).await.unwrap().unwrap();
        assert_eq!(
            found.read().unwrap().id,
            visible.read().unwrap().id
        );
    }

    #[tokio::test]
    async fn test_placement_sets_container_chain() {
        let mut ctx = context().await;
        let bag = ctx.create(EntityKind::Bag, "backpack");
        {
            let mut b = bag.write().unwrap();
            b.set("tcont", "POWNER");
            let bag_id = b.id.clone();
            b.set("path", format!("POWNER/{bag_id}").as_str());
        }

        let item = seed_item(&mut ctx, "pebble", 0, 1, 1);
        add_to_slot(&mut ctx, &bag, &item, 3).await.unwrap();

        let item = item.read().unwrap();
        let bag_id = bag.read().unwrap().id.clone();
        assert_eq!(item.get_int("slot"), Some(3));
        assert_eq!(item.get_str("tcont"), Some("POWNER"));
        assert_eq!(
            item.get_str("path").unwrap(),
            format!("POWNER/{bag_id}/{}", item.id)
        );
    }

    #[tokio::test]
    async fn test_ids_are_real_membership_checks() {
        let mut ctx = context().await;
        let bag = ctx.create(EntityKind::Bag, "backpack");
        let item = seed_item(&mut ctx, "pebble", 0, 1, 1);
        add_to_slot(&mut ctx, &bag, &item, 0).await.unwrap();

        let id = item.read().unwrap().id.clone();
        let other = Id::parse("IZZZZ").unwrap();
        let bag = bag.read().unwrap();
        let contents = bag.fields.get("items").and_then(FieldValue::as_map).unwrap();
        assert!(contents.contains_key(id.as_str()));
        assert!(!contents.contains_key(other.as_str()));
    }
}
