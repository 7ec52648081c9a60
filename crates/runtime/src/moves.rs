//! Player movement between locations: the one cross-entity mutation the
//! core owns, because routing (and therefore RQ placement) hangs off a
//! player's current location. Script-level effects of a move stay in the
//! script layer.

use crate::RequestContext;
use models::{EntityKind, FieldValue, Id, OrderedHash, Ref};

/// Move a player to `dest`. Updates the player's `location` reference and
/// both locations' player lists, flagging all three entities dirty.
/// Moving a player to the location it already occupies is a no-op.
pub async fn move_player(
    ctx: &mut RequestContext,
    player_id: &Id,
    dest: &Id,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        player_id.kind() == EntityKind::Player,
        "'{player_id}' is not a player"
    );
    anyhow::ensure!(
        dest.kind() == EntityKind::Location,
        "'{dest}' is not a location"
    );

    let player = ctx.get(player_id).await?;
    let previous = {
        let player = player.read().unwrap();
        player.get_ref("location").map(|r| r.id.clone())
    };
    if previous.as_ref() == Some(dest) {
        return Ok(());
    }

    if let Some(previous) = previous {
        let old_loc = ctx.get(&previous).await?;
        {
            let mut old_loc = old_loc.write().unwrap();
            if let Some(players) = old_loc.fields.get_mut("players").and_then(FieldValue::as_map_mut)
            {
                players.remove(player_id.as_str());
            }
        }
        ctx.set_dirty(&old_loc);
    }

    let new_loc = ctx.get(dest).await?;
    let dest_label = {
        let player_ref = player.read().unwrap().to_ref();
        let mut new_loc = new_loc.write().unwrap();
        match new_loc.fields.get_mut("players").and_then(FieldValue::as_map_mut) {
            Some(players) => {
                players.insert(player_id.to_string(), FieldValue::Ref(player_ref));
            }
            None => {
                let mut players = OrderedHash::new();
                players.insert(player_id.to_string(), FieldValue::Ref(player_ref));
                new_loc.set("players", FieldValue::Map(players));
            }
        }
        new_loc.label.clone()
    };
    ctx.set_dirty(&new_loc);

    {
        let mut player = player.write().unwrap();
        let mut location = Ref::new(dest.clone());
        if let Some(label) = dest_label {
            location.set_label(label);
        }
        player.set("location", location);
    }
    ctx.set_dirty(&player);

    tracing::debug!(player = %player_id, location = %dest, "player moved");
    Ok(())
}

/// The player roster of a location, with registered group decorators not
/// yet applied (callers pass the result through `GroupHooks::apply`).
pub async fn players_in(ctx: &mut RequestContext, location: &Id) -> anyhow::Result<Vec<Ref>> {
    let location = ctx.get(location).await?;
    let location = location.read().unwrap();
    Ok(location
        .fields
        .get("players")
        .and_then(FieldValue::as_map)
        .map(|players| {
            players
                .iter()
                .filter_map(|(_, v)| v.as_ref_value().cloned())
                .collect()
        })
        .unwrap_or_default())
}
