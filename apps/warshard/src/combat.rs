//! Combat resolution.
//!
//! Attacks are player-initiated commands; there is no auto-attack loop.
//! Damage selects an emote from a fifteen-tier table covering every
//! possible value exactly once. Death handling is idempotent and drives
//! the war engine's kill bookkeeping before the win-condition check.

use tracing::debug;

use crate::items::{Corpse, Item, CARRY_LIMIT};
use crate::war::{self, WarClass};
use crate::{CharacterId, FightMark, World};

pub const BASE_DAMAGE: i32 = 10;
pub const KAMIKAZE_BLAST: i32 = 100;
/// Fight-tracking entries expire after this long without a new attack.
pub const FIGHT_TRACK_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct DamageTier {
    pub min: i32,
    pub max: i32,
    pub emote: &'static str,
}

/// Inclusive, contiguous, exhaustive over all non-negative damage.
pub static DAMAGE_TIERS: [DamageTier; 15] = [
    DamageTier { min: 0, max: 0, emote: "missed" },
    DamageTier { min: 1, max: 1, emote: "tickled %s in the stomach" },
    DamageTier { min: 2, max: 3, emote: "grazed" },
    DamageTier { min: 4, max: 10, emote: "hit" },
    DamageTier { min: 11, max: 20, emote: "hit %s hard" },
    DamageTier { min: 21, max: 30, emote: "hit %s very hard" },
    DamageTier { min: 31, max: 55, emote: "struck %s a mighty blow" },
    DamageTier { min: 56, max: 65, emote: "smashed %s with a bone crushing sound" },
    DamageTier { min: 66, max: 110, emote: "pulverized %s with a powerful attack" },
    DamageTier { min: 111, max: 160, emote: "trounced %s up and down" },
    DamageTier { min: 161, max: 210, emote: "pummeled %s into small fragments" },
    DamageTier { min: 211, max: 260, emote: "massacred %s into tiny fragments" },
    DamageTier { min: 261, max: 325, emote: "utterly annihilated" },
    DamageTier { min: 326, max: 390, emote: "completely devastated %s with awesome force" },
    DamageTier { min: 391, max: i32::MAX, emote: "destroyed" },
];

pub fn tier_for(damage: i32) -> &'static DamageTier {
    let d = damage.max(0);
    DAMAGE_TIERS
        .iter()
        .find(|t| t.min <= d && d <= t.max)
        .expect("damage tiers are exhaustive")
}

/// Inline the target into the emote; emotes without a slot take the target
/// as a trailing object.
pub fn phrase(emote: &str, target: &str) -> String {
    if emote.contains("%s") {
        emote.replace("%s", target)
    } else {
        format!("{emote} {target}")
    }
}

pub fn compute_damage(
    rng: &mut crate::Rng64,
    weapon_damage: i32,
    class: Option<WarClass>,
    strength: i32,
) -> i32 {
    let mut base = BASE_DAMAGE + weapon_damage;
    match class {
        Some(WarClass::Fighter) => base = base * 3 / 2,
        Some(WarClass::Kamikaze) => base *= 3,
        _ => {}
    }
    let mut damage = rng.roll_range(base * 4 / 5, base * 6 / 5);
    damage += (strength - 50) / 10;
    damage.max(0)
}

/// Attack eligibility. Total; never mutates.
pub fn eligibility(world: &World, attacker: CharacterId, target: CharacterId) -> Result<(), String> {
    let Some(att) = world.chars.get(&attacker) else {
        return Err("You are nobody.".to_string());
    };
    let Some(tgt) = world.chars.get(&target) else {
        return Err("They aren't here!".to_string());
    };
    if att.is_ghost {
        return Err("Ghosts cannot attack!".to_string());
    }
    if tgt.is_ghost {
        return Err("You cannot attack ghosts!".to_string());
    }
    if att.room_id != tgt.room_id {
        return Err("They aren't here!".to_string());
    }
    if !world.war.in_progress() {
        return Err("There is no war in progress!".to_string());
    }
    if world.war.war_type.is_some_and(|t| t.has_teams())
        && att.side.is_some()
        && att.side == tgt.side
    {
        return Err("You cannot attack your own team!".to_string());
    }
    Ok(())
}

/// `kill <target>`: the whole attack pipeline.
pub fn attack(world: &mut World, attacker: CharacterId, target_token: &str) {
    let token = target_token.trim();
    let Some(att_room) = world.chars.get(&attacker).map(|c| c.room_id.clone()) else {
        return;
    };
    let Some(target) = world.find_char_in_room(&att_room, token) else {
        world.tell_char(attacker, &format!("You don't see '{token}' here."));
        return;
    };
    if target == attacker {
        world.tell_char(attacker, "You can't bring yourself to do it.");
        return;
    }

    if let Err(reason) = eligibility(world, attacker, target) {
        world.tell_char(attacker, &reason);
        debug!(attacker, target, reason = %reason, "attack refused");
        return;
    }

    let (att_name, weapon, class, strength) = {
        let a = &world.chars[&attacker];
        (
            a.name.clone(),
            a.wielded.map(|w| w.damage).unwrap_or(0),
            a.war_class,
            a.strength,
        )
    };
    let tgt_name = world.chars[&target].name.clone();

    let damage = compute_damage(&mut world.rng, weapon, class, strength);
    let emote = tier_for(damage).emote;

    world.tell_char(attacker, &format!("You {}.", phrase(emote, &tgt_name)));
    world.tell_char(target, &format!("{att_name} {}.", phrase(emote, "you")));
    let room_msg = format!("{att_name} {}.", phrase(emote, &tgt_name));
    world.broadcast_room_except(&att_room, &room_msg, &[attacker, target]);
    world.observer_echo(&att_room, &room_msg);

    let killed = {
        let Some(t) = world.chars.get_mut(&target) else {
            return;
        };
        t.hp = (t.hp - damage).max(0);
        t.hp == 0
    };

    if killed {
        handle_death(world, attacker, target);
    } else {
        wimpy_check(world, target);
    }

    let now = world.now_ms();
    world.fighting.insert(
        attacker,
        FightMark {
            target,
            last_attack_ms: now,
        },
    );
}

/// Auto-flee below the wimpy threshold. Survivors only.
fn wimpy_check(world: &mut World, cid: CharacterId) {
    let Some(c) = world.chars.get(&cid) else {
        return;
    };
    if c.is_ghost || c.max_hp <= 0 {
        return;
    }
    if c.hp * 100 <= c.max_hp * c.wimpy_percent as i32 {
        flee(world, cid);
    }
}

pub fn flee(world: &mut World, cid: CharacterId) {
    let Some((room_id, name)) = world
        .chars
        .get(&cid)
        .map(|c| (c.room_id.clone(), c.name.clone()))
    else {
        return;
    };
    let exits = world.rooms.unlocked_exits(&room_id);
    if exits.is_empty() {
        world.tell_char(cid, "There's nowhere to flee!");
        return;
    }
    let i = world.rng.roll_range(0, exits.len() as i32 - 1) as usize;
    let ex = &exits[i];

    world.tell_char(cid, &format!("You flee {} in panic!", ex.dir));
    world.broadcast_room_except(&room_id, &format!("{name} flees {}!", ex.dir), &[cid]);
    let dest = ex.to.clone();
    world.move_char(cid, &dest);
    world.fighting.remove(&cid);
}

/// Death handling. Idempotent: a victim who is already a ghost is a no-op,
/// which is what makes a same-tick double kill harmless.
pub fn handle_death(world: &mut World, killer: CharacterId, victim: CharacterId) {
    let Some(v) = world.chars.get(&victim) else {
        return;
    };
    if v.is_ghost {
        debug!(victim, "death handling on a ghost ignored");
        return;
    }
    let victim_name = v.name.clone();
    let death_room = v.room_id.clone();
    let was_kamikaze = v.war_class == Some(WarClass::Kamikaze);

    // War bookkeeping first: announcement, gerkin rites, killer stats.
    war::handle_kill(world, killer, victim);

    // Blood trophy for the killer.
    if killer != victim && world.chars.contains_key(&killer) {
        if let Some(k) = world.chars.get_mut(&killer) {
            k.inv.push(Item::Blood {
                victim: victim_name.clone(),
            });
        }
        world.tell_char(killer, &format!("You collect the blood of {victim_name}."));
    }

    // Everything the victim carried goes into a corpse where they fell.
    let now = world.now_ms();
    let mut corpse = Corpse::new(victim_name.clone(), death_room.clone(), now);
    if let Some(v) = world.chars.get_mut(&victim) {
        corpse.contents.append(&mut v.inv);
        if let Some(w) = v.wielded.take() {
            corpse.contents.push(Item::Weapon(w));
        }
    }

    // The killer auto-loots what fits; the corpse keeps the rest.
    if killer != victim && world.chars.contains_key(&killer) {
        world.tell_char(killer, &format!("You collect the corpse of {victim_name}."));
        let mut looted = 0usize;
        while !corpse.contents.is_empty() {
            let full = world
                .chars
                .get(&killer)
                .map(|k| k.inv.len() >= CARRY_LIMIT)
                .unwrap_or(true);
            if full {
                break;
            }
            let item = corpse.contents.remove(0);
            let label = item.name();
            if let Some(k) = world.chars.get_mut(&killer) {
                k.inv.push(item);
            }
            world.tell_char(killer, &format!("You loot {label} from the corpse."));
            looted += 1;
        }
        if looted == 0 {
            world.tell_char(killer, "The corpse was empty.");
        }
    }
    world.corpses.push(corpse);

    // Ghost transition: dead combatants leave the war but never the game.
    if let Some(v) = world.chars.get_mut(&victim) {
        v.deaths += 1;
        v.is_ghost = true;
        v.side = None;
        v.war_class = None;
        v.has_gerkin = false;
        v.max_hp = v.base_max_hp;
        v.max_sp = v.base_max_sp;
        v.hp = v.max_hp;
        v.sp = v.max_sp;
    }
    if world.war.gerkin_holder == Some(victim) {
        world.war.gerkin_holder = None;
    }
    world.fighting.remove(&victim);
    world.move_char(victim, crate::ROOM_WARROOM);
    world.tell_char(
        victim,
        "You have died and returned as a ghost to the warroom.",
    );

    // A dead kamikaze takes the room with them. The victim is already a
    // ghost here, so the explosion pass cannot re-enter itself.
    if was_kamikaze {
        explosion(world, victim, &death_room);
    }

    // A statue has no session to haunt; once its body dies there is nothing
    // left to keep in the world.
    let statue = world.chars.get(&victim).is_some_and(|c| c.linkdead);
    if statue {
        world.save_char(victim);
        if let Some(c) = world.chars.remove(&victim) {
            if let Some(set) = world.occupants.get_mut(&c.room_id) {
                set.remove(&victim);
                if set.is_empty() {
                    world.occupants.remove(&c.room_id);
                }
            }
            world.broadcast_all(&format!("The ghost of {} fades away.", c.name));
        }
    }

    war::check_win(world);
}

fn explosion(world: &mut World, bomber: CharacterId, room_id: &str) {
    let bomber_name = world
        .chars
        .get(&bomber)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "someone".to_string());
    world.broadcast_all(&format!("{bomber_name} EXPLODES in a fiery blast!"));

    let mut targets: Vec<CharacterId> = world
        .occupants
        .get(room_id)
        .map(|s| s.iter().copied().collect())
        .unwrap_or_default();
    targets.sort_unstable();

    for cid in targets {
        if cid == bomber {
            continue;
        }
        let Some(c) = world.chars.get_mut(&cid) else {
            continue;
        };
        if c.is_ghost {
            continue;
        }
        c.hp = (c.hp - KAMIKAZE_BLAST).max(0);
        let name = c.name.clone();
        let killed = c.hp == 0;
        world.tell_char(cid, "The explosion tears through you!");
        if killed {
            world.broadcast_all(&format!("{name} was killed by the explosion!"));
            handle_death(world, bomber, cid);
        } else {
            wimpy_check(world, cid);
        }
    }
}

/// "Who am I fighting" display. Entries silently expire after ten seconds.
pub fn fighting_line(world: &mut World, cid: CharacterId) -> Option<String> {
    let now = world.now_ms();
    let mark = world.fighting.get(&cid)?;
    if now.saturating_sub(mark.last_attack_ms) > FIGHT_TRACK_MS {
        world.fighting.remove(&cid);
        return None;
    }
    let name = world.chars.get(&mark.target).map(|c| c.name.clone())?;
    Some(format!("Fighting: {name}"))
}
