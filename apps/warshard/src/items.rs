//! Item and corpse model.
//!
//! Weapons come from a small static table; the only dynamic item is a blood
//! trophy, which is tagged with the victim's name at kill time. Corpses are
//! containers with purely time-derived decay: nothing sweeps them, their
//! state is computed from elapsed time whenever someone looks.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeaponDef {
    pub key: &'static str,
    pub name: &'static str,
    pub damage: i32,
    pub cost: u32,
}

pub static WEAPONS: &[WeaponDef] = &[
    WeaponDef {
        key: "dagger",
        name: "dagger",
        damage: 8,
        cost: 30,
    },
    WeaponDef {
        key: "wooden_sword",
        name: "wooden sword",
        damage: 10,
        cost: 20,
    },
    WeaponDef {
        key: "iron_sword",
        name: "iron sword",
        damage: 20,
        cost: 100,
    },
    WeaponDef {
        key: "spear",
        name: "spear",
        damage: 22,
        cost: 80,
    },
    WeaponDef {
        key: "mace",
        name: "mace",
        damage: 25,
        cost: 150,
    },
    WeaponDef {
        key: "steel_sword",
        name: "steel sword",
        damage: 30,
        cost: 250,
    },
    WeaponDef {
        key: "battle_axe",
        name: "battle axe",
        damage: 35,
        cost: 300,
    },
];

/// Match a weapon by key or by any whole word of its display name.
pub fn find_weapon(token: &str) -> Option<&'static WeaponDef> {
    let t = token.trim().to_ascii_lowercase();
    if t.is_empty() {
        return None;
    }
    WEAPONS
        .iter()
        .find(|w| w.key == t || w.name == t || w.name.split(' ').any(|part| part == t))
}

/// How many items a character can carry.
pub const CARRY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub enum Item {
    Weapon(&'static WeaponDef),
    Blood { victim: String },
}

impl Item {
    pub fn name(&self) -> String {
        match self {
            Item::Weapon(w) => w.name.to_string(),
            Item::Blood { victim } => format!("blood of {victim}"),
        }
    }

    pub fn is_blood(&self) -> bool {
        matches!(self, Item::Blood { .. })
    }
}

pub const CORPSE_DECAY_MS: u64 = 300_000;

const DECAY_STAGES: &[(u64, &str)] = &[
    (60_000, "is still warm"),
    (120_000, "has started to cool"),
    (180_000, "is cold and stiff"),
    (240_000, "is starting to decay"),
];

#[derive(Debug, Clone)]
pub struct Corpse {
    pub victim: String,
    pub room_id: String,
    pub created_ms: u64,
    pub contents: Vec<Item>,
}

impl Corpse {
    pub fn new(victim: String, room_id: String, now_ms: u64) -> Self {
        Self {
            victim,
            room_id,
            created_ms: now_ms,
            contents: Vec::new(),
        }
    }

    pub fn is_decayed(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) >= CORPSE_DECAY_MS
    }

    pub fn describe(&self, now_ms: u64) -> String {
        let elapsed = now_ms.saturating_sub(self.created_ms);
        let stage = DECAY_STAGES
            .iter()
            .find(|(t, _)| elapsed < *t)
            .map(|(_, s)| *s)
            .unwrap_or("has decayed into dust");
        format!("The corpse of {} {}.", self.victim, stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_weapons_by_key_and_name_words() {
        assert_eq!(find_weapon("battle_axe").unwrap().damage, 35);
        assert_eq!(find_weapon("axe").unwrap().damage, 35);
        assert_eq!(find_weapon("iron sword").unwrap().damage, 20);
        assert_eq!(find_weapon("Dagger").unwrap().damage, 8);
        assert!(find_weapon("spoon").is_none());
        assert!(find_weapon("").is_none());
    }

    #[test]
    fn corpse_decay_is_derived_from_elapsed_time() {
        let c = Corpse::new("Ash".into(), "arena_1_1".into(), 10_000);
        assert!(!c.is_decayed(10_000));
        assert!(c.describe(30_000).contains("still warm"));
        assert!(c.describe(10_000 + 130_000).contains("cold and stiff"));
        assert!(c.describe(10_000 + 200_000).contains("starting to decay"));
        assert!(c.is_decayed(10_000 + CORPSE_DECAY_MS));
        assert!(c.describe(10_000 + 400_000).contains("decayed into dust"));
    }

    #[test]
    fn blood_is_tagged_with_victim() {
        let b = Item::Blood {
            victim: "Morgue".into(),
        };
        assert_eq!(b.name(), "blood of Morgue");
        assert!(b.is_blood());
    }
}
