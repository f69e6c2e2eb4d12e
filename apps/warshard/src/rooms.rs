use std::collections::HashMap;

use anyhow::Context;
use serde::Deserialize;

/// Number of rooms in the neutral connecting backbone.
pub const BACKBONE_ROOMS: u32 = 30;
/// Side length of the full arena grid. Wars shrink the playable bound from
/// this down to 1, but the rooms themselves always exist.
pub const ARENA_SIZE: u32 = 9;

#[derive(Clone, Debug)]
pub struct ExitDef {
    pub dir: String,
    pub to: String,
    pub locked: bool,
}

#[derive(Clone, Debug)]
pub struct RoomDef {
    pub name: String,
    pub description: String,
    pub area_name: String,
    pub exits: Vec<ExitDef>,
}

#[derive(Clone)]
pub struct Rooms {
    rooms: HashMap<String, RoomDef>,
    start_room: String,
}

impl Rooms {
    /// Build the world: the hand-authored hub zone from embedded YAML, plus
    /// the generated backbone ring and arena grid.
    pub fn load() -> anyhow::Result<Self> {
        let mut rooms = HashMap::new();

        let hub: AreaFile =
            serde_yaml::from_str(include_str!("../world/hub.yaml")).context("parse hub.yaml")?;
        let area_name = hub.zone_name.clone().unwrap_or_else(|| hub.zone_id.clone());
        for r in hub.rooms {
            let mut exits = Vec::new();
            for e in r.exits.unwrap_or_default() {
                let dir = e.dir.trim().to_string();
                let to = e.to.trim().to_string();
                if dir.is_empty() || to.is_empty() {
                    continue;
                }
                exits.push(ExitDef {
                    dir,
                    to,
                    locked: e.state.as_deref() == Some("locked"),
                });
            }
            rooms.insert(
                r.id,
                RoomDef {
                    name: r.name,
                    description: r.desc.unwrap_or_default().trim().to_string(),
                    area_name: area_name.clone(),
                    exits,
                },
            );
        }

        let start_room = hub
            .start_room
            .filter(|s| rooms.contains_key(s))
            .context("hub.yaml missing a valid start_room")?;

        add_backbone(&mut rooms);
        add_arena(&mut rooms);

        Ok(Self { rooms, start_room })
    }

    pub fn start_room(&self) -> &str {
        &self.start_room
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn get(&self, room_id: &str) -> Option<&RoomDef> {
        self.rooms.get(room_id)
    }

    /// Resolve a typed token against a room's exits. Exact exit names match
    /// first, then the usual single-letter direction aliases.
    pub fn find_exit(&self, room_id: &str, token: &str) -> Option<&ExitDef> {
        let room = self.rooms.get(room_id)?;
        let t = token.trim();
        if t.is_empty() {
            return None;
        }

        if let Some(ex) = room.exits.iter().find(|e| e.dir.eq_ignore_ascii_case(t)) {
            return Some(ex);
        }

        let canon = normalize_dir_token(t)?;
        room.exits
            .iter()
            .find(|e| e.dir.eq_ignore_ascii_case(canon))
    }

    pub fn unlocked_exits(&self, room_id: &str) -> Vec<ExitDef> {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        room.exits.iter().filter(|e| !e.locked).cloned().collect()
    }

    pub fn render_exits(&self, room_id: &str) -> String {
        let Some(room) = self.rooms.get(room_id) else {
            return "exits: (room not found)\r\n".to_string();
        };
        if room.exits.is_empty() {
            return "exits: none\r\n".to_string();
        }
        let mut xs = room
            .exits
            .iter()
            .map(|e| e.dir.clone())
            .collect::<Vec<_>>();
        xs.sort_unstable();
        format!("exits: {}\r\n", xs.join(", "))
    }

    pub fn render_room(&self, room_id: &str) -> String {
        let Some(room) = self.rooms.get(room_id) else {
            return "room not found\r\n".to_string();
        };
        let mut s = String::new();
        s.push_str(&format!("== {} [{}] ==\r\n", room.name, room.area_name));
        if !room.description.is_empty() {
            for line in room.description.lines() {
                s.push_str(line.trim_end());
                s.push_str("\r\n");
            }
        }
        s.push_str(&self.render_exits(room_id));
        s
    }
}

pub fn backbone_room_id(i: u32) -> String {
    format!("backbone_{i:02}")
}

pub fn arena_room_id(x: u32, y: u32) -> String {
    format!("arena_{x}_{y}")
}

/// The backbone is a ring: each room links east/west to its neighbors, and
/// the first room links up to the warroom.
fn add_backbone(rooms: &mut HashMap<String, RoomDef>) {
    for i in 1..=BACKBONE_ROOMS {
        let prev = if i == 1 { BACKBONE_ROOMS } else { i - 1 };
        let next = if i == BACKBONE_ROOMS { 1 } else { i + 1 };
        let mut exits = vec![
            ExitDef {
                dir: "west".into(),
                to: backbone_room_id(prev),
                locked: false,
            },
            ExitDef {
                dir: "east".into(),
                to: backbone_room_id(next),
                locked: false,
            },
        ];
        if i == 1 {
            exits.push(ExitDef {
                dir: "north".into(),
                to: "warroom".into(),
                locked: false,
            });
        }
        rooms.insert(
            backbone_room_id(i),
            RoomDef {
                name: format!("Backbone Walk {i}"),
                description: "A stretch of the old connecting road. Scorch marks and broken \
                              weapons tell of wars gone by."
                    .into(),
                area_name: "The Backbone".into(),
                exits,
            },
        );
    }
}

/// A full grid of arena cells with compass exits between neighbors. War
/// shrink never removes rooms; it only relocates the living into the bound.
fn add_arena(rooms: &mut HashMap<String, RoomDef>) {
    for x in 1..=ARENA_SIZE {
        for y in 1..=ARENA_SIZE {
            let mut exits = Vec::new();
            if y < ARENA_SIZE {
                exits.push(ExitDef {
                    dir: "north".into(),
                    to: arena_room_id(x, y + 1),
                    locked: false,
                });
            }
            if y > 1 {
                exits.push(ExitDef {
                    dir: "south".into(),
                    to: arena_room_id(x, y - 1),
                    locked: false,
                });
            }
            if x < ARENA_SIZE {
                exits.push(ExitDef {
                    dir: "east".into(),
                    to: arena_room_id(x + 1, y),
                    locked: false,
                });
            }
            if x > 1 {
                exits.push(ExitDef {
                    dir: "west".into(),
                    to: arena_room_id(x - 1, y),
                    locked: false,
                });
            }
            rooms.insert(
                arena_room_id(x, y),
                RoomDef {
                    name: "The Arena".into(),
                    description: "Packed dirt under an iron sky. There is nowhere to hide here."
                        .into(),
                    area_name: "The Arena".into(),
                    exits,
                },
            );
        }
    }
}

#[derive(Debug, Deserialize)]
struct AreaFile {
    #[allow(dead_code)]
    version: u32,
    zone_id: String,
    zone_name: Option<String>,
    start_room: Option<String>,
    rooms: Vec<AreaRoom>,
}

#[derive(Debug, Deserialize)]
struct AreaRoom {
    id: String,
    name: String,
    desc: Option<String>,
    exits: Option<Vec<AreaExit>>,
}

#[derive(Debug, Deserialize)]
struct AreaExit {
    dir: String,
    to: String,
    state: Option<String>,
}

fn normalize_dir_token(token: &str) -> Option<&'static str> {
    match token.to_ascii_lowercase().as_str() {
        "north" | "n" => Some("north"),
        "south" | "s" => Some("south"),
        "east" | "e" => Some("east"),
        "west" | "w" => Some("west"),
        "up" | "u" => Some("up"),
        "down" | "d" => Some("down"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_loads_with_all_zones() {
        let rooms = Rooms::load().unwrap();
        assert_eq!(rooms.start_room(), "warroom");
        assert!(rooms.has_room("entrance"));
        assert!(rooms.has_room("observation_room"));
        assert!(rooms.has_room(&backbone_room_id(1)));
        assert!(rooms.has_room(&backbone_room_id(BACKBONE_ROOMS)));
        assert!(rooms.has_room(&arena_room_id(1, 1)));
        assert!(rooms.has_room(&arena_room_id(ARENA_SIZE, ARENA_SIZE)));
        assert!(!rooms.has_room(&arena_room_id(0, 1)));
    }

    #[test]
    fn exit_lookup_understands_aliases() {
        let rooms = Rooms::load().unwrap();
        let ex = rooms.find_exit("warroom", "n").unwrap();
        assert_eq!(ex.to, "records_room");
        let ex = rooms.find_exit("warroom", "SOUTH").unwrap();
        assert_eq!(ex.to, backbone_room_id(1));
        assert!(rooms.find_exit("warroom", "sideways").is_none());
    }

    #[test]
    fn backbone_forms_a_ring() {
        let rooms = Rooms::load().unwrap();
        let first = rooms.get(&backbone_room_id(1)).unwrap();
        assert!(first
            .exits
            .iter()
            .any(|e| e.dir == "west" && e.to == backbone_room_id(BACKBONE_ROOMS)));
        let last = rooms.get(&backbone_room_id(BACKBONE_ROOMS)).unwrap();
        assert!(last
            .exits
            .iter()
            .any(|e| e.dir == "east" && e.to == backbone_room_id(1)));
    }

    #[test]
    fn arena_corners_have_two_exits() {
        let rooms = Rooms::load().unwrap();
        assert_eq!(rooms.get(&arena_room_id(1, 1)).unwrap().exits.len(), 2);
        assert_eq!(rooms.get(&arena_room_id(5, 5)).unwrap().exits.len(), 4);
    }
}
