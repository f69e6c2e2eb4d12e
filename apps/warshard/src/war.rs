//! The war state machine.
//!
//! Phases run Inactive -> Countdown -> Active <-> ArenaShrinking -> Ending
//! -> Inactive. Every timed step is a scheduled event on the world's event
//! heap, stamped with the war `epoch` it was scheduled under; a fired event
//! whose epoch or phase no longer matches is a stale timer and must no-op.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::persist::{self, PlayerWarMark};
use crate::rooms;
use crate::{CharacterId, EventKind, Rng64, World};

pub const WAR_COOLDOWN_MS: u64 = 60_000;
pub const COUNTDOWN_MS: u64 = 60_000;
/// Seconds-remaining marks for countdown and reboot announcements.
pub const NOTICE_MARKS_S: [u64; 6] = [30, 10, 5, 3, 2, 1];
pub const MIN_PARTICIPANTS: usize = 2;
pub const CLASS_SELECT_GRACE_MS: u64 = 30_000;
/// First arena shrink: 15 minutes for small wars, 30 for large ones.
pub const FIRST_SHRINK_SMALL_MS: u64 = 900_000;
pub const FIRST_SHRINK_LARGE_MS: u64 = 1_800_000;
pub const LARGE_WAR_THRESHOLD: usize = 30;
pub const SHRINK_MIN_MS: u64 = 120_000;
pub const SHRINK_MAX_MS: u64 = 180_000;
pub const REBOOT_DELAY_MS: u64 = 60_000;
pub const SOLO_WIN_BONUS: u32 = 5;
pub const TEAM_WIN_BONUS: u32 = 1;
pub const GERKIN_COOLDOWN_MIN_MS: u64 = 120_000;
pub const GERKIN_COOLDOWN_MAX_MS: u64 = 180_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarType {
    FreeForAll,
    Team,
    BestVsRest,
}

impl WarType {
    pub const ALL: [WarType; 3] = [WarType::FreeForAll, WarType::Team, WarType::BestVsRest];

    pub fn as_str(self) -> &'static str {
        match self {
            WarType::FreeForAll => "free for all",
            WarType::Team => "team",
            WarType::BestVsRest => "best vs rest",
        }
    }

    /// Single-letter code used in per-player war marks.
    pub fn code(self) -> &'static str {
        match self {
            WarType::FreeForAll => "F",
            WarType::Team => "T",
            WarType::BestVsRest => "B",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "ffa" | "free" | "free for all" => Some(WarType::FreeForAll),
            "team" => Some(WarType::Team),
            "bvr" | "best" | "best vs rest" => Some(WarType::BestVsRest),
            _ => None,
        }
    }

    pub fn has_teams(self) -> bool {
        !matches!(self, WarType::FreeForAll)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarState {
    Inactive,
    Countdown,
    Active,
    ArenaShrinking,
    Ending,
}

impl WarState {
    pub fn as_str(self) -> &'static str {
        match self {
            WarState::Inactive => "inactive",
            WarState::Countdown => "countdown",
            WarState::Active => "active",
            WarState::ArenaShrinking => "arena_shrinking",
            WarState::Ending => "ending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    One,
    Two,
}

impl Side {
    pub fn index(self) -> usize {
        match self {
            Side::One => 0,
            Side::Two => 1,
        }
    }

    pub fn label(self, war_type: WarType) -> &'static str {
        match (war_type, self) {
            (WarType::BestVsRest, Side::One) => "enforcers",
            (WarType::BestVsRest, Side::Two) => "players",
            (_, Side::One) => "team1",
            (_, Side::Two) => "team2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarClass {
    Fighter,
    Kamikaze,
    Mage,
    Hunter,
}

impl WarClass {
    pub fn as_str(self) -> &'static str {
        match self {
            WarClass::Fighter => "fighter",
            WarClass::Kamikaze => "kamikaze",
            WarClass::Mage => "mage",
            WarClass::Hunter => "hunter",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "fighter" => Some(WarClass::Fighter),
            "kamikaze" => Some(WarClass::Kamikaze),
            "mage" => Some(WarClass::Mage),
            "hunter" => Some(WarClass::Hunter),
            _ => None,
        }
    }
}

/// One completed war, as remembered forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarRecord {
    pub ended_unix: i64,
    pub war_type: String,
    pub participants: Vec<String>,
    pub winner: String,
    pub duration_s: u64,
}

#[derive(Debug)]
pub struct War {
    pub state: WarState,
    pub war_type: Option<WarType>,
    /// Bumped when a countdown starts and when a war ends; scheduled war
    /// events carry the epoch they belong to.
    pub epoch: u64,
    pub arena_size: u32,
    pub countdown_started_ms: Option<u64>,
    pub started_ms: Option<u64>,
    pub participants: Vec<CharacterId>,
    pub participant_names: Vec<String>,
    pub kills_at_start: HashMap<CharacterId, u32>,
    pub votes: HashMap<String, WarType>,
    pub first_blood: bool,
    pub gerkin_holder: Option<CharacterId>,
    pub gerkin_claimed: [bool; 2],
    pub dogs_scheduled: bool,
    pub class_select_until_ms: u64,
    pub last_war_end_ms: Option<u64>,
    pub history: Vec<WarRecord>,
}

impl War {
    pub fn new(history: Vec<WarRecord>) -> Self {
        Self {
            state: WarState::Inactive,
            war_type: None,
            epoch: 0,
            arena_size: rooms::ARENA_SIZE,
            countdown_started_ms: None,
            started_ms: None,
            participants: Vec::new(),
            participant_names: Vec::new(),
            kills_at_start: HashMap::new(),
            votes: HashMap::new(),
            first_blood: false,
            gerkin_holder: None,
            gerkin_claimed: [false, false],
            dogs_scheduled: false,
            class_select_until_ms: 0,
            last_war_end_ms: None,
            history,
        }
    }

    /// Combat is allowed in both phases of a running war.
    pub fn in_progress(&self) -> bool {
        matches!(self.state, WarState::Active | WarState::ArenaShrinking)
    }

    pub fn can_start(
        &self,
        now_ms: u64,
        eligible: usize,
        reboot_pending: bool,
    ) -> Result<(), String> {
        if reboot_pending {
            return Err("The mud is about to reboot.".to_string());
        }
        if let Some(end) = self.last_war_end_ms {
            let since = now_ms.saturating_sub(end);
            if since < WAR_COOLDOWN_MS {
                return Err("Must wait 60 seconds between wars.".to_string());
            }
        }
        if eligible < MIN_PARTICIPANTS {
            return Err("Need at least 2 players with 'war on' to start.".to_string());
        }
        if self.state != WarState::Inactive {
            return Err("War already in progress.".to_string());
        }
        Ok(())
    }

    pub fn register_vote(&mut self, voter: &str, token: &str) -> Option<WarType> {
        let wt = WarType::parse(token)?;
        self.votes.insert(voter.to_string(), wt);
        Some(wt)
    }

    /// One entry per vote plus one per type unconditionally, then a uniform
    /// pick. Unanimous votes are likely but never guaranteed.
    pub fn vote_multiset(&self) -> Vec<WarType> {
        let mut pool: Vec<WarType> = self.votes.values().copied().collect();
        pool.extend(WarType::ALL);
        pool
    }

    pub fn resolve_type(&self, rng: &mut Rng64) -> WarType {
        let pool = self.vote_multiset();
        let i = rng.roll_range(0, pool.len() as i32 - 1) as usize;
        pool[i]
    }

    fn reset_transients(&mut self) {
        self.participants.clear();
        self.participant_names.clear();
        self.kills_at_start.clear();
        self.first_blood = false;
        self.gerkin_holder = None;
        self.gerkin_claimed = [false, false];
        self.dogs_scheduled = false;
        self.countdown_started_ms = None;
        self.started_ms = None;
        self.arena_size = rooms::ARENA_SIZE;
    }
}

/// Sort by level descending, then alternate assignment for balance.
pub fn partition_by_level(mut players: Vec<(CharacterId, u32)>) -> Vec<(CharacterId, Side)> {
    players.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    players
        .into_iter()
        .enumerate()
        .map(|(i, (cid, _))| {
            let side = if i % 2 == 0 { Side::One } else { Side::Two };
            (cid, side)
        })
        .collect()
}

/// Enforcer-linked characters form side one, everyone else side two.
pub fn partition_best_vs_rest(players: Vec<(CharacterId, bool)>) -> Vec<(CharacterId, Side)> {
    players
        .into_iter()
        .map(|(cid, enforcer)| (cid, if enforcer { Side::One } else { Side::Two }))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Solo(CharacterId),
    Nobody,
    SideWins(Side),
}

/// Terminal-condition check over the living participants.
pub fn evaluate_win(
    war_type: WarType,
    alive: &[(CharacterId, Option<Side>)],
) -> Option<Winner> {
    if war_type.has_teams() {
        let one = alive.iter().filter(|(_, s)| *s == Some(Side::One)).count();
        let two = alive.iter().filter(|(_, s)| *s == Some(Side::Two)).count();
        if one == 0 && two == 0 {
            Some(Winner::Nobody)
        } else if one == 0 {
            Some(Winner::SideWins(Side::Two))
        } else if two == 0 {
            Some(Winner::SideWins(Side::One))
        } else {
            None
        }
    } else {
        match alive {
            [] => Some(Winner::Nobody),
            [(cid, _)] => Some(Winner::Solo(*cid)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestration over the world. All of these run on the world task.
// ---------------------------------------------------------------------------

/// `push button`: request a war start. Total; returns the denial reason
/// instead of changing anything when preconditions fail.
pub fn start_countdown(world: &mut World, initiator: CharacterId) -> Result<(), String> {
    let (name, is_ghost) = {
        let p = world
            .chars
            .get(&initiator)
            .ok_or_else(|| "You are nobody.".to_string())?;
        (p.name.clone(), p.is_ghost)
    };
    if !is_ghost {
        return Err("Only ghosts can push the war button.".to_string());
    }

    let eligible = world.eligible_ghosts().len();
    let now = world.now_ms();
    world
        .war
        .can_start(now, eligible, world.reboot_at_ms.is_some())?;

    world.war.epoch += 1;
    let epoch = world.war.epoch;
    world.war.state = WarState::Countdown;
    world.war.countdown_started_ms = Some(now);
    let wt = world.war.resolve_type(&mut world.rng);
    world.war.war_type = Some(wt);
    world.war.votes.clear();

    world.broadcast_all(&format!("{name} has pushed the war button!"));
    world.broadcast_all(&format!("WAR TYPE: {}", wt.as_str().to_uppercase()));
    world.broadcast_all("60 seconds until war begins!");
    world.broadcast_all("Set 'war on' to participate!");

    world.schedule_in_ms(COUNTDOWN_MS, EventKind::WarBegin { epoch });
    for s in NOTICE_MARKS_S {
        world.schedule_in_ms(
            COUNTDOWN_MS - s * 1000,
            EventKind::WarNotice {
                epoch,
                remaining_s: s,
            },
        );
    }
    Ok(())
}

/// Pure observer; fires during countdown only.
pub fn countdown_notice(world: &mut World, epoch: u64, remaining_s: u64) {
    if world.war.epoch != epoch || world.war.state != WarState::Countdown {
        debug!(epoch, "stale countdown notice");
        return;
    }
    world.broadcast_all(&format!("{remaining_s} seconds until war!"));
}

/// T-0: re-snapshot eligibility and either begin the war or abort.
pub fn begin(world: &mut World, epoch: u64) {
    if world.war.epoch != epoch || world.war.state != WarState::Countdown {
        debug!(epoch, "stale war begin timer");
        return;
    }

    let participants = world.eligible_ghosts();
    if participants.len() < MIN_PARTICIPANTS {
        world.broadcast_all("Not enough players! War cancelled.");
        world.war.state = WarState::Inactive;
        world.war.countdown_started_ms = None;
        return;
    }

    let now = world.now_ms();
    let wt = world.war.war_type.unwrap_or(WarType::FreeForAll);
    world.war.state = WarState::Active;
    world.war.started_ms = Some(now);
    world.war.first_blood = false;
    world.war.gerkin_holder = None;
    world.war.gerkin_claimed = [false, false];
    world.war.dogs_scheduled = false;
    world.war.arena_size = rooms::ARENA_SIZE;
    world.war.participants = participants.clone();
    world.war.participant_names = participants
        .iter()
        .filter_map(|cid| world.chars.get(cid).map(|c| c.name.clone()))
        .collect();
    world.war.kills_at_start = participants
        .iter()
        .filter_map(|cid| world.chars.get(cid).map(|c| (*cid, c.kills)))
        .collect();
    world.war.class_select_until_ms = now + CLASS_SELECT_GRACE_MS;

    if wt.has_teams() {
        assign_sides(world, wt, &participants);
    }

    for cid in &participants {
        let spawn = rooms::backbone_room_id(
            world.rng.roll_range(1, rooms::BACKBONE_ROOMS as i32) as u32,
        );
        if let Some(c) = world.chars.get_mut(cid) {
            c.is_ghost = false;
            c.hp = c.max_hp;
            c.sp = c.max_sp;
        }
        world.tell_char(*cid, "You feel life surge through your body!");
        world.move_char(*cid, &spawn);
        if wt.has_teams() {
            world.tell_char(*cid, "Choose your class: fighter, kamikaze, mage, hunter");
            world.tell_char(
                *cid,
                "You have 30 seconds to choose or you'll be classless.",
            );
        }
        world.tell_char(*cid, "The war has begun! Kill or be killed!");
    }

    world.broadcast_all("THE WAR HAS BEGUN!");

    let first_shrink = if participants.len() < LARGE_WAR_THRESHOLD {
        FIRST_SHRINK_SMALL_MS
    } else {
        FIRST_SHRINK_LARGE_MS
    };
    world.schedule_in_ms(first_shrink, EventKind::ArenaShrink { epoch });
}

fn assign_sides(world: &mut World, wt: WarType, participants: &[CharacterId]) {
    let assignments = match wt {
        WarType::Team => {
            let levels = participants
                .iter()
                .filter_map(|cid| world.chars.get(cid).map(|c| (*cid, c.level)))
                .collect();
            partition_by_level(levels)
        }
        WarType::BestVsRest => {
            let flags = participants
                .iter()
                .filter_map(|cid| world.chars.get(cid).map(|c| (*cid, c.linked_enforcer)))
                .collect();
            partition_best_vs_rest(flags)
        }
        WarType::FreeForAll => Vec::new(),
    };

    let mut names: [Vec<String>; 2] = [Vec::new(), Vec::new()];
    for (cid, side) in assignments {
        if let Some(c) = world.chars.get_mut(&cid) {
            c.side = Some(side);
            names[side.index()].push(c.name.clone());
        }
    }
    for side in [Side::One, Side::Two] {
        world.broadcast_all(&format!(
            "{}: {}",
            side.label(wt).to_uppercase(),
            names[side.index()].join(", ")
        ));
    }
}

/// Periodic shrink: squeeze the arena one step and pull the living into it.
pub fn shrink_arena(world: &mut World, epoch: u64) {
    if world.war.epoch != epoch || world.war.state != WarState::Active {
        debug!(epoch, "stale arena shrink timer");
        return;
    }

    world.war.state = WarState::ArenaShrinking;
    world.war.arena_size = world.war.arena_size.saturating_sub(1).max(1);
    let n = world.war.arena_size;
    world.broadcast_all(&format!(
        "DEATH grows impatient! Arena shrinking to {n}x{n}!"
    ));

    for cid in world.alive_participants() {
        let x = world.rng.roll_range(1, n as i32) as u32;
        let y = world.rng.roll_range(1, n as i32) as u32;
        world.move_char(cid, &rooms::arena_room_id(x, y));
        world.tell_char(cid, "You have been transported to the arena!");
    }

    world.war.state = WarState::Active;

    if n > 1 {
        let delay = world
            .rng
            .roll_range(SHRINK_MIN_MS as i32, SHRINK_MAX_MS as i32) as u64;
        world.schedule_in_ms(delay, EventKind::ArenaShrink { epoch });
    } else if !world.war.dogs_scheduled {
        world.war.dogs_scheduled = true;
        let delay = world
            .rng
            .roll_range(SHRINK_MIN_MS as i32, SHRINK_MAX_MS as i32) as u64;
        world.schedule_in_ms(delay, EventKind::WarDogs { epoch });
    }
}

/// Final-arena hazard. A notification hook, not a state transition.
pub fn release_dogs(world: &mut World, epoch: u64) {
    if world.war.epoch != epoch
        || world.war.state != WarState::Active
        || world.war.arena_size != 1
    {
        debug!(epoch, "stale dogs-of-war timer");
        return;
    }
    world.broadcast_all("DEATH releases the DOGS OF WAR!");
    for cid in world.alive_participants() {
        world.tell_char(cid, "A vicious war dog appears and attacks you!");
    }
}

/// Kill bookkeeping: announcement, gerkin rites, killer statistics. Death
/// handling itself lives in the combat engine, which calls this first.
pub fn handle_kill(world: &mut World, killer: CharacterId, victim: CharacterId) {
    if world.war.state != WarState::Active {
        debug!("kill reported outside an active war");
        return;
    }

    let Some((killer_name, killer_ghost, killer_side, killer_has_gerkin)) = world
        .chars
        .get(&killer)
        .map(|c| (c.name.clone(), c.is_ghost, c.side, c.has_gerkin))
    else {
        return;
    };
    let Some((victim_name, victim_had_gerkin)) = world
        .chars
        .get(&victim)
        .map(|c| (c.name.clone(), c.has_gerkin))
    else {
        return;
    };

    world.broadcast_all(&format!("{killer_name} just killed {victim_name}!"));

    let wt = world.war.war_type.unwrap_or(WarType::FreeForAll);

    // First-blood gerkin. FFA: one grant per war. Team wars: each side
    // claims its own, once, and only while nobody on that side holds it.
    if !killer_ghost {
        if wt.has_teams() {
            if let Some(side) = killer_side {
                if !world.war.gerkin_claimed[side.index()] && !side_holds_gerkin(world, side) {
                    world.war.gerkin_claimed[side.index()] = true;
                    grant_gerkin(world, killer);
                }
            }
        } else if !world.war.first_blood {
            grant_gerkin(world, killer);
        }
    }
    world.war.first_blood = true;

    // Transfer on kill, guarded so a side never ends up with two spirits.
    if victim_had_gerkin {
        if let Some(v) = world.chars.get_mut(&victim) {
            v.has_gerkin = false;
        }
        world.war.gerkin_holder = None;
        let side_blocked = killer_side.is_some_and(|s| side_holds_gerkin(world, s));
        if !killer_ghost && !killer_has_gerkin && !side_blocked {
            if let Some(k) = world.chars.get_mut(&killer) {
                k.has_gerkin = true;
            }
            world.war.gerkin_holder = Some(killer);
            world.broadcast_all(&format!(
                "The spirit of Gerkin transfers to {killer_name}!"
            ));
        }
    }

    if let Some(k) = world.chars.get_mut(&killer) {
        k.kills += 1;
        if k.best_kill.is_none() {
            k.best_kill = Some(victim_name);
        }
    }
}

fn side_holds_gerkin(world: &World, side: Side) -> bool {
    world.war.participants.iter().any(|cid| {
        world
            .chars
            .get(cid)
            .is_some_and(|c| !c.is_ghost && c.side == Some(side) && c.has_gerkin)
    })
}

fn grant_gerkin(world: &mut World, cid: CharacterId) {
    let Some(c) = world.chars.get_mut(&cid) else {
        return;
    };
    c.has_gerkin = true;
    c.gerkin_ready_ms = world.now_ms;
    let name = c.name.clone();
    world.war.gerkin_holder = Some(cid);
    world.tell_char(cid, "The spirit of Gerkin descends from the sky to aid you!");
    world.broadcast_all(&format!(
        "{name} has been blessed by the spirit of Gerkin!"
    ));
}

/// Evaluated after every kill. Once a terminal condition holds the war ends
/// and this becomes a no-op for the rest of the instance.
pub fn check_win(world: &mut World) {
    if world.war.state != WarState::Active {
        return;
    }
    let wt = world.war.war_type.unwrap_or(WarType::FreeForAll);
    let alive: Vec<(CharacterId, Option<Side>)> = world
        .alive_participants()
        .into_iter()
        .map(|cid| (cid, world.chars.get(&cid).and_then(|c| c.side)))
        .collect();
    if let Some(winner) = evaluate_win(wt, &alive) {
        end_war(world, winner);
    }
}

fn end_war(world: &mut World, winner: Winner) {
    world.war.state = WarState::Ending;
    // Cancels every pending countdown/shrink/dogs timer for this instance.
    world.war.epoch += 1;

    let now = world.now_ms();
    let wt = world.war.war_type.unwrap_or(WarType::FreeForAll);
    let ended_unix = chrono::Utc::now().timestamp();

    let winner_label = match winner {
        Winner::Solo(cid) => {
            let name = world
                .chars
                .get(&cid)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| "somebody".to_string());
            world.broadcast_all(&format!("{name} has won the war!"));
            if let Some(c) = world.chars.get_mut(&cid) {
                c.kills += SOLO_WIN_BONUS;
            }
            name
        }
        Winner::SideWins(side) => {
            let label = side.label(wt);
            world.broadcast_all(&format!(
                "Team {} has won the war!",
                label.to_uppercase()
            ));
            // Death clears a combatant's side, so this reaches exactly the
            // surviving members of the winning side.
            for cid in world.war.participants.clone() {
                if let Some(c) = world.chars.get_mut(&cid) {
                    if c.side == Some(side) {
                        c.kills += TEAM_WIN_BONUS;
                    }
                }
            }
            label.to_string()
        }
        Winner::Nobody => {
            world.broadcast_all("No one survived the war!");
            "nobody".to_string()
        }
    };

    let duration_s = now.saturating_sub(world.war.started_ms.unwrap_or(now)) / 1000;
    let record = WarRecord {
        ended_unix,
        war_type: wt.as_str().to_string(),
        participants: world.war.participant_names.clone(),
        winner: winner_label,
        duration_s,
    };
    world.war.history.push(record);
    if let Err(e) = persist::save_war_history(&world.wars_path, &world.war.history) {
        error!(err = %e, "failed to persist war history");
    }

    // Per-player marks for finger/records.
    for cid in world.war.participants.clone() {
        let baseline = world.war.kills_at_start.get(&cid).copied().unwrap_or(0);
        let won = match winner {
            Winner::Solo(w) => w == cid,
            Winner::SideWins(side) => world
                .chars
                .get(&cid)
                .is_some_and(|c| c.side == Some(side)),
            Winner::Nobody => false,
        };
        if let Some(c) = world.chars.get_mut(&cid) {
            let mark = PlayerWarMark {
                ended_unix,
                war_type: wt.code().to_string(),
                won,
                kills: c.kills.saturating_sub(baseline),
            };
            c.wars_fought.push(mark);
        }
    }

    world.war.reset_transients();
    world.war.state = WarState::Inactive;
    world.war.last_war_end_ms = Some(now);

    world.broadcast_all("The mud will reboot in 60 seconds!");
    world.reboot_at_ms = Some(now + REBOOT_DELAY_MS);
    world.schedule_in_ms(REBOOT_DELAY_MS, EventKind::Reboot);
    for s in NOTICE_MARKS_S {
        world.schedule_in_ms(
            REBOOT_DELAY_MS - s * 1000,
            EventKind::RebootNotice { remaining_s: s },
        );
    }
}

pub fn reboot_notice(world: &mut World, remaining_s: u64) {
    if world.reboot_at_ms.is_none() {
        debug!("stale reboot notice");
        return;
    }
    world.broadcast_all(&format!("Rebooting in {remaining_s} seconds!"));
}

/// Persist everyone, say goodbye, and hand control back to the supervisor.
pub fn reboot(world: &mut World) {
    if world.reboot_at_ms.take().is_none() {
        debug!("stale reboot timer");
        return;
    }
    world.broadcast_all("Rebooting NOW!");
    world.save_all();
    world.broadcast_all("=== MUD REBOOTING ===");
    world.close_all_sessions();
    world.restart_requested = true;
}

/// `class <name>` during the selection grace window of a team war.
pub fn choose_class(world: &mut World, cid: CharacterId, token: &str) -> String {
    if !world.war.in_progress() {
        return "There is no war in progress.".to_string();
    }
    let wt = world.war.war_type.unwrap_or(WarType::FreeForAll);
    if !wt.has_teams() {
        return "Free for all wars have no classes.".to_string();
    }
    if !world.war.participants.contains(&cid) {
        return "You are not in this war.".to_string();
    }
    let now = world.now_ms();
    if now > world.war.class_select_until_ms {
        return "Too late to choose a class now.".to_string();
    }
    let Some(class) = WarClass::parse(token) else {
        return "Choose one of: fighter, kamikaze, mage, hunter.".to_string();
    };

    let Some(c) = world.chars.get_mut(&cid) else {
        return "You are nobody.".to_string();
    };
    if c.is_ghost {
        return "Ghosts have no need of classes.".to_string();
    }

    // Re-choosing inside the grace window re-applies from base stats.
    c.max_hp = c.base_max_hp;
    c.max_sp = c.base_max_sp;
    c.war_class = Some(class);
    match class {
        WarClass::Fighter => {
            c.max_hp = c.base_max_hp * 3 / 2;
            c.max_sp = 0;
        }
        WarClass::Mage => {
            c.max_sp = c.base_max_sp * 3 / 2;
        }
        WarClass::Kamikaze | WarClass::Hunter => {}
    }
    c.hp = c.max_hp;
    c.sp = c.max_sp;
    format!("You are now a {}!", class.as_str())
}

/// The gerkin hunt power: teleport to a living target, then cool down.
pub fn gerkin_hunt(world: &mut World, user: CharacterId, target_token: &str) -> String {
    let Some(u) = world.chars.get(&user) else {
        return "You are nobody.".to_string();
    };
    if !u.has_gerkin {
        return "You do not carry the spirit of Gerkin.".to_string();
    }
    if u.is_ghost || !world.war.in_progress() {
        return "Gerkin only hunts during a war.".to_string();
    }
    let now = world.now_ms();
    if now < u.gerkin_ready_ms {
        let left = (u.gerkin_ready_ms - now).div_ceil(1000);
        return format!("Gerkin is not ready yet. ({left} seconds remaining)");
    }

    let token = target_token.trim();
    let Some(target) = world.find_char_by_name(token).filter(|t| {
        world
            .chars
            .get(t)
            .is_some_and(|c| !c.is_ghost)
    }) else {
        return format!("Gerkin cannot find '{token}' among the living.");
    };
    if target == user {
        return "Gerkin refuses to hunt you!".to_string();
    }

    let dest = world.chars[&target].room_id.clone();
    let target_name = world.chars[&target].name.clone();
    let cooldown = world
        .rng
        .roll_range(GERKIN_COOLDOWN_MIN_MS as i32, GERKIN_COOLDOWN_MAX_MS as i32)
        as u64;
    if let Some(u) = world.chars.get_mut(&user) {
        u.gerkin_ready_ms = now + cooldown;
    }
    world.move_char(user, &dest);
    format!("Gerkin teleports you to {target_name} and compels you to follow!")
}

const GERKIN_MUTTERS: [&str; 4] = [
    "Gerkin whispers: 'The blood... I need more blood!'",
    "Gerkin cackles madly: 'Kill them all!'",
    "Gerkin mutters: 'So many wars... so much death...'",
    "Gerkin screams: 'DEATH! DEATH TO ALL!'",
];

/// Low-rate flavor whispers to the current holder. Always re-arms.
pub fn gerkin_mutter(world: &mut World) {
    world.schedule_in_ms(45_000, EventKind::GerkinMutter);
    if !world.war.in_progress() {
        return;
    }
    let Some(holder) = world.war.gerkin_holder else {
        return;
    };
    if world.rng.roll_range(0, 2) != 0 {
        return;
    }
    let i = world.rng.roll_range(0, GERKIN_MUTTERS.len() as i32 - 1) as usize;
    world.tell_char(holder, GERKIN_MUTTERS[i]);
}

pub fn render_status(world: &World) -> String {
    let war = &world.war;
    let now = world.now_ms;
    match war.state {
        WarState::Inactive => {
            if let Some(end) = war.last_war_end_ms {
                let since = now.saturating_sub(end) / 1000;
                if since < WAR_COOLDOWN_MS / 1000 {
                    return format!(
                        "War cooldown: {} seconds remaining.\r\n",
                        WAR_COOLDOWN_MS / 1000 - since
                    );
                }
            }
            "No war in progress. Push the button to start!\r\n".to_string()
        }
        WarState::Countdown => {
            let elapsed = now.saturating_sub(war.countdown_started_ms.unwrap_or(now)) / 1000;
            let remaining = (COUNTDOWN_MS / 1000).saturating_sub(elapsed);
            format!(
                "War starting in {remaining} seconds! Type: {}\r\n",
                war.war_type.map(|t| t.as_str()).unwrap_or("?")
            )
        }
        WarState::Active => {
            let duration = now.saturating_sub(war.started_ms.unwrap_or(now)) / 1000;
            let alive = world.alive_participants().len();
            format!(
                "War in progress! Type: {}, Duration: {duration}s, Alive: {alive}\r\n",
                war.war_type.map(|t| t.as_str()).unwrap_or("?")
            )
        }
        WarState::ArenaShrinking => format!(
            "Arena shrinking! Current size: {0}x{0}\r\n",
            war.arena_size
        ),
        WarState::Ending => "War ended! Rebooting soon...\r\n".to_string(),
    }
}

pub fn render_alive(world: &World) -> String {
    if !world.war.in_progress() {
        return "No war in progress.\r\n".to_string();
    }
    let wt = world.war.war_type.unwrap_or(WarType::FreeForAll);
    let alive = world.alive_participants();

    let mut s = String::new();
    if wt.has_teams() {
        for side in [Side::One, Side::Two] {
            s.push_str(&format!("{}:\r\n", side.label(wt)));
            for cid in &alive {
                let Some(c) = world.chars.get(cid) else {
                    continue;
                };
                if c.side != Some(side) {
                    continue;
                }
                s.push_str(&format!(
                    " - {} (level {}) [{}]{}\r\n",
                    c.name,
                    c.level,
                    c.war_class.map(|w| w.as_str()).unwrap_or("none"),
                    if c.has_gerkin { " *gerkin*" } else { "" }
                ));
            }
        }
    } else {
        s.push_str("alive:\r\n");
        for cid in &alive {
            let Some(c) = world.chars.get(cid) else {
                continue;
            };
            s.push_str(&format!(
                " - {} (level {}){}\r\n",
                c.name,
                c.level,
                if c.has_gerkin { " *gerkin*" } else { "" }
            ));
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn war_type_tokens_parse() {
        assert_eq!(WarType::parse("ffa"), Some(WarType::FreeForAll));
        assert_eq!(WarType::parse("FREE"), Some(WarType::FreeForAll));
        assert_eq!(WarType::parse("team"), Some(WarType::Team));
        assert_eq!(WarType::parse("bvr"), Some(WarType::BestVsRest));
        assert_eq!(WarType::parse("best"), Some(WarType::BestVsRest));
        assert_eq!(WarType::parse("melee"), None);
    }

    #[test]
    fn vote_multiset_weights_votes_plus_one_each() {
        let mut war = War::new(Vec::new());
        war.register_vote("ash", "team");
        war.register_vote("bel", "team");
        war.register_vote("cor", "ffa");
        let pool = war.vote_multiset();
        assert_eq!(pool.len(), 6);
        assert_eq!(pool.iter().filter(|t| **t == WarType::Team).count(), 3);
        assert_eq!(
            pool.iter().filter(|t| **t == WarType::FreeForAll).count(),
            2
        );
        assert_eq!(
            pool.iter().filter(|t| **t == WarType::BestVsRest).count(),
            1
        );
    }

    #[test]
    fn unvoted_war_still_resolves() {
        let war = War::new(Vec::new());
        let mut rng = Rng64::from_seed(7);
        for _ in 0..20 {
            let t = war.resolve_type(&mut rng);
            assert!(WarType::ALL.contains(&t));
        }
    }

    #[test]
    fn revoting_replaces_the_previous_vote() {
        let mut war = War::new(Vec::new());
        war.register_vote("ash", "team");
        war.register_vote("ash", "ffa");
        assert_eq!(war.vote_multiset().len(), 4);
    }

    #[test]
    fn can_start_denials() {
        let mut war = War::new(Vec::new());
        assert!(war.can_start(5_000, 2, true).is_err());
        assert!(war
            .can_start(5_000, 1, false)
            .unwrap_err()
            .contains("at least 2"));
        assert!(war.can_start(5_000, 2, false).is_ok());

        war.last_war_end_ms = Some(10_000);
        assert!(war
            .can_start(30_000, 2, false)
            .unwrap_err()
            .contains("60 seconds"));
        assert!(war.can_start(70_000, 2, false).is_ok());

        war.state = WarState::Countdown;
        assert!(war
            .can_start(200_000, 2, false)
            .unwrap_err()
            .contains("already in progress"));
    }

    #[test]
    fn level_partition_alternates_and_covers_everyone() {
        let players = vec![(1, 5), (2, 9), (3, 1), (4, 7), (5, 3)];
        let out = partition_by_level(players);
        assert_eq!(out.len(), 5);
        // Sorted by level desc: 2(9), 4(7), 1(5), 5(3), 3(1).
        assert_eq!(out[0], (2, Side::One));
        assert_eq!(out[1], (4, Side::Two));
        assert_eq!(out[2], (1, Side::One));
        assert_eq!(out[3], (5, Side::Two));
        assert_eq!(out[4], (3, Side::One));

        let one = out.iter().filter(|(_, s)| *s == Side::One).count();
        let two = out.iter().filter(|(_, s)| *s == Side::Two).count();
        assert_eq!(one + two, 5);
        assert!(one.abs_diff(two) <= 1);
    }

    #[test]
    fn best_vs_rest_partition_follows_enforcer_links() {
        let out = partition_best_vs_rest(vec![(1, true), (2, false), (3, false)]);
        assert_eq!(out[0].1, Side::One);
        assert_eq!(out[1].1, Side::Two);
        assert_eq!(out[2].1, Side::Two);
    }

    #[test]
    fn ffa_win_evaluation() {
        assert_eq!(
            evaluate_win(WarType::FreeForAll, &[(1, None), (2, None)]),
            None
        );
        assert_eq!(
            evaluate_win(WarType::FreeForAll, &[(1, None)]),
            Some(Winner::Solo(1))
        );
        assert_eq!(
            evaluate_win(WarType::FreeForAll, &[]),
            Some(Winner::Nobody)
        );
    }

    #[test]
    fn team_win_evaluation() {
        let both = [(1, Some(Side::One)), (2, Some(Side::Two))];
        assert_eq!(evaluate_win(WarType::Team, &both), None);
        assert_eq!(
            evaluate_win(WarType::Team, &[(1, Some(Side::One))]),
            Some(Winner::SideWins(Side::One))
        );
        assert_eq!(
            evaluate_win(WarType::BestVsRest, &[(2, Some(Side::Two))]),
            Some(Winner::SideWins(Side::Two))
        );
        assert_eq!(evaluate_win(WarType::Team, &[]), Some(Winner::Nobody));
    }

    #[test]
    fn side_labels_depend_on_war_type() {
        assert_eq!(Side::One.label(WarType::Team), "team1");
        assert_eq!(Side::Two.label(WarType::Team), "team2");
        assert_eq!(Side::One.label(WarType::BestVsRest), "enforcers");
        assert_eq!(Side::Two.label(WarType::BestVsRest), "players");
    }
}
