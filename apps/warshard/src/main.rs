#![allow(dead_code)]

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use zeroize::Zeroize;

use mudio::line::LineAssembler;
use mudio::telnet::NegotiationFilter;

mod combat;
mod items;
mod persist;
mod rooms;
mod war;

pub type CharacterId = u64;
pub type SessionId = u64;

pub const ROOM_WARROOM: &str = "warroom";
pub const ROOM_OBSERVATION: &str = "observation_room";
pub const ROOM_SHOP: &str = "shop";

const CHECKPOINT_MS: u64 = 300_000;
const GERKIN_MUTTER_MS: u64 = 45_000;
const MAX_PASSWORD_ATTEMPTS: u32 = 3;
const MIN_PASSWORD_LEN: usize = 4;
const MAX_LINE_BYTES: usize = 512;

const GREETING: &str = "\
Welcome to the war.\r\n\
Ghosts drift, the button waits, and the arena is always hungry.\r\n\
\r\n\
What is your name? ";

fn usage_and_exit() -> ! {
    eprintln!(
        "usage: warshard [--bind <addr:port>] [--data <dir>] [--seed <u64>]\n\
         \n\
         defaults: --bind 127.0.0.1:2222 --data ./data --seed from entropy"
    );
    std::process::exit(2);
}

#[derive(Debug, Clone)]
struct Config {
    bind: SocketAddr,
    data_dir: PathBuf,
    world_seed: u64,
}

fn parse_args() -> Config {
    let mut cfg = Config {
        bind: "127.0.0.1:2222".parse().expect("default bind parses"),
        data_dir: PathBuf::from("data"),
        world_seed: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1),
    };

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--bind" => {
                let Some(v) = args.next() else { usage_and_exit() };
                let Ok(addr) = v.parse() else { usage_and_exit() };
                cfg.bind = addr;
            }
            "--data" => {
                let Some(v) = args.next() else { usage_and_exit() };
                cfg.data_dir = PathBuf::from(v);
            }
            "--seed" => {
                let Some(v) = args.next() else { usage_and_exit() };
                let Ok(seed) = v.parse() else { usage_and_exit() };
                cfg.world_seed = seed;
            }
            _ => usage_and_exit(),
        }
    }
    cfg
}

#[derive(Debug, Clone)]
pub struct Rng64 {
    state: u64,
}

impl Rng64 {
    pub fn from_seed(seed: u64) -> Self {
        let mut s = seed;
        if s == 0 {
            s = 0x9e3779b97f4a7c15;
        }
        Self { state: s }
    }

    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    pub fn roll_range(&mut self, lo: i32, hi_inclusive: i32) -> i32 {
        debug_assert!(lo <= hi_inclusive);
        let span = (hi_inclusive - lo + 1) as u64;
        let v = (self.next_u64() % span) as i32;
        lo + v
    }
}

#[derive(Debug, Clone)]
pub struct Character {
    pub id: CharacterId,
    pub controller: Option<SessionId>,
    pub name: String,
    pub password_hash: String,
    pub room_id: String,
    pub level: u32,
    pub coins: u32,
    pub strength: i32,
    pub hp: i32,
    pub max_hp: i32,
    pub sp: i32,
    pub max_sp: i32,
    // Class bonuses are per-war; death restores from these.
    pub base_max_hp: i32,
    pub base_max_sp: i32,
    pub is_ghost: bool,
    pub war_enabled: bool,
    pub war_class: Option<war::WarClass>,
    pub side: Option<war::Side>,
    pub has_gerkin: bool,
    pub gerkin_ready_ms: u64,
    pub linked_enforcer: bool,
    pub wimpy_percent: u32,
    pub kills: u32,
    pub deaths: u32,
    pub best_kill: Option<String>,
    pub watching_war: bool,
    pub linkdead: bool,
    pub inv: Vec<items::Item>,
    pub wielded: Option<&'static items::WeaponDef>,
    pub created_unix: i64,
    pub last_login_unix: i64,
    pub wars_fought: Vec<persist::PlayerWarMark>,
}

impl Character {
    pub fn display_name(&self) -> String {
        if self.linkdead && !self.is_ghost {
            format!("Statue of {}", self.name)
        } else if self.is_ghost {
            format!("ghost of {}", self.name)
        } else if self.has_gerkin {
            format!("{} *", self.name)
        } else {
            self.name.clone()
        }
    }
}

fn title_for_level(level: u32) -> &'static str {
    match level {
        0 | 1 => "Private",
        2 => "Corporal",
        3 => "Sergeant",
        4 => "Lieutenant",
        5 => "Captain",
        6 => "Major",
        7 => "Colonel",
        8 => "General",
        9 => "Field Marshal",
        _ => "Grognard",
    }
}

#[derive(Debug)]
pub enum OutFrame {
    Line(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
pub enum SessionPhase {
    AskName,
    AskPassword { name: String, attempts: u32 },
    NewPassword { name: String },
    ConfirmPassword { name: String, first: String },
    Playing,
}

#[derive(Debug)]
pub struct Session {
    pub out: mpsc::UnboundedSender<OutFrame>,
    pub phase: SessionPhase,
    pub character: Option<CharacterId>,
}

#[derive(Debug)]
pub enum NetEvent {
    Connected {
        session: SessionId,
        out: mpsc::UnboundedSender<OutFrame>,
    },
    Line {
        session: SessionId,
        line: String,
    },
    Disconnected {
        session: SessionId,
    },
}

#[derive(Debug, Clone)]
pub enum EventKind {
    WarNotice { epoch: u64, remaining_s: u64 },
    WarBegin { epoch: u64 },
    ArenaShrink { epoch: u64 },
    WarDogs { epoch: u64 },
    RebootNotice { remaining_s: u64 },
    Reboot,
    Checkpoint,
    GerkinMutter,
}

#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub due_ms: u64,
    pub seq: u64,
    pub kind: EventKind,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}
impl Eq for ScheduledEvent {}
impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.due_ms.cmp(&other.due_ms) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            o => o,
        }
    }
}

#[derive(Debug)]
pub struct FightMark {
    pub target: CharacterId,
    pub last_attack_ms: u64,
}

pub struct World {
    pub rooms: rooms::Rooms,
    pub sessions: HashMap<SessionId, Session>,
    pub chars: HashMap<CharacterId, Character>,
    pub occupants: HashMap<String, HashSet<CharacterId>>,
    pub corpses: Vec<items::Corpse>,
    pub fighting: HashMap<CharacterId, FightMark>,
    pub war: war::War,
    pub players: persist::PlayerStore,
    pub wars_path: PathBuf,
    pub rng: Rng64,
    pub next_char_id: CharacterId,
    pub event_seq: u64,
    pub events: BinaryHeap<Reverse<ScheduledEvent>>,
    pub now_ms: u64,
    pub started_unix: i64,
    pub reboot_at_ms: Option<u64>,
    pub restart_requested: bool,
}

impl World {
    pub fn new(
        rooms: rooms::Rooms,
        players: persist::PlayerStore,
        wars_path: PathBuf,
        seed: u64,
        history: Vec<war::WarRecord>,
    ) -> Self {
        Self {
            rooms,
            sessions: HashMap::new(),
            chars: HashMap::new(),
            occupants: HashMap::new(),
            corpses: Vec::new(),
            fighting: HashMap::new(),
            war: war::War::new(history),
            players,
            wars_path,
            rng: Rng64::from_seed(seed),
            next_char_id: 1,
            event_seq: 1,
            events: BinaryHeap::new(),
            now_ms: 0,
            started_unix: chrono::Utc::now().timestamp(),
            reboot_at_ms: None,
            restart_requested: false,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn schedule_at_ms(&mut self, due_ms: u64, kind: EventKind) {
        let seq = self.event_seq;
        self.event_seq = self.event_seq.saturating_add(1);
        self.events
            .push(Reverse(ScheduledEvent { due_ms, seq, kind }));
    }

    pub fn schedule_in_ms(&mut self, delay_ms: u64, kind: EventKind) {
        self.schedule_at_ms(self.now_ms.saturating_add(delay_ms), kind);
    }

    pub fn pop_due_event(&mut self) -> Option<ScheduledEvent> {
        let Reverse(ev) = self.events.peek()?;
        if ev.due_ms > self.now_ms {
            return None;
        }
        let Reverse(ev) = self.events.pop().expect("peek was Some");
        Some(ev)
    }

    /// Fire-and-forget line to a session. A gone session is a no-op.
    pub fn tell_session(&self, session: SessionId, msg: &str) {
        let Some(s) = self.sessions.get(&session) else {
            return;
        };
        let mut b = Vec::with_capacity(msg.len() + 2);
        b.extend_from_slice(msg.as_bytes());
        b.extend_from_slice(b"\r\n");
        let _ = s.out.send(OutFrame::Line(b));
    }

    pub fn tell_char(&self, cid: CharacterId, msg: &str) {
        if let Some(sid) = self.chars.get(&cid).and_then(|c| c.controller) {
            self.tell_session(sid, msg);
        }
    }

    pub fn broadcast_all(&self, msg: &str) {
        for (sid, s) in &self.sessions {
            if matches!(s.phase, SessionPhase::Playing) {
                self.tell_session(*sid, msg);
            }
        }
    }

    pub fn broadcast_room(&self, room_id: &str, msg: &str) {
        self.broadcast_room_except(room_id, msg, &[]);
    }

    pub fn broadcast_room_except(&self, room_id: &str, msg: &str, except: &[CharacterId]) {
        let Some(occ) = self.occupants.get(room_id) else {
            return;
        };
        for cid in occ {
            if except.contains(cid) {
                continue;
            }
            self.tell_char(*cid, msg);
        }
    }

    /// Location-tagged copy for opted-in spectators in the observation room.
    pub fn observer_echo(&self, room_id: &str, msg: &str) {
        let tagged = format!("[{room_id}] {msg}");
        for c in self.chars.values() {
            if c.watching_war && c.room_id == ROOM_OBSERVATION {
                if let Some(sid) = c.controller {
                    self.tell_session(sid, &tagged);
                }
            }
        }
    }

    pub fn char_of_session(&self, session: SessionId) -> Option<CharacterId> {
        self.sessions.get(&session).and_then(|s| s.character)
    }

    pub fn find_char_in_room(&self, room_id: &str, token: &str) -> Option<CharacterId> {
        let occ = self.occupants.get(room_id)?;
        let t = token.trim();
        occ.iter()
            .copied()
            .find(|cid| {
                self.chars
                    .get(cid)
                    .is_some_and(|c| c.name.eq_ignore_ascii_case(t))
            })
    }

    pub fn find_char_by_name(&self, name: &str) -> Option<CharacterId> {
        let t = name.trim();
        self.chars
            .values()
            .find(|c| c.name.eq_ignore_ascii_case(t))
            .map(|c| c.id)
    }

    pub fn move_char(&mut self, cid: CharacterId, to: &str) {
        if !self.rooms.has_room(to) {
            warn!(cid, to, "move to unknown room ignored");
            return;
        }
        let Some(from) = self.chars.get(&cid).map(|c| c.room_id.clone()) else {
            return;
        };
        if let Some(s) = self.occupants.get_mut(&from) {
            s.remove(&cid);
            if s.is_empty() {
                self.occupants.remove(&from);
            }
        }
        self.occupants
            .entry(to.to_string())
            .or_default()
            .insert(cid);
        if let Some(c) = self.chars.get_mut(&cid) {
            c.room_id = to.to_string();
        }
    }

    /// Combatants who would fight if a war started right now.
    pub fn eligible_ghosts(&self) -> Vec<CharacterId> {
        let mut out: Vec<CharacterId> = self
            .chars
            .values()
            .filter(|c| c.war_enabled && c.is_ghost)
            .map(|c| c.id)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn alive_participants(&self) -> Vec<CharacterId> {
        self.war
            .participants
            .iter()
            .copied()
            .filter(|cid| self.chars.get(cid).is_some_and(|c| !c.is_ghost))
            .collect()
    }

    pub fn spawn_character(
        &mut self,
        controller: Option<SessionId>,
        rec: &persist::PlayerRecord,
    ) -> CharacterId {
        let cid = self.next_char_id;
        self.next_char_id = self.next_char_id.saturating_add(1);

        let room_id = self.rooms.start_room().to_string();
        let c = Character {
            id: cid,
            controller,
            name: rec.name.clone(),
            password_hash: rec.password_hash.clone(),
            room_id: room_id.clone(),
            level: rec.level,
            coins: rec.coins,
            strength: 50,
            hp: rec.max_hp,
            max_hp: rec.max_hp,
            sp: rec.max_sp,
            max_sp: rec.max_sp,
            base_max_hp: rec.max_hp,
            base_max_sp: rec.max_sp,
            is_ghost: true,
            war_enabled: rec.war_on,
            war_class: None,
            side: None,
            has_gerkin: false,
            gerkin_ready_ms: 0,
            linked_enforcer: rec.linked_enforcer,
            wimpy_percent: rec.wimpy_percent,
            kills: rec.kills,
            deaths: rec.deaths,
            best_kill: rec.best_kill.clone(),
            watching_war: false,
            linkdead: false,
            inv: Vec::new(),
            wielded: None,
            created_unix: rec.created_unix,
            last_login_unix: rec.last_login_unix,
            wars_fought: rec.wars.clone(),
        };
        self.chars.insert(cid, c);
        self.occupants.entry(room_id).or_default().insert(cid);
        cid
    }

    pub fn record_for(&self, cid: CharacterId) -> Option<persist::PlayerRecord> {
        let c = self.chars.get(&cid)?;
        Some(persist::PlayerRecord {
            name: c.name.clone(),
            password_hash: c.password_hash.clone(),
            level: c.level,
            coins: c.coins,
            kills: c.kills,
            deaths: c.deaths,
            best_kill: c.best_kill.clone(),
            wimpy_percent: c.wimpy_percent,
            war_on: c.war_enabled,
            max_hp: c.base_max_hp,
            max_sp: c.base_max_sp,
            linked_enforcer: c.linked_enforcer,
            created_unix: c.created_unix,
            last_login_unix: c.last_login_unix,
            wars: c.wars_fought.clone(),
        })
    }

    /// Persistence failures never stop play; they are logged and retried at
    /// the next checkpoint.
    pub fn save_char(&self, cid: CharacterId) {
        let Some(rec) = self.record_for(cid) else {
            return;
        };
        if let Err(e) = self.players.save(&rec) {
            error!(err = %e, name = %rec.name, "player save failed");
        }
    }

    pub fn save_all(&self) {
        for cid in self.chars.keys() {
            self.save_char(*cid);
        }
    }

    pub fn close_all_sessions(&mut self) {
        for s in self.sessions.values() {
            let _ = s.out.send(OutFrame::Close);
        }
        self.sessions.clear();
    }

    pub fn prune_corpses(&mut self) {
        let now = self.now_ms;
        self.corpses.retain(|c| !c.is_decayed(now));
    }

    pub fn render_room_for(&self, room_id: &str, viewer: CharacterId) -> String {
        let mut s = self.rooms.render_room(room_id);

        let mut others = Vec::new();
        if let Some(occ) = self.occupants.get(room_id) {
            for cid in occ {
                if *cid == viewer {
                    continue;
                }
                if let Some(c) = self.chars.get(cid) {
                    others.push(c.display_name());
                }
            }
        }
        if others.is_empty() {
            s.push_str("here: nobody else\r\n");
        } else {
            others.sort();
            s.push_str(&format!("here: {}\r\n", others.join(", ")));
        }

        for corpse in &self.corpses {
            if corpse.room_id == room_id {
                s.push_str(&corpse.describe(self.now_ms));
                s.push_str("\r\n");
            }
        }
        s
    }

    pub fn render_uptime(&self) -> String {
        let now_unix = chrono::Utc::now().timestamp();
        format!(
            "uptime:\r\n - wall_unix: {now_unix}\r\n - started_unix: {}\r\n - world_time_ms: {}\r\n",
            self.started_unix, self.now_ms
        )
    }
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

fn process_due_events(world: &mut World) {
    while let Some(ev) = world.pop_due_event() {
        handle_event(world, ev);
    }
}

fn handle_event(world: &mut World, ev: ScheduledEvent) {
    match ev.kind {
        EventKind::WarNotice { epoch, remaining_s } => {
            war::countdown_notice(world, epoch, remaining_s);
        }
        EventKind::WarBegin { epoch } => war::begin(world, epoch),
        EventKind::ArenaShrink { epoch } => war::shrink_arena(world, epoch),
        EventKind::WarDogs { epoch } => war::release_dogs(world, epoch),
        EventKind::RebootNotice { remaining_s } => war::reboot_notice(world, remaining_s),
        EventKind::Reboot => war::reboot(world),
        EventKind::Checkpoint => {
            world.schedule_in_ms(CHECKPOINT_MS, EventKind::Checkpoint);
            world.save_all();
            debug!("checkpoint save complete");
        }
        EventKind::GerkinMutter => war::gerkin_mutter(world),
    }
}

fn handle_net_event(world: &mut World, ev: NetEvent) {
    match ev {
        NetEvent::Connected { session, out } => {
            world.sessions.insert(
                session,
                Session {
                    out,
                    phase: SessionPhase::AskName,
                    character: None,
                },
            );
            if let Some(s) = world.sessions.get(&session) {
                let _ = s.out.send(OutFrame::Line(GREETING.as_bytes().to_vec()));
            }
            info!(session, "session connected");
        }
        NetEvent::Line { session, line } => {
            // Nothing below the dispatch boundary may take down the loop.
            if let Err(e) = handle_line(world, session, line) {
                error!(err = %e, session, "command handler failed");
                world.tell_session(session, "Something went wrong. Try that again.");
            }
        }
        NetEvent::Disconnected { session } => handle_disconnect(world, session),
    }
}

fn handle_disconnect(world: &mut World, session: SessionId) {
    let Some(s) = world.sessions.remove(&session) else {
        return;
    };
    let Some(cid) = s.character else {
        info!(session, "session left before login");
        return;
    };
    let Some(c) = world.chars.get(&cid) else {
        return;
    };
    let name = c.name.clone();
    let room_id = c.room_id.clone();
    let alive_in_war = !c.is_ghost && world.war.in_progress() && world.war.participants.contains(&cid);

    world.save_char(cid);

    if alive_in_war {
        // A living combatant cannot leave the war by dropping carrier: they
        // turn to stone and stay killable where they stood.
        if let Some(c) = world.chars.get_mut(&cid) {
            c.controller = None;
            c.linkdead = true;
        }
        world.broadcast_room_except(&room_id, &format!("{name} has turned to stone!"), &[cid]);
        world.broadcast_all(&format!("{name} has gone linkdead."));
        info!(session, name = %name, "player linkdead mid-war; statue left behind");
    } else {
        if let Some(set) = world.occupants.get_mut(&room_id) {
            set.remove(&cid);
            if set.is_empty() {
                world.occupants.remove(&room_id);
            }
        }
        world.fighting.remove(&cid);
        world.chars.remove(&cid);
        world.broadcast_room(&room_id, &format!("{name} fades from existence."));
        world.broadcast_all(&format!("{name} has left the game."));
        info!(session, name = %name, "player disconnected");
    }
}

// ---------------------------------------------------------------------------
// Login and command dispatch
// ---------------------------------------------------------------------------

fn handle_line(world: &mut World, session: SessionId, mut line: String) -> anyhow::Result<()> {
    let phase = match world.sessions.get(&session) {
        Some(s) => s.phase.clone(),
        None => return Ok(()),
    };

    match phase {
        SessionPhase::AskName => {
            let name = line.trim().to_string();
            if name.is_empty() {
                world.tell_session(session, "What is your name?");
                return Ok(());
            }
            if !persist::valid_name(&name) {
                world.tell_session(session, "Names are 2-12 letters. What is your name?");
                return Ok(());
            }
            match world.players.load(&name)? {
                Some(rec) => {
                    if let Some(s) = world.sessions.get_mut(&session) {
                        s.phase = SessionPhase::AskPassword {
                            name: rec.name.clone(),
                            attempts: 0,
                        };
                    }
                    world.tell_session(session, "Password:");
                }
                None => {
                    let name = canonical_name(&name);
                    if let Some(s) = world.sessions.get_mut(&session) {
                        s.phase = SessionPhase::NewPassword { name };
                    }
                    world.tell_session(session, "New blood! Choose a password:");
                }
            }
            Ok(())
        }
        SessionPhase::AskPassword { name, attempts } => {
            let rec = world.players.load(&name)?;
            let ok = rec
                .as_ref()
                .map(|r| persist::verify_password(line.trim(), &r.password_hash))
                .unwrap_or(false);
            line.zeroize();
            if ok {
                enter_world(world, session, rec.expect("verified record exists"));
            } else {
                let attempts = attempts + 1;
                if attempts >= MAX_PASSWORD_ATTEMPTS {
                    world.tell_session(session, "Too many attempts. Goodbye.");
                    close_session(world, session);
                } else {
                    if let Some(s) = world.sessions.get_mut(&session) {
                        s.phase = SessionPhase::AskPassword { name, attempts };
                    }
                    world.tell_session(session, "Wrong password. Try again:");
                }
            }
            Ok(())
        }
        SessionPhase::NewPassword { name } => {
            let pw = line.trim().to_string();
            line.zeroize();
            if pw.len() < MIN_PASSWORD_LEN {
                world.tell_session(session, "At least 4 characters. Choose a password:");
                return Ok(());
            }
            if let Some(s) = world.sessions.get_mut(&session) {
                s.phase = SessionPhase::ConfirmPassword { name, first: pw };
            }
            world.tell_session(session, "Retype password:");
            Ok(())
        }
        SessionPhase::ConfirmPassword { name, mut first } => {
            let matched = first == line.trim();
            line.zeroize();
            if !matched {
                first.zeroize();
                if let Some(s) = world.sessions.get_mut(&session) {
                    s.phase = SessionPhase::NewPassword { name };
                }
                world.tell_session(session, "Passwords don't match. Choose a password:");
                return Ok(());
            }
            let hash = persist::hash_password(&first)?;
            first.zeroize();
            let rec = persist::PlayerRecord::new(name, hash, chrono::Utc::now().timestamp());
            world.players.save(&rec)?;
            enter_world(world, session, rec);
            Ok(())
        }
        SessionPhase::Playing => {
            let Some(cid) = world.char_of_session(session) else {
                world.tell_session(session, "You are nobody. Reconnect.");
                return Ok(());
            };
            dispatch_command(world, session, cid, line.trim())
        }
    }
}

fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => lower,
    }
}

fn close_session(world: &mut World, session: SessionId) {
    if let Some(s) = world.sessions.remove(&session) {
        let _ = s.out.send(OutFrame::Close);
    }
}

fn enter_world(world: &mut World, session: SessionId, mut rec: persist::PlayerRecord) {
    if let Some(existing) = world.find_char_by_name(&rec.name) {
        let taken = world
            .chars
            .get(&existing)
            .is_some_and(|c| c.controller.is_some());
        if taken {
            world.tell_session(session, "That warrior is already here. Goodbye.");
            close_session(world, session);
            return;
        }
        // Reclaim a statue left by a mid-war disconnect.
        if let Some(c) = world.chars.get_mut(&existing) {
            c.controller = Some(session);
            c.linkdead = false;
            c.last_login_unix = chrono::Utc::now().timestamp();
        }
        if let Some(s) = world.sessions.get_mut(&session) {
            s.phase = SessionPhase::Playing;
            s.character = Some(existing);
        }
        let room = world.chars[&existing].room_id.clone();
        let name = world.chars[&existing].name.clone();
        world.broadcast_room_except(&room, &format!("{name} stirs back to life."), &[existing]);
        world.tell_session(session, "You return to your senses. The war goes on.");
        let look = world.render_room_for(&room, existing);
        world.tell_session(session, look.trim_end_matches("\r\n"));
        return;
    }

    rec.last_login_unix = chrono::Utc::now().timestamp();
    let cid = world.spawn_character(Some(session), &rec);
    if let Some(s) = world.sessions.get_mut(&session) {
        s.phase = SessionPhase::Playing;
        s.character = Some(cid);
    }
    let name = rec.name.clone();
    world.broadcast_all(&format!("{name} enters the game."));
    world.tell_session(session, &format!("Welcome back, {name}!"));
    world.tell_session(session, "Type 'help' for a list of commands.");
    world.prune_corpses();
    let look = world.render_room_for(ROOM_WARROOM, cid);
    world.tell_session(session, look.trim_end_matches("\r\n"));
    world.save_char(cid);
}

fn dispatch_command(
    world: &mut World,
    session: SessionId,
    cid: CharacterId,
    line: &str,
) -> anyhow::Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    if !world.chars.contains_key(&cid) {
        return Ok(());
    }
    let lc = line.to_ascii_lowercase();

    if lc == "help" {
        world.tell_session(session, help_text().trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "look" || lc == "l" {
        world.prune_corpses();
        let room = world.chars[&cid].room_id.clone();
        let s = world.render_room_for(&room, cid);
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "go") {
        if !try_move(world, session, cid, arg) {
            world.tell_session(session, "huh? (no such exit)");
        }
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "say") {
        let (name, room) = {
            let c = &world.chars[&cid];
            (c.name.clone(), c.room_id.clone())
        };
        world.tell_session(session, &format!("You say: {arg}"));
        world.broadcast_room_except(&room, &format!("{name} says: {arg}"), &[cid]);
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "shout") {
        let name = world.chars[&cid].name.clone();
        world.broadcast_all(&format!("{name} shouts: {arg}"));
        return Ok(());
    }
    if lc == "who" {
        world.tell_session(session, render_who(world).trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "score" {
        let s = render_score(world, cid);
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "inventory" || lc == "i" {
        let s = render_inventory(&world.chars[&cid]);
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "wield") {
        wield(world, session, cid, arg);
        return Ok(());
    }
    if lc == "loot" || lc == "loot corpse" {
        loot_corpse(world, session, cid);
        return Ok(());
    }
    if lc == "drink blood" || lc == "drink" {
        drink_blood(world, session, cid);
        return Ok(());
    }
    if lc == "list" {
        shop_list(world, session, cid);
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "buy") {
        shop_buy(world, session, cid, arg);
        return Ok(());
    }
    if lc == "wimpy" {
        let w = world.chars[&cid].wimpy_percent;
        world.tell_session(session, &format!("Wimpy is set at {w}%."));
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "wimpy") {
        match arg.trim().parse::<u32>() {
            Ok(n) if n <= 100 => {
                world.chars.get_mut(&cid).expect("dispatch char exists").wimpy_percent = n;
                world.tell_session(session, &format!("Wimpy set to {n}%."));
            }
            _ => world.tell_session(session, "Wimpy is a percentage, 0-100."),
        }
        return Ok(());
    }
    if lc == "war" || lc == "war on" || lc == "war off" {
        let on = match lc.as_str() {
            "war on" => Some(true),
            "war off" => Some(false),
            _ => None,
        };
        let c = world.chars.get_mut(&cid).expect("dispatch char exists");
        if let Some(on) = on {
            c.war_enabled = on;
        }
        let now_on = c.war_enabled;
        world.tell_session(
            session,
            if now_on {
                "War is ON. You will fight in the next war."
            } else {
                "War is OFF. You will sit the next one out."
            },
        );
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "vote") {
        let name = world.chars[&cid].name.clone();
        match world.war.register_vote(&name, arg) {
            Some(wt) => {
                world.tell_session(session, &format!("You vote for {}.", wt.as_str()));
            }
            None => world.tell_session(session, "Vote ffa, team, or bvr."),
        }
        return Ok(());
    }
    if lc == "push" || lc == "push button" {
        if world.chars[&cid].room_id != ROOM_WARROOM {
            world.tell_session(session, "There's no war button here.");
            return Ok(());
        }
        if let Err(reason) = war::start_countdown(world, cid) {
            world.tell_session(session, &reason);
        }
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "class") {
        let reply = war::choose_class(world, cid, arg);
        world.tell_session(session, &reply);
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "kill") {
        combat::attack(world, cid, arg);
        return Ok(());
    }
    if lc == "alive" {
        let s = war::render_alive(world);
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "warstatus" {
        let s = war::render_status(world);
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "wars" {
        let s = render_wars(world);
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "finger") {
        let s = render_finger(world, arg)?;
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "watch" || lc == "stop" {
        let watching = lc == "watch";
        let c = world.chars.get_mut(&cid).expect("dispatch char exists");
        if c.room_id != ROOM_OBSERVATION {
            world.tell_session(session, "The crystal screens are in the observation room.");
            return Ok(());
        }
        c.watching_war = watching;
        world.tell_session(
            session,
            if watching {
                "You turn to the crystal screens and begin watching the war."
            } else {
                "You stop watching the war."
            },
        );
        return Ok(());
    }
    if let Some(arg) = command_arg(line, "gerkin") {
        let Some(target) = arg.strip_prefix("kill ").map(str::trim).filter(|t| !t.is_empty())
        else {
            world.tell_session(session, "huh? (try: gerkin kill <player>)");
            return Ok(());
        };
        let reply = war::gerkin_hunt(world, cid, target);
        world.tell_session(session, &reply);
        return Ok(());
    }
    if lc == "uptime" {
        let s = world.render_uptime();
        world.tell_session(session, s.trim_end_matches("\r\n"));
        return Ok(());
    }
    if lc == "quit" || lc == "exit" {
        world.tell_session(session, "The war will be here when you get back.");
        if let Some(s) = world.sessions.get(&session) {
            let _ = s.out.send(OutFrame::Close);
        }
        handle_disconnect(world, session);
        return Ok(());
    }

    // Bare direction tokens move, matching what most fingers type.
    if try_move(world, session, cid, &lc) {
        return Ok(());
    }

    world.tell_session(session, "huh? (try: help)");
    Ok(())
}

/// `command_arg("kill bob", "kill") == Some("bob")`; bare verbs yield None.
/// The verb matches case-insensitively; the argument keeps its case.
fn command_arg<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    if line.len() <= command.len() {
        return None;
    }
    if !line[..command.len()].eq_ignore_ascii_case(command) {
        return None;
    }
    let rest = &line[command.len()..];
    if !rest.starts_with(' ') {
        return None;
    }
    let arg = rest.trim();
    if arg.is_empty() {
        None
    } else {
        Some(arg)
    }
}

fn try_move(world: &mut World, session: SessionId, cid: CharacterId, token: &str) -> bool {
    let Some(p) = world.chars.get(&cid) else {
        return false;
    };
    let room_id = p.room_id.clone();
    let name = p.name.clone();
    let is_ghost = p.is_ghost;

    let Some(ex) = world.rooms.find_exit(&room_id, token) else {
        return false;
    };
    let dir = ex.dir.clone();
    let dest = ex.to.clone();
    // Ghosts pass through locked doors; the living do not.
    if ex.locked && !is_ghost {
        world.tell_session(session, "The door is locked.");
        return true;
    }
    if !world.rooms.has_room(&dest) {
        world.tell_session(session, "The way is sealed.");
        return true;
    }

    world.broadcast_room_except(&room_id, &format!("{name} goes {dir}."), &[cid]);
    world.move_char(cid, &dest);
    world.broadcast_room_except(&dest, &format!("{name} arrives."), &[cid]);

    if is_ghost {
        world.tell_session(session, "You drift ethereally through the area.");
    }
    world.prune_corpses();
    let s = world.render_room_for(&dest, cid);
    world.tell_session(session, s.trim_end_matches("\r\n"));
    true
}

fn wield(world: &mut World, session: SessionId, cid: CharacterId, token: &str) {
    let c = world.chars.get_mut(&cid).expect("dispatch char exists");
    let t = token.trim().to_ascii_lowercase();
    let pos = c.inv.iter().position(|i| match i {
        items::Item::Weapon(w) => {
            w.key == t || w.name == t || w.name.split(' ').any(|p| p == t)
        }
        items::Item::Blood { .. } => false,
    });
    let Some(pos) = pos else {
        world.tell_session(session, &format!("You aren't carrying '{token}'."));
        return;
    };
    let items::Item::Weapon(w) = c.inv.remove(pos) else {
        return;
    };
    if let Some(old) = c.wielded.replace(w) {
        c.inv.push(items::Item::Weapon(old));
    }
    let name = w.name;
    world.tell_session(session, &format!("You wield the {name}."));
}

fn loot_corpse(world: &mut World, session: SessionId, cid: CharacterId) {
    world.prune_corpses();
    let room_id = world.chars[&cid].room_id.clone();
    let Some(corpse_idx) = world.corpses.iter().position(|c| c.room_id == room_id) else {
        world.tell_session(session, "There is no corpse here.");
        return;
    };

    let mut looted = 0usize;
    loop {
        let full = world.chars[&cid].inv.len() >= items::CARRY_LIMIT;
        if full || world.corpses[corpse_idx].contents.is_empty() {
            break;
        }
        let item = world.corpses[corpse_idx].contents.remove(0);
        let label = item.name();
        world
            .chars
            .get_mut(&cid)
            .expect("dispatch char exists")
            .inv
            .push(item);
        world.tell_session(session, &format!("You loot {label} from the corpse."));
        looted += 1;
    }
    if looted == 0 {
        if world.corpses[corpse_idx].contents.is_empty() {
            world.tell_session(session, "The corpse is empty.");
        } else {
            world.tell_session(session, "You can't carry any more.");
        }
    }
}

fn drink_blood(world: &mut World, session: SessionId, cid: CharacterId) {
    let c = world.chars.get_mut(&cid).expect("dispatch char exists");
    if c.war_class != Some(war::WarClass::Kamikaze) {
        world.tell_session(session, "Only a kamikaze can stomach blood.");
        return;
    }
    let Some(pos) = c.inv.iter().position(|i| i.is_blood()) else {
        world.tell_session(session, "You carry no blood.");
        return;
    };
    let item = c.inv.remove(pos);
    c.hp = c.max_hp;
    c.sp = c.max_sp;
    let label = item.name();
    let name = c.name.clone();
    let room = c.room_id.clone();
    world.tell_session(session, &format!("You gulp down the {label}. You feel whole again!"));
    world.broadcast_room_except(&room, &format!("{name} gulps down a vial of blood!"), &[cid]);
}

fn shop_list(world: &World, session: SessionId, cid: CharacterId) {
    if world.chars[&cid].room_id != ROOM_SHOP {
        world.tell_session(session, "There is nothing for sale here.");
        return;
    }
    let mut s = String::from("Gerkin's cousin scrawls today's prices:\r\n");
    for w in items::WEAPONS {
        s.push_str(&format!(" - {} ({} damage) {}c\r\n", w.name, w.damage, w.cost));
    }
    s.push_str("  ('buy <weapon>' with coins in hand)");
    world.tell_session(session, &s);
}

fn shop_buy(world: &mut World, session: SessionId, cid: CharacterId, token: &str) {
    if world.chars[&cid].room_id != ROOM_SHOP {
        world.tell_session(session, "There is nothing for sale here.");
        return;
    }
    let Some(w) = items::find_weapon(token) else {
        world.tell_session(session, &format!("No '{token}' for sale. Try 'list'."));
        return;
    };
    let c = world.chars.get_mut(&cid).expect("dispatch char exists");
    if c.inv.len() >= items::CARRY_LIMIT {
        world.tell_session(session, "You can't carry any more.");
        return;
    }
    if c.coins < w.cost {
        let msg = format!("The {} costs {}c. You have {}c.", w.name, w.cost, c.coins);
        world.tell_session(session, &msg);
        return;
    }
    c.coins -= w.cost;
    c.inv.push(items::Item::Weapon(w));
    let coins = c.coins;
    world.tell_session(
        session,
        &format!("You buy the {} for {}c. ({coins}c left)", w.name, w.cost),
    );
}

fn help_text() -> String {
    "\
commands:\r\n\
  look (l) / go <exit> / n s e w u d\r\n\
  say <msg> / shout <msg> / who / score / inventory (i)\r\n\
  wield <weapon> / loot corpse / drink blood\r\n\
  list / buy <weapon>            (in the shop)\r\n\
  wimpy [percent]\r\n\
  war on|off / vote <ffa|team|bvr>\r\n\
  push button                    (in the warroom, ghosts only)\r\n\
  class <fighter|kamikaze|mage|hunter>\r\n\
  kill <target> / alive / warstatus / wars\r\n\
  finger <name> / watch / stop   (observation room)\r\n\
  gerkin kill <target>           (holder only)\r\n\
  uptime / quit\r\n"
        .to_string()
}

fn render_who(world: &World) -> String {
    let mut names: Vec<String> = world
        .chars
        .values()
        .filter(|c| c.controller.is_some())
        .map(|c| format!(" - {} ({})", c.display_name(), title_for_level(c.level)))
        .collect();
    names.sort();
    let mut s = format!("warriors online: {}\r\n", names.len());
    for n in names {
        s.push_str(&n);
        s.push_str("\r\n");
    }
    s
}

fn render_score(world: &mut World, cid: CharacterId) -> String {
    let fighting = combat::fighting_line(world, cid);
    let c = &world.chars[&cid];
    let mut s = String::new();
    s.push_str(&format!(
        "{}, {} (level {})\r\n",
        c.name,
        title_for_level(c.level),
        c.level
    ));
    s.push_str(&format!("hp: {}/{}  sp: {}/{}\r\n", c.hp, c.max_hp, c.sp, c.max_sp));
    s.push_str(&format!(
        "kills: {}  deaths: {}  best kill: {}\r\n",
        c.kills,
        c.deaths,
        c.best_kill.as_deref().unwrap_or("none yet")
    ));
    s.push_str(&format!("coins: {}  wimpy: {}%\r\n", c.coins, c.wimpy_percent));
    s.push_str(&format!(
        "state: {}  war: {}\r\n",
        if c.is_ghost { "ghost" } else { "alive" },
        if c.war_enabled { "on" } else { "off" }
    ));
    if let Some(class) = c.war_class {
        s.push_str(&format!("class: {}\r\n", class.as_str()));
    }
    if let (Some(side), Some(wt)) = (c.side, world.war.war_type) {
        s.push_str(&format!("team: {}\r\n", side.label(wt)));
    }
    if c.has_gerkin {
        s.push_str("The spirit of Gerkin rides with you.\r\n");
    }
    if let Some(f) = fighting {
        s.push_str(&f);
        s.push_str("\r\n");
    }
    s
}

fn render_inventory(c: &Character) -> String {
    let mut s = String::from("you are carrying:\r\n");
    if let Some(w) = c.wielded {
        s.push_str(&format!(" - {} (wielded)\r\n", w.name));
    }
    for item in &c.inv {
        s.push_str(&format!(" - {}\r\n", item.name()));
    }
    if c.inv.is_empty() && c.wielded.is_none() {
        s.push_str(" - nothing at all\r\n");
    }
    s
}

fn render_wars(world: &World) -> String {
    let history = &world.war.history;
    if history.is_empty() {
        return "No wars on record yet.\r\n".to_string();
    }
    let mut s = format!("wars fought: {}\r\n", history.len());
    for rec in history.iter().rev().take(10) {
        let when = chrono::DateTime::from_timestamp(rec.ended_unix, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "sometime".to_string());
        s.push_str(&format!(
            " - {} | {} | winner: {} | {}s | {} fighters\r\n",
            when,
            rec.war_type,
            rec.winner,
            rec.duration_s,
            rec.participants.len()
        ));
    }
    s
}

fn render_finger(world: &World, name: &str) -> anyhow::Result<String> {
    // Prefer the live character; fall back to the saved record.
    let rec = match world.find_char_by_name(name) {
        Some(cid) => world.record_for(cid),
        None => world.players.load(name)?,
    };
    let Some(rec) = rec else {
        return Ok(format!("No warrior named '{name}'.\r\n"));
    };

    let last_login = chrono::DateTime::from_timestamp(rec.last_login_unix, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    let wins = rec.wars.iter().filter(|w| w.won).count();
    let mut s = String::new();
    s.push_str(&format!("{}, {} (level {})\r\n", rec.name, title_for_level(rec.level), rec.level));
    s.push_str(&format!(
        "kills: {}  deaths: {}  best kill: {}\r\n",
        rec.kills,
        rec.deaths,
        rec.best_kill.as_deref().unwrap_or("none yet")
    ));
    s.push_str(&format!("wars fought: {} ({} won)\r\n", rec.wars.len(), wins));
    s.push_str(&format!("last login: {last_login}\r\n"));
    Ok(s)
}

// ---------------------------------------------------------------------------
// Network plumbing
// ---------------------------------------------------------------------------

async fn world_loop(mut world: World, mut rx: mpsc::UnboundedReceiver<NetEvent>) {
    let start = tokio::time::Instant::now();
    loop {
        world.now_ms = start.elapsed().as_millis() as u64;
        process_due_events(&mut world);

        if world.restart_requested {
            break;
        }

        let sleep_ms = match world.events.peek() {
            Some(Reverse(ev)) => ev.due_ms.saturating_sub(world.now_ms),
            None => u64::MAX,
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms.min(86_400_000))) => {
                // Wake to drain due events.
            }
            ev = rx.recv() => {
                world.now_ms = start.elapsed().as_millis() as u64;
                match ev {
                    Some(ev) => handle_net_event(&mut world, ev),
                    None => break,
                }
            }
        }
    }
}

async fn conn_task(
    stream: TcpStream,
    session: SessionId,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutFrame>();
    let replies_tx = out_tx.clone();

    // Writer half: drains until every sender (ours and the world's) is gone
    // or the world says goodbye.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                OutFrame::Line(b) => {
                    if wr.write_all(&b).await.is_err() {
                        break;
                    }
                }
                OutFrame::Close => {
                    let _ = wr.shutdown().await;
                    break;
                }
            }
        }
    });

    if events
        .send(NetEvent::Connected {
            session,
            out: out_tx,
        })
        .is_err()
    {
        return;
    }

    let mut filter = NegotiationFilter::new();
    let mut lines = LineAssembler::new().max_line(MAX_LINE_BYTES);
    let mut buf = [0u8; 1024];
    'read: loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(session, err = %e, "read error");
                break;
            }
        };

        let mut data = Vec::with_capacity(n);
        let mut replies = Vec::new();
        filter.feed(&buf[..n], &mut data, &mut replies);
        // Negotiation replies go straight back out on the writer channel.
        if !replies.is_empty() && replies_tx.send(OutFrame::Line(replies)).is_err() {
            break;
        }

        if lines.push(&data).is_err() {
            warn!(session, "line too long; dropping client");
            break;
        }
        while let Some(raw) = lines.next_line() {
            let line = String::from_utf8_lossy(&raw).into_owned();
            if events.send(NetEvent::Line { session, line }).is_err() {
                break 'read;
            }
        }
    }

    let _ = events.send(NetEvent::Disconnected { session });
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NetEvent>) {
    let mut next_session: SessionId = 1;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(err = %e, "accept failed");
                continue;
            }
        };
        let session = next_session;
        next_session += 1;
        info!(session, peer = %peer, "connection accepted");
        tokio::spawn(conn_task(stream, session, events.clone()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warshard=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let rooms = rooms::Rooms::load()?;
    let players = persist::PlayerStore::open(cfg.data_dir.join("players"))?;
    let wars_path = cfg.data_dir.join("wars.json");
    let history = match persist::load_war_history(&wars_path) {
        Ok(h) => h,
        Err(e) => {
            warn!(err = %e, "war history unreadable; starting empty");
            Vec::new()
        }
    };

    let mut world = World::new(rooms, players, wars_path, cfg.world_seed, history);
    world.schedule_in_ms(CHECKPOINT_MS, EventKind::Checkpoint);
    world.schedule_in_ms(GERKIN_MUTTER_MS, EventKind::GerkinMutter);

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, "warshard listening");

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(accept_loop(listener, tx));
    world_loop(world, rx).await;

    info!("all players saved; exiting so the supervisor can restart us");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::war::{Side, WarState, WarType};

    fn test_world(tag: &str) -> World {
        let dir = std::env::temp_dir().join(format!(
            "warshard-worldtest-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let players = persist::PlayerStore::open(dir.join("players")).unwrap();
        let rooms = rooms::Rooms::load().unwrap();
        World::new(rooms, players, dir.join("wars.json"), 1234, Vec::new())
    }

    fn ghost(world: &mut World, name: &str, level: u32) -> CharacterId {
        let rec = persist::PlayerRecord::new(name.to_string(), "x".into(), 0);
        let cid = world.spawn_character(None, &rec);
        world.chars.get_mut(&cid).unwrap().level = level;
        cid
    }

    fn wire(
        world: &mut World,
        cid: CharacterId,
    ) -> (SessionId, mpsc::UnboundedReceiver<OutFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = 1000 + cid;
        world.sessions.insert(
            sid,
            Session {
                out: tx,
                phase: SessionPhase::Playing,
                character: Some(cid),
            },
        );
        world.chars.get_mut(&cid).unwrap().controller = Some(sid);
        (sid, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutFrame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            if let OutFrame::Line(b) = f {
                out.push(String::from_utf8_lossy(&b).into_owned());
            }
        }
        out
    }

    fn advance_to(world: &mut World, ms: u64) {
        world.now_ms = ms;
        process_due_events(world);
    }

    fn begin_war(world: &mut World, initiator: CharacterId, force_type: Option<WarType>) {
        war::start_countdown(world, initiator).unwrap();
        if let Some(t) = force_type {
            world.war.war_type = Some(t);
        }
        let due = world.now_ms + war::COUNTDOWN_MS;
        advance_to(world, due);
    }

    fn gather(world: &mut World, cids: &[CharacterId], room: &str) {
        for cid in cids {
            world.move_char(*cid, room);
        }
    }

    #[test]
    fn start_denied_with_one_ghost() {
        let mut world = test_world("one-ghost");
        let a = ghost(&mut world, "Ash", 1);
        let err = war::start_countdown(&mut world, a).unwrap_err();
        assert!(err.contains("at least 2"));
        assert_eq!(world.war.state, WarState::Inactive);
    }

    #[test]
    fn start_requires_a_ghost_initiator() {
        let mut world = test_world("alive-initiator");
        let a = ghost(&mut world, "Ash", 1);
        ghost(&mut world, "Bel", 1);
        world.chars.get_mut(&a).unwrap().is_ghost = false;
        let err = war::start_countdown(&mut world, a).unwrap_err();
        assert!(err.contains("ghosts"));
    }

    #[test]
    fn countdown_aborts_below_minimum() {
        let mut world = test_world("abort");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        let (_, mut rx) = wire(&mut world, a);
        war::start_countdown(&mut world, a).unwrap();
        assert_eq!(world.war.state, WarState::Countdown);

        world.chars.get_mut(&b).unwrap().war_enabled = false;
        advance_to(&mut world, war::COUNTDOWN_MS);
        assert_eq!(world.war.state, WarState::Inactive);
        assert!(world.war.participants.is_empty());
        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains("Not enough players")));
    }

    #[test]
    fn ffa_war_runs_to_completion_and_schedules_reboot() {
        let mut world = test_world("ffa");
        let a = ghost(&mut world, "Ash", 3);
        let b = ghost(&mut world, "Bel", 2);
        let c = ghost(&mut world, "Cor", 1);
        let (_, mut rx) = wire(&mut world, a);

        begin_war(&mut world, a, Some(WarType::FreeForAll));
        assert_eq!(world.war.state, WarState::Active);
        assert_eq!(world.war.participants, vec![a, b, c]);
        for cid in [a, b, c] {
            let ch = &world.chars[&cid];
            assert!(!ch.is_ghost);
            assert!(ch.room_id.starts_with("backbone_"));
            assert_eq!(ch.hp, ch.max_hp);
        }

        gather(&mut world, &[a, b, c], "arena_5_5");
        world.chars.get_mut(&b).unwrap().hp = 1;
        combat::attack(&mut world, a, "Bel");
        assert!(world.chars[&b].is_ghost);
        assert_eq!(world.chars[&b].room_id, ROOM_WARROOM);
        assert_eq!(world.chars[&b].deaths, 1);
        assert_eq!(world.war.state, WarState::Active);

        world.chars.get_mut(&c).unwrap().hp = 1;
        combat::attack(&mut world, a, "Cor");

        // Ending -> Inactive happened inside end_war; reboot is pending.
        assert_eq!(world.war.state, WarState::Inactive);
        assert!(world.reboot_at_ms.is_some());
        assert_eq!(world.war.history.len(), 1);
        let rec = &world.war.history[0];
        assert_eq!(rec.winner, "Ash");
        assert_eq!(rec.participants.len(), 3);
        assert!(rec.participants.contains(&"Ash".to_string()));

        // Two kills plus the solo win bonus.
        assert_eq!(world.chars[&a].kills, 2 + war::SOLO_WIN_BONUS);
        assert_eq!(
            world.chars[&a].inv.iter().filter(|i| i.is_blood()).count(),
            2
        );
        assert_eq!(world.corpses.len(), 2);

        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains("Ash has won the war!")));
        assert!(lines.iter().any(|l| l.contains("reboot in 60 seconds")));

        // A new war cannot start while the reboot is pending.
        let err = war::start_countdown(&mut world, b).unwrap_err();
        assert!(err.contains("reboot"));

        let due = world.now_ms + war::REBOOT_DELAY_MS;
        advance_to(&mut world, due);
        assert!(world.restart_requested);
        assert!(world.sessions.is_empty());
    }

    #[test]
    fn team_war_bonus_reaches_only_surviving_winners() {
        let mut world = test_world("team");
        let a = ghost(&mut world, "Ash", 9);
        let b = ghost(&mut world, "Bel", 1);
        let c = ghost(&mut world, "Cor", 5);

        begin_war(&mut world, a, Some(WarType::Team));
        // Levels 9, 5, 1 alternate: Ash and Bel on one side, Cor on the other.
        assert_eq!(world.chars[&a].side, Some(Side::One));
        assert_eq!(world.chars[&c].side, Some(Side::Two));
        assert_eq!(world.chars[&b].side, Some(Side::One));

        gather(&mut world, &[a, c], "arena_4_4");
        world.chars.get_mut(&c).unwrap().hp = 1;
        combat::attack(&mut world, a, "Cor");

        assert_eq!(world.war.state, WarState::Inactive);
        assert_eq!(world.war.history[0].winner, "team1");
        assert_eq!(world.chars[&a].kills, 1 + war::TEAM_WIN_BONUS);
        assert_eq!(world.chars[&b].kills, war::TEAM_WIN_BONUS);
        assert_eq!(world.chars[&c].kills, 0);

        assert!(world.chars[&a].wars_fought[0].won);
        assert!(!world.chars[&c].wars_fought[0].won);
    }

    #[test]
    fn teammates_cannot_attack_each_other() {
        let mut world = test_world("friendly-fire");
        let a = ghost(&mut world, "Ash", 9);
        let b = ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 5);

        begin_war(&mut world, a, Some(WarType::Team));
        assert_eq!(world.chars[&a].side, world.chars[&b].side);

        gather(&mut world, &[a, b], "arena_2_2");
        let before = world.chars[&b].hp;
        combat::attack(&mut world, a, "Bel");
        assert_eq!(world.chars[&b].hp, before);
        assert!(!world.chars[&b].is_ghost);
    }

    #[test]
    fn team_partition_covers_everyone_once() {
        let mut world = test_world("partition");
        let mut cids = Vec::new();
        for (i, name) in ["Ash", "Bel", "Cor", "Dot", "Eli"].into_iter().enumerate() {
            cids.push(ghost(&mut world, name, (i + 1) as u32));
        }
        begin_war(&mut world, cids[0], Some(WarType::Team));

        let mut one = 0;
        let mut two = 0;
        for cid in &world.war.participants {
            match world.chars[cid].side {
                Some(Side::One) => one += 1,
                Some(Side::Two) => two += 1,
                None => panic!("participant without a side in a team war"),
            }
        }
        assert_eq!(one + two, 5);
        assert!((one as i32 - two as i32).abs() <= 1);
    }

    #[test]
    fn gerkin_first_blood_then_single_transfer_broadcast() {
        let mut world = test_world("gerkin");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        let c = ghost(&mut world, "Cor", 1);
        let (_, mut rx) = wire(&mut world, b);

        begin_war(&mut world, a, Some(WarType::FreeForAll));
        gather(&mut world, &[a, b, c], "arena_3_3");

        world.chars.get_mut(&b).unwrap().hp = 1;
        combat::attack(&mut world, a, "Bel");
        assert!(world.chars[&a].has_gerkin);
        assert_eq!(world.war.gerkin_holder, Some(a));

        drain(&mut rx);
        world.chars.get_mut(&a).unwrap().hp = 1;
        combat::attack(&mut world, c, "Ash");

        assert!(!world.chars[&a].has_gerkin);
        assert!(world.chars[&c].has_gerkin);
        let lines = drain(&mut rx);
        let transfers = lines
            .iter()
            .filter(|l| l.contains("spirit of Gerkin transfers"))
            .count();
        assert_eq!(transfers, 1);
    }

    #[test]
    fn death_handling_is_idempotent() {
        let mut world = test_world("idempotent");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 1);
        begin_war(&mut world, a, Some(WarType::FreeForAll));
        gather(&mut world, &[a, b], "arena_1_1");

        combat::handle_death(&mut world, a, b);
        assert!(world.chars[&b].is_ghost);
        assert_eq!(world.chars[&b].deaths, 1);
        assert_eq!(world.corpses.len(), 1);
        let kills = world.chars[&a].kills;

        combat::handle_death(&mut world, a, b);
        assert_eq!(world.chars[&b].deaths, 1);
        assert_eq!(world.corpses.len(), 1);
        assert_eq!(world.chars[&a].kills, kills);
    }

    #[test]
    fn kamikaze_explosion_chains_deaths() {
        let mut world = test_world("kamikaze");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        let c = ghost(&mut world, "Cor", 1);
        begin_war(&mut world, a, Some(WarType::FreeForAll));
        gather(&mut world, &[a, b, c], "arena_2_3");

        world.chars.get_mut(&b).unwrap().war_class = Some(war::WarClass::Kamikaze);
        world.chars.get_mut(&b).unwrap().hp = 1;
        // Bystander Cor cannot survive the 100-damage blast.
        world.chars.get_mut(&c).unwrap().hp = 50;
        world.chars.get_mut(&a).unwrap().hp = 500;
        world.chars.get_mut(&a).unwrap().max_hp = 500;

        combat::attack(&mut world, a, "Bel");

        assert!(world.chars[&b].is_ghost);
        assert!(world.chars[&c].is_ghost, "bystander died in the blast");
        assert!(!world.chars[&a].is_ghost);
        // Ash is the last one standing, so the war resolved.
        assert_eq!(world.war.state, WarState::Inactive);
        assert_eq!(world.war.history[0].winner, "Ash");
    }

    #[test]
    fn arena_shrink_clamps_at_one_and_schedules_one_hazard() {
        let mut world = test_world("shrink");
        let a = ghost(&mut world, "Ash", 1);
        ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 1);
        begin_war(&mut world, a, Some(WarType::FreeForAll));
        let epoch = world.war.epoch;

        world.war.arena_size = 2;
        war::shrink_arena(&mut world, epoch);
        assert_eq!(world.war.arena_size, 1);
        assert!(world.war.dogs_scheduled);
        assert_eq!(world.chars[&a].room_id, "arena_1_1");

        war::shrink_arena(&mut world, epoch);
        assert_eq!(world.war.arena_size, 1, "size stays clamped");

        let dog_events = world
            .events
            .iter()
            .filter(|ev| matches!(ev.0.kind, EventKind::WarDogs { .. }))
            .count();
        assert_eq!(dog_events, 1, "hazard scheduled exactly once per war");
        assert_eq!(world.war.state, WarState::Active);
    }

    #[test]
    fn stale_war_timers_are_ignored() {
        let mut world = test_world("stale");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 1);
        begin_war(&mut world, a, Some(WarType::FreeForAll));
        let old_epoch = world.war.epoch;

        // End the war; the epoch moves on.
        gather(&mut world, &[a, b], "arena_1_1");
        world.chars.get_mut(&b).unwrap().hp = 1;
        combat::attack(&mut world, a, "Bel");
        let c_alive: Vec<_> = world.alive_participants();
        for cid in c_alive {
            if cid != a {
                world.chars.get_mut(&cid).unwrap().hp = 1;
                let name = world.chars[&cid].name.clone();
                gather(&mut world, &[cid], "arena_1_1");
                combat::attack(&mut world, a, &name);
            }
        }
        assert_eq!(world.war.state, WarState::Inactive);

        let size = world.war.arena_size;
        war::shrink_arena(&mut world, old_epoch);
        assert_eq!(world.war.arena_size, size);
        assert_eq!(world.war.state, WarState::Inactive);
        war::release_dogs(&mut world, old_epoch);
        war::countdown_notice(&mut world, old_epoch, 10);
    }

    #[test]
    fn ghosts_cannot_attack_or_be_attacked() {
        let mut world = test_world("ghost-invariant");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 1);
        let d = ghost(&mut world, "Dim", 1);
        world.chars.get_mut(&d).unwrap().war_enabled = false;

        begin_war(&mut world, a, Some(WarType::FreeForAll));
        assert!(!world.war.participants.contains(&d));

        // Living attacker vs ghost target.
        gather(&mut world, &[a, d], "arena_1_2");
        assert!(eligibilityerr(&world, a, d).contains("ghosts"));
        // Ghost attacker vs living target.
        assert!(eligibilityerr(&world, d, a).contains("Ghosts"));
        // Both fine during the war otherwise.
        gather(&mut world, &[a, b], "arena_1_2");
        assert!(combat::eligibility(&world, a, b).is_ok());
    }

    fn eligibilityerr(world: &World, att: CharacterId, tgt: CharacterId) -> String {
        combat::eligibility(world, att, tgt).unwrap_err()
    }

    #[test]
    fn wimpy_triggers_auto_flee() {
        let mut world = test_world("wimpy");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 1);
        begin_war(&mut world, a, Some(WarType::FreeForAll));
        gather(&mut world, &[a, b], "arena_5_5");

        {
            let bc = world.chars.get_mut(&b).unwrap();
            bc.max_hp = 100;
            bc.hp = 55;
            bc.wimpy_percent = 50;
        }
        combat::attack(&mut world, a, "Bel");
        let bc = &world.chars[&b];
        assert!(!bc.is_ghost);
        assert_ne!(bc.room_id, "arena_5_5", "wimpy should have fled the room");
        assert!(!world.fighting.contains_key(&b));
    }

    #[test]
    fn disconnect_mid_war_leaves_a_killable_statue() {
        let mut world = test_world("statue");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        let (sid_a, _rx_a) = wire(&mut world, a);

        begin_war(&mut world, a, Some(WarType::FreeForAll));
        handle_disconnect(&mut world, sid_a);

        // Still present, still alive, just inert.
        let statue = &world.chars[&a];
        assert!(statue.controller.is_none());
        assert!(!statue.is_ghost);
        assert_eq!(statue.display_name(), "Statue of Ash");

        gather(&mut world, &[a, b], "arena_1_1");
        world.chars.get_mut(&a).unwrap().hp = 1;
        combat::attack(&mut world, b, "Ash");

        // The dead statue crumbles away entirely; Bel wins the war.
        assert!(!world.chars.contains_key(&a));
        assert_eq!(world.war.state, WarState::Inactive);
        assert_eq!(world.war.history[0].winner, "Bel");
    }

    #[test]
    fn votes_weight_the_type_draw_and_clear_on_start() {
        let mut world = test_world("votes");
        let a = ghost(&mut world, "Ash", 1);
        ghost(&mut world, "Bel", 1);
        world.war.register_vote("Ash", "team").unwrap();
        world.war.register_vote("Bel", "team").unwrap();
        assert_eq!(world.war.vote_multiset().len(), 5);

        war::start_countdown(&mut world, a).unwrap();
        assert!(world.war.votes.is_empty(), "votes are consumed at countdown");
        assert!(world.war.war_type.is_some());
    }

    #[test]
    fn command_arg_splits_verbs() {
        assert_eq!(command_arg("kill bob", "kill"), Some("bob"));
        assert_eq!(command_arg("KILL Bob", "kill"), Some("Bob"));
        assert_eq!(command_arg("kill", "kill"), None);
        assert_eq!(command_arg("kill   ", "kill"), None);
        assert_eq!(command_arg("killing spree", "kill"), None);
    }

    #[test]
    fn fight_tracking_expires_after_ten_seconds() {
        let mut world = test_world("fight-track");
        let a = ghost(&mut world, "Ash", 1);
        let b = ghost(&mut world, "Bel", 1);
        ghost(&mut world, "Cor", 1);
        begin_war(&mut world, a, Some(WarType::FreeForAll));
        gather(&mut world, &[a, b], "arena_1_1");

        combat::attack(&mut world, a, "Bel");
        assert_eq!(
            combat::fighting_line(&mut world, a).as_deref(),
            Some("Fighting: Bel")
        );

        world.now_ms += combat::FIGHT_TRACK_MS + 1;
        assert!(combat::fighting_line(&mut world, a).is_none());
        assert!(!world.fighting.contains_key(&a));
    }
}
