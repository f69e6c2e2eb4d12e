//! Player records and the war history file.
//!
//! Records are whole-file JSON documents, written via a temp file and
//! rename so a crash mid-save never leaves a truncated record. A failed
//! save is an error-level log line for the caller, never a reason to stop
//! the world.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use argon2::Argon2;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use serde::{Deserialize, Serialize};

use crate::war::WarRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub name: String,
    pub password_hash: String,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub coins: u32,
    #[serde(default)]
    pub kills: u32,
    #[serde(default)]
    pub deaths: u32,
    #[serde(default)]
    pub best_kill: Option<String>,
    #[serde(default = "default_wimpy")]
    pub wimpy_percent: u32,
    #[serde(default = "default_true")]
    pub war_on: bool,
    #[serde(default = "default_hp")]
    pub max_hp: i32,
    #[serde(default = "default_sp")]
    pub max_sp: i32,
    #[serde(default)]
    pub linked_enforcer: bool,
    #[serde(default)]
    pub created_unix: i64,
    #[serde(default)]
    pub last_login_unix: i64,
    #[serde(default)]
    pub wars: Vec<PlayerWarMark>,
}

/// One war this player fought in, kept on the player record for `finger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWarMark {
    pub ended_unix: i64,
    pub war_type: String,
    pub won: bool,
    pub kills: u32,
}

fn default_level() -> u32 {
    1
}
fn default_wimpy() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
fn default_hp() -> i32 {
    100
}
fn default_sp() -> i32 {
    200
}

impl PlayerRecord {
    pub fn new(name: String, password_hash: String, now_unix: i64) -> Self {
        Self {
            name,
            password_hash,
            level: default_level(),
            coins: 100,
            kills: 0,
            deaths: 0,
            best_kill: None,
            wimpy_percent: default_wimpy(),
            war_on: true,
            max_hp: default_hp(),
            max_sp: default_sp(),
            linked_enforcer: false,
            created_unix: now_unix,
            last_login_unix: now_unix,
            wars: Vec::new(),
        }
    }
}

/// Player names are login identifiers and file names; keep them boring.
pub fn valid_name(name: &str) -> bool {
    let n = name.trim();
    (2..=12).contains(&n.len())
        && n.chars().all(|c| c.is_ascii_alphabetic())
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash_password failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub struct PlayerStore {
    dir: PathBuf,
}

impl PlayerStore {
    pub fn open(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("create player dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name.trim().to_ascii_lowercase()))
    }

    pub fn load(&self, name: &str) -> anyhow::Result<Option<PlayerRecord>> {
        if !valid_name(name) {
            return Ok(None);
        }
        let path = self.path_for(name);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let rec = serde_json::from_str(&raw)
            .with_context(|| format!("parse player record {}", path.display()))?;
        Ok(Some(rec))
    }

    pub fn save(&self, rec: &PlayerRecord) -> anyhow::Result<()> {
        let path = self.path_for(&rec.name);
        let raw = serde_json::to_string_pretty(rec).context("serialize player record")?;
        write_atomic(&path, raw.as_bytes())
    }
}

pub fn load_war_history(path: &Path) -> anyhow::Result<Vec<WarRecord>> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&raw).with_context(|| format!("parse war history {}", path.display()))
}

pub fn save_war_history(path: &Path, history: &[WarRecord]) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(history).context("serialize war history")?;
    write_atomic(path, raw.as_bytes())
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
