//! Reap persistence: the baseline inventory per owner.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use reap_store::Inventory;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Revisions kept per owner; the newest one is the baseline.
const KEEP_REVISIONS: usize = 3;

/// Inventory committed after a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub owner: String,
    pub revision: u64,
    pub ts: i64,
    pub inventory: Inventory,
}

pub trait BaselineStore: Send + Sync {
    /// Newest committed baseline for `owner`.
    fn load(&self, owner: &str) -> Result<Option<Baseline>>;
    /// Store `inventory` as the new baseline and return its revision.
    fn commit(&self, owner: &str, inventory: &Inventory) -> Result<u64>;
    /// Newest first.
    fn history(&self, owner: &str, limit: Option<usize>) -> Result<Vec<Baseline>>;
    /// Drop every revision for `owner`.
    fn forget(&self, owner: &str) -> Result<()>;
}

/// SQLite-backed store. Simple, synchronous.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
    zstd_level: Option<i32>,
}

impl SqliteStore {
    /// `REAP_DB_PATH`, else the per-user default.
    pub fn open_default() -> Result<Self> {
        match std::env::var_os("REAP_DB_PATH") {
            Some(path) => Self::open(PathBuf::from(path)),
            None => Self::open(default_db_path()?),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS baselines (
                owner     TEXT NOT NULL,
                revision  INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                inventory BLOB NOT NULL,
                PRIMARY KEY (owner, revision)
            )",
            [],
        )
        .context("creating baselines table")?;
        let me = Self { db: Mutex::new(db), zstd_level: zstd_level() };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    fn query(&self, owner: &str, limit: usize) -> Result<Vec<Baseline>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT revision, ts, inventory FROM baselines WHERE owner = ?1 ORDER BY revision DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((owner, limit as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let revision: i64 = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let inventory = decode_inventory(&blob)
                .with_context(|| format!("decoding baseline {} revision {}", owner, revision))?;
            out.push(Baseline { owner: owner.to_string(), revision: revision as u64, ts, inventory });
        }
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

impl BaselineStore for SqliteStore {
    fn load(&self, owner: &str) -> Result<Option<Baseline>> {
        Ok(self.query(owner, 1)?.into_iter().next())
    }

    fn commit(&self, owner: &str, inventory: &Inventory) -> Result<u64> {
        let started = std::time::Instant::now();
        let blob = encode_inventory(inventory, self.zstd_level)?;
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let revision: i64 = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM baselines WHERE owner = ?1",
            [owner],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO baselines(owner, revision, ts, inventory) VALUES (?1, ?2, ?3, ?4)",
            (owner, revision, unix_now(), &blob),
        )?;
        tx.execute(
            "DELETE FROM baselines WHERE owner = ?1 AND revision <= ?2",
            (owner, revision - KEEP_REVISIONS as i64),
        )?;
        tx.commit()?;
        histogram!("persist_commit_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_commit_total", 1u64);
        debug!(owner, revision, entries = inventory.len(), "baseline committed");
        Ok(revision as u64)
    }

    fn history(&self, owner: &str, limit: Option<usize>) -> Result<Vec<Baseline>> {
        self.query(owner, limit.unwrap_or(KEEP_REVISIONS))
    }

    fn forget(&self, owner: &str) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM baselines WHERE owner = ?1", [owner])?;
        debug!(owner, revisions = n, "baseline forgotten");
        Ok(())
    }
}

/// In-process store, same rotation rules as [`SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    owners: Mutex<HashMap<String, Vec<Baseline>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn owners(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Baseline>>>> {
        self.owners.lock().map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

impl BaselineStore for MemoryStore {
    fn load(&self, owner: &str) -> Result<Option<Baseline>> {
        Ok(self.owners()?.get(owner).and_then(|revs| revs.last().cloned()))
    }

    fn commit(&self, owner: &str, inventory: &Inventory) -> Result<u64> {
        let mut owners = self.owners()?;
        let revs = owners.entry(owner.to_string()).or_default();
        let revision = revs.last().map(|b| b.revision + 1).unwrap_or(1);
        revs.push(Baseline { owner: owner.to_string(), revision, ts: unix_now(), inventory: inventory.clone() });
        if revs.len() > KEEP_REVISIONS {
            let excess = revs.len() - KEEP_REVISIONS;
            revs.drain(..excess);
        }
        Ok(revision)
    }

    fn history(&self, owner: &str, limit: Option<usize>) -> Result<Vec<Baseline>> {
        let owners = self.owners()?;
        let cap = limit.unwrap_or(KEEP_REVISIONS);
        Ok(owners.get(owner).map(|revs| revs.iter().rev().take(cap).cloned().collect()).unwrap_or_default())
    }

    fn forget(&self, owner: &str) -> Result<()> {
        self.owners()?.remove(owner);
        Ok(())
    }
}

/// zstd frame magic, little-endian 0xFD2FB528.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression level for new blobs: `REAP_ZSTD_LEVEL` (default 3) with the `zstd` feature, otherwise none.
fn zstd_level() -> Option<i32> {
    cfg!(feature = "zstd").then(|| std::env::var("REAP_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3))
}

fn encode_inventory(inv: &Inventory, level: Option<i32>) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(inv).context("serializing inventory")?;
    match level {
        #[cfg(feature = "zstd")]
        Some(lvl) => zstd::encode_all(&json[..], lvl).context("compressing inventory"),
        _ => Ok(json),
    }
}

/// Reads plain JSON blobs and zstd frames alike, so toggling the feature keeps old baselines readable.
fn decode_inventory(blob: &[u8]) -> Result<Inventory> {
    if blob.starts_with(&ZSTD_MAGIC) {
        #[cfg(feature = "zstd")]
        {
            let json = zstd::decode_all(blob).context("decompressing inventory")?;
            return serde_json::from_slice(&json).context("parsing persisted inventory");
        }
        #[cfg(not(feature = "zstd"))]
        return Err(anyhow!("baseline is zstd-compressed; rebuild with the `zstd` feature to read it"));
    }
    serde_json::from_slice(blob).context("parsing persisted inventory")
}

/// `$HOME/.reap/reap.db`, or `./reap.db` without a home directory.
fn default_db_path() -> Result<PathBuf> {
    let Some(home) = std::env::var_os("HOME") else {
        return Ok(PathBuf::from("reap.db"));
    };
    let dir = PathBuf::from(home).join(".reap");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir.join("reap.db"))
}

fn unix_now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reap_core::{Action, Entry, ObjectId};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("reap-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn inv(names: &[&str]) -> Inventory {
        let mut inv = Inventory::new();
        let cs = names
            .iter()
            .map(|n| Entry::new(ObjectId::new("default", *n, "", "ConfigMap"), "v1", Action::Created))
            .collect();
        inv.add_change_set(cs).unwrap();
        inv
    }

    fn exercise(s: &dyn BaselineStore) {
        assert!(s.load("flux-system/flux").unwrap().is_none());
        for i in 0..5 {
            let names: Vec<String> = (0..=i).map(|n| format!("cm-{}", n)).collect();
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let rev = s.commit("flux-system/flux", &inv(&refs)).unwrap();
            assert_eq!(rev, i as u64 + 1);
        }
        let top = s.load("flux-system/flux").unwrap().unwrap();
        assert_eq!(top.revision, 5);
        assert_eq!(top.inventory.len(), 5);

        let hist = s.history("flux-system/flux", None).unwrap();
        let revs: Vec<u64> = hist.iter().map(|b| b.revision).collect();
        assert_eq!(revs, vec![5, 4, 3]);

        s.commit("other/app", &inv(&["x"])).unwrap();
        s.forget("flux-system/flux").unwrap();
        assert!(s.load("flux-system/flux").unwrap().is_none());
        assert_eq!(s.load("other/app").unwrap().unwrap().inventory, inv(&["x"]));
    }

    #[test]
    fn sqlite_commit_load_rotate() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        exercise(&s);
    }

    #[test]
    fn memory_commit_load_rotate() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sqlite_survives_reopen() {
        let path = temp_db();
        {
            let s = SqliteStore::open(&path).unwrap();
            s.commit("ns/app", &inv(&["a", "b"])).unwrap();
        }
        let s = SqliteStore::open(&path).unwrap();
        let b = s.load("ns/app").unwrap().unwrap();
        assert_eq!(b.revision, 1);
        assert_eq!(b.inventory, inv(&["a", "b"]));
    }

    #[test]
    fn plain_blobs_stay_readable() {
        let blob = encode_inventory(&inv(&["a"]), None).unwrap();
        assert!(blob.starts_with(b"{"));
        assert_eq!(decode_inventory(&blob).unwrap(), inv(&["a"]));
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compressed_blobs_round_trip() {
        let blob = encode_inventory(&inv(&["a", "b"]), Some(3)).unwrap();
        assert!(blob.starts_with(&ZSTD_MAGIC));
        assert_eq!(decode_inventory(&blob).unwrap(), inv(&["a", "b"]));
    }

    #[cfg(not(feature = "zstd"))]
    #[test]
    fn compressed_blob_without_feature_is_explained() {
        let mut blob = ZSTD_MAGIC.to_vec();
        blob.extend_from_slice(b"frame");
        let e = decode_inventory(&blob).unwrap_err();
        assert!(e.to_string().contains("zstd"), "e={}", e);
    }

    #[test]
    fn corrupt_blob_reports_owner() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        s.conn()
            .unwrap()
            .execute(
                "INSERT INTO baselines(owner, revision, ts, inventory) VALUES ('ns/bad', 1, 0, ?1)",
                [&b"not json"[..]],
            )
            .unwrap();
        let e = s.load("ns/bad").unwrap_err();
        assert!(format!("{:#}", e).contains("ns/bad"), "e={:#}", e);
    }
}
