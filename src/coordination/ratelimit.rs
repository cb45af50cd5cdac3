//! Durable per-identity cooldown ledger.
//!
//! The ledger remembers which identities the platform has throttled and until
//! when. Blocks are appended to a JSONL file and replayed on open so they
//! survive restarts.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{ActionKind, IdentityId};

/// Class of platform limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Join rejected as "too many subscriptions"; lifts at local midnight.
    SubscriptionCap,
    /// Explicit platform cooldown.
    FloodBan,
}

impl LimitKind {
    /// The limits an action must be checked against.
    pub fn applicable_to(action: ActionKind) -> &'static [LimitKind] {
        match action {
            ActionKind::Join => &[LimitKind::FloodBan, LimitKind::SubscriptionCap],
            _ => &[LimitKind::FloodBan],
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::SubscriptionCap => write!(f, "subscription-cap"),
            LimitKind::FloodBan => write!(f, "flood-ban"),
        }
    }
}

/// An active block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub identity: IdentityId,
    pub kind: LimitKind,
    pub until: DateTime<Utc>,
}

/// One line of the ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LedgerRecord {
    Block {
        identity: IdentityId,
        kind: LimitKind,
        until: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    },
    Clear {
        identity: IdentityId,
        recorded_at: DateTime<Utc>,
    },
}

type BlockMap = HashMap<(IdentityId, LimitKind), DateTime<Utc>>;

/// Per-identity "blocked until" state.
pub struct RateLimitLedger {
    /// Backing file; `None` keeps the ledger in memory only.
    path: Option<PathBuf>,
    blocks: RwLock<BlockMap>,
}

impl RateLimitLedger {
    /// A ledger that is not persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a ledger file and replay it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let blocks = Self::replay(&path)?;
        Ok(Self {
            path: Some(path),
            blocks: RwLock::new(blocks),
        })
    }

    fn replay(path: &Path) -> Result<BlockMap> {
        let mut blocks = HashMap::new();

        if !path.exists() {
            return Ok(blocks);
        }

        let reader = BufReader::new(File::open(path)?);
        let now = Utc::now();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    log::warn!("Failed to read rate-limit ledger line: {}", e);
                    continue;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<LedgerRecord>(&line) {
                Ok(LedgerRecord::Block {
                    identity, kind, until, ..
                }) => {
                    let deadline = blocks.entry((identity, kind)).or_insert(until);
                    if until > *deadline {
                        *deadline = until;
                    }
                }
                Ok(LedgerRecord::Clear { identity, .. }) => {
                    blocks.retain(|(id, _), _| *id != identity);
                }
                Err(e) => {
                    log::warn!("Skipping invalid rate-limit ledger entry: {}", e);
                }
            }
        }

        blocks.retain(|_, until| *until > now);

        log::debug!("Loaded rate-limit ledger: {} active blocks", blocks.len());
        Ok(blocks)
    }

    fn append(&self, record: &LedgerRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Whether an identity is blocked for a kind of limit right now.
    pub async fn is_blocked(&self, identity: &IdentityId, kind: LimitKind) -> bool {
        self.is_blocked_at(identity, kind, Utc::now()).await
    }

    /// Whether an identity is blocked for a kind of limit at `now`.
    pub async fn is_blocked_at(&self, identity: &IdentityId, kind: LimitKind, now: DateTime<Utc>) -> bool {
        let blocks = self.blocks.read().await;
        blocks
            .get(&(identity.clone(), kind))
            .is_some_and(|until| now < *until)
    }

    /// The first limit blocking `action` for this identity at `now`, if any.
    pub async fn blocking_limit(
        &self,
        identity: &IdentityId,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Option<RateLimitEntry> {
        let blocks = self.blocks.read().await;
        LimitKind::applicable_to(action).iter().find_map(|kind| {
            blocks
                .get(&(identity.clone(), *kind))
                .filter(|until| now < **until)
                .map(|until| RateLimitEntry {
                    identity: identity.clone(),
                    kind: *kind,
                    until: *until,
                })
        })
    }

    /// Block an identity until a deadline.
    ///
    /// An existing later deadline for the same kind is kept.
    pub async fn mark_blocked(&self, identity: &IdentityId, kind: LimitKind, until: DateTime<Utc>) -> Result<()> {
        {
            let mut blocks = self.blocks.write().await;
            let deadline = blocks.entry((identity.clone(), kind)).or_insert(until);
            if until > *deadline {
                *deadline = until;
            }
        }

        self.append(&LedgerRecord::Block {
            identity: identity.clone(),
            kind,
            until,
            recorded_at: Utc::now(),
        })?;

        log::info!("Identity {} blocked ({}) until {}", identity, kind, until);
        Ok(())
    }

    /// Block an identity from joining until the next local midnight.
    pub async fn mark_subscription_cap(&self, identity: &IdentityId, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let until = next_local_midnight(now);
        self.mark_blocked(identity, LimitKind::SubscriptionCap, until).await?;
        Ok(until)
    }

    /// Lift every block on an identity. Returns how many were active.
    pub async fn clear(&self, identity: &IdentityId) -> Result<usize> {
        let removed = {
            let mut blocks = self.blocks.write().await;
            let before = blocks.len();
            blocks.retain(|(id, _), _| id != identity);
            before - blocks.len()
        };

        self.append(&LedgerRecord::Clear {
            identity: identity.clone(),
            recorded_at: Utc::now(),
        })?;

        Ok(removed)
    }

    /// Latest active deadline across all kinds for an identity.
    pub async fn blocked_until(&self, identity: &IdentityId) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let blocks = self.blocks.read().await;
        blocks
            .iter()
            .filter(|((id, _), until)| id == identity && **until > now)
            .map(|(_, until)| *until)
            .max()
    }

    /// Active entries, sorted by identity then kind.
    pub async fn entries(&self) -> Vec<RateLimitEntry> {
        self.entries_at(Utc::now()).await
    }

    /// Entries still active at `now`.
    pub async fn entries_at(&self, now: DateTime<Utc>) -> Vec<RateLimitEntry> {
        let blocks = self.blocks.read().await;
        let mut entries: Vec<RateLimitEntry> = blocks
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|((identity, kind), until)| RateLimitEntry {
                identity: identity.clone(),
                kind: *kind,
                until: *until,
            })
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity).then(a.kind.cmp(&b.kind)));
        entries
    }

    /// Drop expired blocks and rewrite the backing file with active ones.
    pub async fn compact(&self) -> Result<usize> {
        let now = Utc::now();
        let mut blocks = self.blocks.write().await;
        blocks.retain(|_, until| *until > now);

        if let Some(path) = &self.path {
            let tmp = path.with_extension("jsonl.tmp");
            {
                let mut file = File::create(&tmp)?;
                for ((identity, kind), until) in blocks.iter() {
                    let record = LedgerRecord::Block {
                        identity: identity.clone(),
                        kind: *kind,
                        until: *until,
                        recorded_at: now,
                    };
                    writeln!(file, "{}", serde_json::to_string(&record)?)?;
                }
            }
            std::fs::rename(&tmp, path)?;
        }

        Ok(blocks.len())
    }

    /// Get the ledger path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// The next local-midnight boundary strictly after `now`.
pub fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    local
        .date_naive()
        .succ_opt()
        .and_then(|tomorrow| Local.from_local_datetime(&tomorrow.and_time(NaiveTime::MIN)).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or_else(|| now + chrono::Duration::days(1))
}
