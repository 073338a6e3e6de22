//! Persistent disk tier.
//!
//! Entry content lives in sharded files under the cache directory
//! (`ab/cd/<hash>.bin`, two hash-prefix levels to bound per-directory
//! fan-out). A companion SQLite metadata index (key, size, checksum,
//! timestamps, TTL) persists across process restarts, so the tier
//! comes back without re-scanning the filesystem.
//!
//! Every read verifies the stored SHA-256 checksum; a mismatch evicts
//! the entry and surfaces as [`Error::CacheCorruption`], which the
//! manager converts into a miss. Capacity is enforced synchronously at
//! insert time by evicting least-recently-accessed entries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio_rusqlite::{Connection, params, rusqlite};

use super::migrations;
use crate::Error;

/// Eviction batch size; keeps the insert-time loop short.
const EVICT_BATCH: u32 = 16;

/// Disk tier handle.
pub struct DiskTier {
    conn: Connection,
    root: PathBuf,
    capacity: u64,
    evictions: AtomicU64,
}

impl DiskTier {
    /// Open (or create) a disk tier rooted at `root`.
    ///
    /// Applies performance pragmas and runs pending migrations on the
    /// metadata index.
    pub async fn open(root: impl AsRef<Path>, capacity: u64) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(format!("create cache dir {}", root.display()), e))?;

        let conn = Connection::open(root.join("metadata.db"))
            .await
            .map_err(|e| Error::Storage(std::sync::Arc::new(e.into())))?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA temp_store=MEMORY;",
            )?;
            Ok(())
        })
        .await
        .map_err(|e: tokio_rusqlite::Error<rusqlite::Error>| Error::from(e))?;

        migrations::run(&conn).await?;

        Ok(Self { conn, root, capacity, evictions: AtomicU64::new(0) })
    }

    fn shard_path(&self, key: &str) -> (String, PathBuf) {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        let relative = format!("{}/{}/{}.bin", &hash[..2], &hash[2..4], hash);
        let absolute = self.root.join(&relative);
        (relative, absolute)
    }

    /// Read an entry, verifying its checksum and bumping access
    /// metadata.
    ///
    /// Returns the raw serialized value and its creation time, `None`
    /// on a miss or an expired entry, or [`Error::CacheCorruption`]
    /// after evicting an entry whose content no longer matches its
    /// checksum.
    pub async fn get(&self, key: &str) -> Result<Option<(Bytes, DateTime<Utc>)>, Error> {
        let lookup_key = key.to_string();
        let now = Utc::now().to_rfc3339();
        let row = self
            .conn
            .call(move |conn| -> Result<Option<(String, String, String, Option<String>)>, Error> {
                let result = conn.query_row(
                    "SELECT filename, checksum, created_at, expires_at
                     FROM cache_metadata WHERE key = ?1",
                    params![lookup_key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                );
                match result {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)?;

        let Some((filename, checksum, created_at, expires_at)) = row else {
            return Ok(None);
        };

        if let Some(expires_at) = expires_at
            && expires_at <= now
        {
            self.remove(key).await?;
            return Ok(None);
        }

        let path = self.root.join(&filename);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // orphaned metadata row
                self.remove(key).await?;
                return Ok(None);
            }
            Err(e) => return Err(Error::io(format!("read cache file {}", path.display()), e)),
        };

        let actual = hex::encode(Sha256::digest(&data));
        if actual != checksum {
            tracing::warn!(key, "disk tier checksum mismatch; evicting entry");
            self.remove(key).await?;
            return Err(Error::CacheCorruption { key: key.to_string() });
        }

        let touch_key = key.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "UPDATE cache_metadata
                     SET last_accessed = ?1, access_count = access_count + 1
                     WHERE key = ?2",
                    params![now, touch_key],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some((Bytes::from(data), created_at)))
    }

    /// Write an entry and synchronously evict until resident bytes fit
    /// the capacity again. Values larger than the whole tier are refused.
    pub async fn insert(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), Error> {
        if data.len() as u64 > self.capacity {
            tracing::debug!(key, size = data.len(), capacity = self.capacity, "value exceeds disk tier; not stored");
            return Ok(());
        }

        let (relative, absolute) = self.shard_path(key);
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("create shard dir {}", parent.display()), e))?;
        }
        tokio::fs::write(&absolute, data)
            .await
            .map_err(|e| Error::io(format!("write cache file {}", absolute.display()), e))?;

        let checksum = hex::encode(Sha256::digest(data));
        let now = Utc::now();
        let expires_at = (now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)))
            .to_rfc3339();
        let size = data.len() as i64;
        let row_key = key.to_string();
        let created = now.to_rfc3339();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO cache_metadata
                        (key, filename, size_bytes, checksum, created_at, last_accessed, access_count, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, ?6)
                     ON CONFLICT(key) DO UPDATE SET
                        filename = excluded.filename,
                        size_bytes = excluded.size_bytes,
                        checksum = excluded.checksum,
                        created_at = excluded.created_at,
                        last_accessed = excluded.last_accessed,
                        expires_at = excluded.expires_at",
                    params![row_key, relative, size, checksum, created, expires_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        self.enforce_capacity().await
    }

    /// Evict least-recently-accessed entries until resident bytes are
    /// at or below capacity.
    async fn enforce_capacity(&self) -> Result<(), Error> {
        loop {
            let resident = self.bytes_resident().await?;
            if resident <= self.capacity {
                return Ok(());
            }

            let victims = self
                .conn
                .call(|conn| -> Result<Vec<(String, String)>, Error> {
                    let mut stmt = conn.prepare(
                        "SELECT key, filename FROM cache_metadata
                         ORDER BY last_accessed ASC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![EVICT_BATCH], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await
                .map_err(Error::from)?;

            if victims.is_empty() {
                return Ok(());
            }

            for (key, filename) in victims {
                self.delete_row_and_file(&key, &filename).await?;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "evicted from disk tier");
                if self.bytes_resident().await? <= self.capacity {
                    return Ok(());
                }
            }
        }
    }

    async fn delete_row_and_file(&self, key: &str, filename: &str) -> Result<(), Error> {
        let row_key = key.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("DELETE FROM cache_metadata WHERE key = ?1", params![row_key])?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        let path = self.root.join(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("remove cache file {}", path.display()), e)),
        }
    }

    /// Remove an entry (row and content file) if present.
    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        let (relative, _) = self.shard_path(key);
        self.delete_row_and_file(key, &relative).await
    }

    /// Delete expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let now = Utc::now().to_rfc3339();
        let expired = self
            .conn
            .call(move |conn| -> Result<Vec<(String, String)>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT key, filename FROM cache_metadata
                     WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                )?;
                let rows = stmt
                    .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)?;

        let count = expired.len() as u64;
        for (key, filename) in expired {
            self.delete_row_and_file(&key, &filename).await?;
        }
        Ok(count)
    }

    /// Total bytes currently resident in the tier.
    pub async fn bytes_resident(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let sum: Option<i64> =
                    conn.query_row("SELECT SUM(size_bytes) FROM cache_metadata", [], |row| row.get(0))?;
                Ok(sum.unwrap_or(0) as u64)
            })
            .await
            .map_err(Error::from)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
