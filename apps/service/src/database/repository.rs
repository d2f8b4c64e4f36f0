use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, Value, params};
use probe_engine::{Asset, AssetCounts, AssetRepository, AssetStatus, ConfigStore, HistoryPoint, HistoryStore};

use super::models::{AssetRow, NewAsset, RegionStats, datetime_to_millis, millis_to_datetime};
use crate::pool::{LibsqlManager, LibsqlPool};

const ASSET_COLUMNS: &str = "id, host, ip, port, protocol, region, status, last_check";

/// LibSQL-backed asset, config and history store
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    /// Insert a validated asset and return its id
    pub async fn add_asset(&self, asset: &NewAsset) -> Result<i64> {
        asset.validate()?;
        let conn = self.get_conn().await?;
        let created_at = datetime_to_millis(Utc::now());

        conn.execute(
            "INSERT INTO assets (host, ip, port, protocol, region, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                asset.host.clone(),
                asset.ip.trim().to_string(),
                asset.port.map(|port| port.to_string()),
                asset.protocol.trim().to_ascii_lowercase(),
                asset.region.clone(),
                AssetStatus::Unknown.to_string(),
                created_at
            ],
        )
        .await?;

        Ok(conn.last_insert_rowid())
    }

    /// Every stored row, including ones that would be skipped for probing
    pub async fn list_rows(&self) -> Result<Vec<AssetRow>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query(&format!("SELECT {ASSET_COLUMNS} FROM assets ORDER BY id"), ()).await?;
        let mut assets = Vec::new();

        while let Some(row) = rows.next().await? {
            assets.push(AssetRow {
                id: row.get(0)?,
                host: text_column(&row, 1)?,
                ip: text_column(&row, 2)?,
                port: text_column(&row, 3)?,
                protocol: text_column(&row, 4)?,
                region: text_column(&row, 5)?,
                status: text_column(&row, 6)?,
                last_check: row.get::<Option<i64>>(7)?,
            });
        }

        Ok(assets)
    }

    /// Remove all assets; returns how many rows were deleted
    pub async fn clear_assets(&self) -> Result<u64> {
        let conn = self.get_conn().await?;
        Ok(conn.execute("DELETE FROM assets", ()).await?)
    }

    pub async fn clear_history(&self) -> Result<u64> {
        let conn = self.get_conn().await?;
        Ok(conn.execute("DELETE FROM probe_history", ()).await?)
    }

    /// Upsert a live config value
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .await?;
        Ok(())
    }

    /// Largest regions first; assets without a region are grouped as "Unknown"
    pub async fn region_stats(&self, limit: usize) -> Result<Vec<RegionStats>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COALESCE(NULLIF(region, ''), 'Unknown') AS name, COUNT(*) AS total, \
                 SUM(CASE WHEN status = 'alive' THEN 1 ELSE 0 END) AS alive \
                 FROM assets GROUP BY name ORDER BY total DESC, name ASC LIMIT ?",
                params![limit as i64],
            )
            .await?;
        let mut stats = Vec::new();

        while let Some(row) = rows.next().await? {
            stats.push(RegionStats {
                region: row.get(0)?,
                total: row.get::<i64>(1)? as u64,
                alive: row.get::<Option<i64>>(2)?.unwrap_or(0) as u64,
            });
        }

        Ok(stats)
    }
}

/// Read a column that may hold text, an integer or NULL
fn text_column(row: &Row, index: i32) -> Result<Option<String>> {
    Ok(match row.get_value(index)? {
        Value::Null => None,
        Value::Text(text) => Some(text),
        Value::Integer(number) => Some(number.to_string()),
        Value::Real(number) => Some(number.to_string()),
        Value::Blob(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
    })
}

#[async_trait]
impl AssetRepository for DatabaseImpl {
    async fn list_all(&self) -> Result<Vec<Asset>> {
        let rows = self.list_rows().await?;
        let mut assets = Vec::with_capacity(rows.len());

        for row in rows {
            let id = row.id;
            match Asset::try_from(row) {
                Ok(asset) => assets.push(asset),
                Err(e) => tracing::warn!(asset_id = id, "Skipping invalid asset: {}", e),
            }
        }

        Ok(assets)
    }

    async fn update_status(&self, id: i64, status: AssetStatus, at: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE assets SET status = ?, last_check = ? WHERE id = ?",
            params![status.to_string(), datetime_to_millis(at), id],
        )
        .await?;
        Ok(())
    }

    async fn aggregate_counts(&self) -> Result<AssetCounts> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT COUNT(*), SUM(CASE WHEN status = 'alive' THEN 1 ELSE 0 END) FROM assets", ())
            .await?;

        match rows.next().await? {
            Some(row) => Ok(AssetCounts {
                total: row.get::<i64>(0)? as u64,
                alive: row.get::<Option<i64>>(1)?.unwrap_or(0) as u64,
            }),
            None => Ok(AssetCounts::default()),
        }
    }
}

#[async_trait]
impl ConfigStore for DatabaseImpl {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT value FROM config WHERE key = ?", params![key]).await?;

        match rows.next().await? {
            Some(row) => text_column(&row, 0),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl HistoryStore for DatabaseImpl {
    async fn append(&self, total_count: u64, alive_count: u64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO probe_history (total_count, alive_count, timestamp) VALUES (?, ?, ?)",
            params![total_count as i64, alive_count as i64, datetime_to_millis(at)],
        )
        .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<HistoryPoint>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT total_count, alive_count, timestamp FROM probe_history ORDER BY timestamp ASC, id ASC LIMIT ?",
                params![limit as i64],
            )
            .await?;
        let mut points = Vec::new();

        while let Some(row) = rows.next().await? {
            points.push(HistoryPoint {
                total_count: row.get::<i64>(0)? as u64,
                alive_count: row.get::<i64>(1)? as u64,
                timestamp: millis_to_datetime(row.get(2)?),
            });
        }

        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_pool;
    use chrono::Duration;
    use probe_engine::settings::{KEY_CONCURRENCY, KEY_PROXY_URL};
    use probe_engine::Protocol;
    use tempfile::{TempDir, tempdir};

    /// Helper to create a migrated database in a temp dir
    async fn create_test_database() -> Result<(DatabaseImpl, TempDir)> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("test.db");
        let pool = open_pool(&db_path.to_string_lossy(), 4).await?;

        let conn = pool.get().await?;
        crate::database::initialize_database(&conn).await?;
        drop(conn);

        Ok((DatabaseImpl::new_from_pool(pool), temp_dir))
    }

    fn new_asset(ip: &str, port: Option<u16>, protocol: &str, region: Option<&str>) -> NewAsset {
        NewAsset {
            host: format!("{protocol}.example"),
            ip: ip.to_string(),
            port,
            protocol: protocol.to_string(),
            region: region.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let conn = db.get_conn().await?;
        crate::database::initialize_database(&conn).await?;

        let mut rows = conn.query("SELECT COUNT(*) FROM schema_migrations", ()).await?;
        let applied: i64 = rows.next().await?.map(|row| row.get(0)).transpose()?.unwrap_or(0);
        assert_eq!(applied, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_assets_round_trip_and_status_update() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let ssh = db.add_asset(&new_asset("10.0.0.1", Some(22), "SSH", Some("eu"))).await?;
        db.add_asset(&new_asset("10.0.0.2", None, "icmp", None)).await?;

        let assets = db.list_all().await?;
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].protocol, Protocol::Tcp("ssh".to_string()));
        assert_eq!(assets[1].port, 0);
        assert!(assets.iter().all(|a| a.status == AssetStatus::Unknown));

        let at = Utc::now();
        db.update_status(ssh, AssetStatus::Alive, at).await?;

        let updated = &db.list_all().await?[0];
        assert_eq!(updated.status, AssetStatus::Alive);
        assert_eq!(updated.last_check.map(datetime_to_millis), Some(datetime_to_millis(at)));
        assert_eq!(db.aggregate_counts().await?, AssetCounts { total: 2, alive: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_rows_are_skipped() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        db.add_asset(&new_asset("10.0.0.1", Some(80), "http", None)).await?;
        assert!(db.add_asset(&new_asset("nope", Some(80), "http", None)).await.is_err());

        let conn = db.get_conn().await?;
        conn.execute(
            "INSERT INTO assets (host, ip, port, protocol) VALUES ('bad', '10.0.0.9', '0', 'tcp'), ('worse', 'x', '22', 'ssh')",
            (),
        )
        .await?;

        assert_eq!(db.list_rows().await?.len(), 3);
        let assets = db.list_all().await?;
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].protocol, Protocol::Http);
        Ok(())
    }

    #[tokio::test]
    async fn test_integer_port_column_is_accepted() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let conn = db.get_conn().await?;
        conn.execute("INSERT INTO assets (host, ip, port, protocol) VALUES ('x', '10.0.0.3', 8443, 'https')", ())
            .await?;

        let assets = db.list_all().await?;
        assert_eq!(assets[0].port, 8443);
        Ok(())
    }

    #[tokio::test]
    async fn test_config_upsert() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        assert_eq!(db.get(KEY_CONCURRENCY).await?, None);

        db.set_config(KEY_CONCURRENCY, "50").await?;
        db.set_config(KEY_CONCURRENCY, "75").await?;
        db.set_config(KEY_PROXY_URL, "http://127.0.0.1:8080").await?;

        assert_eq!(db.get(KEY_CONCURRENCY).await?.as_deref(), Some("75"));
        assert_eq!(db.get(KEY_PROXY_URL).await?.as_deref(), Some("http://127.0.0.1:8080"));
        Ok(())
    }

    #[tokio::test]
    async fn test_history_oldest_first_with_limit() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let start = Utc::now();
        db.append(3, 1, start + Duration::seconds(20)).await?;
        db.append(3, 2, start).await?;
        db.append(4, 4, start + Duration::seconds(10)).await?;

        let points = db.list(2).await?;
        assert_eq!(points.len(), 2);
        assert_eq!((points[0].total_count, points[0].alive_count), (3, 2));
        assert_eq!((points[1].total_count, points[1].alive_count), (4, 4));
        assert!(points[0].timestamp < points[1].timestamp);

        assert_eq!(db.clear_history().await?, 3);
        assert!(db.list(50).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_region_stats() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let a = db.add_asset(&new_asset("10.0.0.1", Some(22), "ssh", Some("eu"))).await?;
        db.add_asset(&new_asset("10.0.0.2", Some(22), "ssh", Some("eu"))).await?;
        db.add_asset(&new_asset("10.0.0.3", Some(22), "ssh", Some("us"))).await?;
        db.add_asset(&new_asset("10.0.0.4", Some(22), "ssh", None)).await?;
        db.update_status(a, AssetStatus::Alive, Utc::now()).await?;

        let stats = db.region_stats(2).await?;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0], RegionStats { region: "eu".to_string(), total: 2, alive: 1 });
        assert_eq!(stats[1].total, 1);

        let all = db.region_stats(10).await?;
        assert!(all.iter().any(|s| s.region == "Unknown"));

        assert_eq!(db.clear_assets().await?, 4);
        assert!(db.region_stats(5).await?.is_empty());
        Ok(())
    }
}
