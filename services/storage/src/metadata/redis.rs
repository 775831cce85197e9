use super::MetadataStore;
use crate::config::RedisConfig;
use crate::error::{ImageError, Result};
use crate::model::{DerivedArtifact, ImageRecord, Orientation, Rendition, SourceFormat};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Replaces a record and moves its tag memberships in one step.
///
/// KEYS: record hash, recency zset, expiring zset, tag count zset
/// ARGV: id, tag set prefix, created score, expiry score or "", tags json,
///       then field/value pairs
const PUT_SCRIPT: &str = r#"
local old = redis.call('HGET', KEYS[1], 'tags')
if old then
  for _, tag in ipairs(cjson.decode(old)) do
    redis.call('SREM', ARGV[2] .. tag, ARGV[1])
    redis.call('ZINCRBY', KEYS[4], -1, tag)
  end
end
redis.call('DEL', KEYS[1])
for i = 6, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
if ARGV[4] == '' then
  redis.call('ZREM', KEYS[3], ARGV[1])
else
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
end
for _, tag in ipairs(cjson.decode(ARGV[5])) do
  redis.call('SADD', ARGV[2] .. tag, ARGV[1])
  redis.call('ZINCRBY', KEYS[4], 1, tag)
end
redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', 0)
return 1
"#;

/// Sets fields only while the record still exists.
///
/// KEYS: record hash. ARGV: field/value pairs
const ATTACH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
for i = 1, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

/// Removes a record and every index entry pointing at it.
///
/// KEYS: record hash, recency zset, expiring zset, tag count zset
/// ARGV: id, tag set prefix
const DELETE_SCRIPT: &str = r#"
local tags = redis.call('HGET', KEYS[1], 'tags')
if not tags then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
for _, tag in ipairs(cjson.decode(tags)) do
  redis.call('SREM', ARGV[2] .. tag, ARGV[1])
  redis.call('ZINCRBY', KEYS[4], -1, tag)
end
redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', 0)
return 1
"#;

/// Metadata and indexes in Redis
#[derive(Clone)]
pub struct RedisMetadataStore {
    conn: ConnectionManager,
    prefix: String,
    timeout: Duration,
}

impl RedisMetadataStore {
    /// Connect once; the manager reconnects transparently afterwards
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ImageError::InvalidInput("redis url is not configured".to_string()))?;
        let timeout = config.command_timeout();
        let client = Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| ImageError::BackendUnavailable("redis connect timed out".to_string()))??;

        info!(prefix = %config.key_prefix, "Connected to Redis metadata index");

        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            timeout,
        })
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:image:{}", self.prefix, id)
    }

    fn recent_key(&self) -> String {
        format!("{}:recent", self.prefix)
    }

    fn expiring_key(&self) -> String {
        format!("{}:expiring", self.prefix)
    }

    fn tag_counts_key(&self) -> String {
        format!("{}:tags", self.prefix)
    }

    fn tag_set_prefix(&self) -> String {
        format!("{}:tag:", self.prefix)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}{}", self.tag_set_prefix(), tag)
    }

    /// Bound a command by the configured timeout
    async fn timed<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = ::redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ImageError::BackendUnavailable(format!(
                "redis {op} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .timed("ping", ::redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn rendition_fields(rendition: Rendition) -> (String, String) {
    (format!("path:{rendition}"), format!("size:{rendition}"))
}

/// Flatten a record into hash fields
fn to_fields(record: &ImageRecord) -> Result<Vec<(String, String)>> {
    let mut fields = vec![
        ("id".to_string(), record.id.clone()),
        ("original_format".to_string(), record.original_format.to_string()),
        ("orientation".to_string(), record.orientation.to_string()),
        ("width".to_string(), record.width.to_string()),
        ("height".to_string(), record.height.to_string()),
        ("tags".to_string(), serde_json::to_string(&record.tags)?),
        (
            "expiry_at".to_string(),
            record
                .expiry_at
                .map(|at| score(at).to_string())
                .unwrap_or_default(),
        ),
        ("created_at".to_string(), score(record.created_at).to_string()),
    ];

    for (rendition, path) in &record.paths {
        let (path_field, size_field) = rendition_fields(*rendition);
        let size = record.sizes.get(rendition).copied().unwrap_or(0);
        fields.push((path_field, path.clone()));
        fields.push((size_field, size.to_string()));
    }

    Ok(fields)
}

fn parse_millis(value: &str, field: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| ImageError::Internal(format!("invalid {field} in record: {value}")))
}

/// Rebuild a record from hash fields
fn from_fields(id: &str, fields: HashMap<String, String>) -> Result<ImageRecord> {
    let get = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| ImageError::Internal(format!("record {id} missing field {name}")))
    };

    let original_format = match get("original_format")?.as_str() {
        "jpeg" => SourceFormat::Jpeg,
        "png" => SourceFormat::Png,
        "gif" => SourceFormat::Gif,
        other => {
            return Err(ImageError::Internal(format!("unknown format {other} for {id}")));
        }
    };
    let orientation = Orientation::parse(get("orientation")?)
        .ok_or_else(|| ImageError::Internal(format!("unknown orientation for {id}")))?;
    let tags: BTreeSet<String> = serde_json::from_str(get("tags")?)?;
    let expiry_at = match fields.get("expiry_at").map(String::as_str) {
        None | Some("") => None,
        Some(value) => Some(parse_millis(value, "expiry_at")?),
    };
    let created_at = parse_millis(get("created_at")?, "created_at")?;

    let mut paths = BTreeMap::new();
    let mut sizes = BTreeMap::new();
    for (field, value) in &fields {
        if let Some(name) = field.strip_prefix("path:") {
            if let Some(rendition) = Rendition::parse(name) {
                paths.insert(rendition, value.clone());
            }
        } else if let Some(name) = field.strip_prefix("size:") {
            if let (Some(rendition), Ok(size)) = (Rendition::parse(name), value.parse()) {
                sizes.insert(rendition, size);
            }
        }
    }

    Ok(ImageRecord {
        id: id.to_string(),
        original_format,
        orientation,
        width: fields.get("width").and_then(|v| v.parse().ok()).unwrap_or(0),
        height: fields.get("height").and_then(|v| v.parse().ok()).unwrap_or(0),
        tags,
        expiry_at,
        paths,
        sizes,
        created_at,
    })
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_indexed(&self) -> bool {
        true
    }

    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn put_metadata(&self, record: &ImageRecord) -> Result<()> {
        let fields = to_fields(record)?;
        let tags: Vec<&String> = record.tags.iter().collect();

        let script = Script::new(PUT_SCRIPT);
        let mut invocation = script.key(self.record_key(&record.id));
        invocation
            .key(self.recent_key())
            .key(self.expiring_key())
            .key(self.tag_counts_key())
            .arg(&record.id)
            .arg(self.tag_set_prefix())
            .arg(score(record.created_at))
            .arg(record.expiry_at.map(|at| score(at).to_string()).unwrap_or_default())
            .arg(serde_json::to_string(&tags)?);
        for (field, value) in &fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let _: i64 = self
            .timed("put", invocation.invoke_async(&mut conn))
            .await?;

        debug!(id = %record.id, tags = tags.len(), "Record indexed in Redis");
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> Result<ImageRecord> {
        let mut conn = self.conn.clone();
        let key = self.record_key(id);
        let fields: HashMap<String, String> =
            self.timed("get", conn.hgetall(&key)).await?;

        if fields.is_empty() {
            return Err(ImageError::NotFound(format!("image {id}")));
        }
        from_fields(id, fields)
    }

    async fn attach_derived(&self, id: &str, artifacts: &[DerivedArtifact]) -> Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }

        let script = Script::new(ATTACH_SCRIPT);
        let mut invocation = script.key(self.record_key(id));
        for artifact in artifacts {
            let (path_field, size_field) = rendition_fields(artifact.rendition);
            invocation
                .arg(path_field)
                .arg(&artifact.path)
                .arg(size_field)
                .arg(artifact.size);
        }

        let mut conn = self.conn.clone();
        let updated: i64 = self
            .timed("attach", invocation.invoke_async(&mut conn))
            .await?;

        if updated == 0 {
            return Err(ImageError::NotFound(format!("image {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_metadata(&self, id: &str) -> Result<bool> {
        let script = Script::new(DELETE_SCRIPT);
        let mut invocation = script.key(self.record_key(id));
        invocation
            .key(self.recent_key())
            .key(self.expiring_key())
            .key(self.tag_counts_key())
            .arg(id)
            .arg(self.tag_set_prefix());

        let mut conn = self.conn.clone();
        let removed: i64 = self
            .timed("delete", invocation.invoke_async(&mut conn))
            .await?;

        Ok(removed == 1)
    }

    async fn list_ids_by_tags(
        &self,
        required: &[String],
        excluded: &[String],
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();

        let mut ids: Vec<String> = if required.is_empty() {
            self.timed("zrevrange", conn.zrevrange(self.recent_key(), 0, -1))
                .await?
        } else {
            // Smallest set first keeps the intersection cheap
            let keys: Vec<String> = required.iter().map(|t| self.tag_key(t)).collect();
            let mut pipe = ::redis::pipe();
            for key in &keys {
                pipe.scard(key);
            }
            let sizes: Vec<usize> = self.timed("scard", pipe.query_async(&mut conn)).await?;
            if sizes.iter().any(|&n| n == 0) {
                return Ok(Vec::new());
            }

            let mut ordered: Vec<(usize, String)> = sizes.into_iter().zip(keys).collect();
            ordered.sort();
            let ordered: Vec<String> = ordered.into_iter().map(|(_, k)| k).collect();

            let mut ids: Vec<String> = self.timed("sinter", conn.sinter(ordered)).await?;
            // Ids lead with their creation timestamp
            ids.sort_unstable_by(|a, b| b.cmp(a));
            ids
        };

        if !excluded.is_empty() {
            let keys: Vec<String> = excluded.iter().map(|t| self.tag_key(t)).collect();
            let banned: HashSet<String> = self.timed("sunion", conn.sunion(keys)).await?;
            ids.retain(|id| !banned.contains(id));
        }

        Ok(ids)
    }

    async fn list_all_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.timed("zrevrange", conn.zrevrange(self.recent_key(), 0, -1))
            .await
    }

    async fn all_unique_tags(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut tags: Vec<String> = self
            .timed(
                "zrangebyscore",
                conn.zrangebyscore(self.tag_counts_key(), "(0", "+inf"),
            )
            .await?;
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.timed(
            "zrangebyscore",
            conn.zrangebyscore(self.expiring_key(), "-inf", score(now)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::normalize_tags;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::ContainerAsync;
    use testcontainers_modules::redis::{Redis, REDIS_PORT};

    fn sample_record() -> ImageRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let mut record = ImageRecord {
            id: "20240115103045-abcdefgh".to_string(),
            original_format: SourceFormat::Png,
            orientation: Orientation::Portrait,
            width: 1080,
            height: 1920,
            tags: normalize_tags(["cat", "cute"]),
            expiry_at: Some(created + chrono::Duration::minutes(5)),
            paths: BTreeMap::new(),
            sizes: BTreeMap::new(),
            created_at: created,
        };
        record.attach(
            Rendition::Original,
            "original/portrait/20240115103045-abcdefgh.png".to_string(),
            1234,
        );
        record.attach(
            Rendition::Avif,
            "portrait/avif/20240115103045-abcdefgh.avif".to_string(),
            321,
        );
        record
    }

    #[test]
    fn test_fields_round_trip() {
        let record = sample_record();
        let fields: HashMap<String, String> = to_fields(&record).unwrap().into_iter().collect();
        assert_eq!(fields["path:avif"], "portrait/avif/20240115103045-abcdefgh.avif");
        assert_eq!(fields["size:original"], "1234");
        assert_eq!(fields["tags"], r#"["cat","cute"]"#);

        let rebuilt = from_fields(&record.id, fields).unwrap();
        assert_eq!(rebuilt, record);
    }

    #[test]
    fn test_from_fields_without_expiry() {
        let mut record = sample_record();
        record.expiry_at = None;
        let fields: HashMap<String, String> = to_fields(&record).unwrap().into_iter().collect();
        assert_eq!(fields["expiry_at"], "");
        assert_eq!(from_fields(&record.id, fields).unwrap().expiry_at, None);
    }

    #[test]
    fn test_from_fields_rejects_unknown_format() {
        let record = sample_record();
        let mut fields: HashMap<String, String> =
            to_fields(&record).unwrap().into_iter().collect();
        fields.insert("original_format".to_string(), "tiff".to_string());
        assert!(matches!(
            from_fields(&record.id, fields),
            Err(ImageError::Internal(_))
        ));
    }

    /// Keeps a throwaway server alive for the duration of a test
    struct TestRedis {
        store: RedisMetadataStore,
        _container: Option<ContainerAsync<Redis>>,
    }

    /// Store against `REDIS_URL` when set, otherwise a fresh container.
    /// `None` when neither a server nor a container runtime is available.
    async fn test_redis() -> Option<TestRedis> {
        let (url, container) = match std::env::var("REDIS_URL") {
            Ok(url) => (url, None),
            Err(_) => {
                let container = match Redis::default().start().await {
                    Ok(container) => container,
                    Err(e) => {
                        eprintln!("skipping: redis container unavailable: {e}");
                        return None;
                    }
                };
                let host = container.get_host().await.ok()?;
                let port = container.get_host_port_ipv4(REDIS_PORT).await.ok()?;
                (format!("redis://{host}:{port}"), Some(container))
            }
        };

        let config = RedisConfig {
            url: Some(url),
            key_prefix: format!("imgpool-test-{}", rand::random::<u32>()),
            command_timeout_secs: 5,
        };
        let store = RedisMetadataStore::connect(&config).await.unwrap();
        store.ping().await.unwrap();
        Some(TestRedis {
            store,
            _container: container,
        })
    }

    fn tagged(id: &str, tags: &[&str], created: DateTime<Utc>) -> ImageRecord {
        let mut record = sample_record();
        record.id = id.to_string();
        record.tags = normalize_tags(tags.iter().copied());
        record.expiry_at = None;
        record.created_at = created;
        record
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_redis_index_lifecycle() {
        let Some(redis) = test_redis().await else {
            return;
        };
        let store = &redis.store;
        let record = sample_record();
        store.put_metadata(&record).await.unwrap();

        assert_eq!(store.get_metadata(&record.id).await.unwrap(), record);
        assert_eq!(
            store.list_ids_by_tags(&strings(&["cat"]), &[]).await.unwrap(),
            vec![record.id.clone()]
        );
        assert!(store
            .list_ids_by_tags(&[], &strings(&["cute"]))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.all_unique_tags().await.unwrap(), strings(&["cat", "cute"]));
        let after_expiry = record.expiry_at.unwrap();
        assert_eq!(
            store.expired_ids(after_expiry).await.unwrap(),
            vec![record.id.clone()]
        );
        assert!(store
            .expired_ids(after_expiry - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());

        assert!(store.delete_metadata(&record.id).await.unwrap());
        assert!(!store.delete_metadata(&record.id).await.unwrap());
        assert!(store.all_unique_tags().await.unwrap().is_empty());
        assert!(store.list_all_ids().await.unwrap().is_empty());
        assert!(store.expired_ids(after_expiry).await.unwrap().is_empty());
        assert!(store.get_metadata(&record.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_redis_tag_intersection_and_counts() {
        let Some(redis) = test_redis().await else {
            return;
        };
        let store = &redis.store;
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        // Ids sort by their timestamp prefix, newest first
        let a = tagged("20240115100000-aaaaaaaa", &["cat", "cute"], base);
        let b = tagged("20240115100100-bbbbbbbb", &["cat"], base + chrono::Duration::minutes(1));
        let c = tagged("20240115100200-cccccccc", &["cat", "cute", "dog"], base + chrono::Duration::minutes(2));
        for r in [&a, &b, &c] {
            store.put_metadata(r).await.unwrap();
        }

        assert_eq!(
            store.list_ids_by_tags(&strings(&["cat", "cute"]), &[]).await.unwrap(),
            vec![c.id.clone(), a.id.clone()]
        );
        assert_eq!(
            store
                .list_ids_by_tags(&strings(&["cute", "cat"]), &strings(&["dog"]))
                .await
                .unwrap(),
            vec![a.id.clone()]
        );
        assert!(store
            .list_ids_by_tags(&strings(&["cat", "bird"]), &[])
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.list_ids_by_tags(&[], &strings(&["cute"])).await.unwrap(),
            vec![b.id.clone()]
        );
        assert_eq!(
            store.list_all_ids().await.unwrap(),
            vec![c.id.clone(), b.id.clone(), a.id.clone()]
        );

        // Retagging moves memberships and counts
        let retagged = tagged(&c.id, &["cat"], c.created_at);
        store.put_metadata(&retagged).await.unwrap();
        assert_eq!(store.all_unique_tags().await.unwrap(), strings(&["cat", "cute"]));
        assert_eq!(
            store.list_ids_by_tags(&strings(&["cute"]), &[]).await.unwrap(),
            vec![a.id.clone()]
        );

        store.delete_metadata(&a.id).await.unwrap();
        assert_eq!(store.all_unique_tags().await.unwrap(), strings(&["cat"]));
    }

    #[tokio::test]
    async fn test_redis_attach_requires_record() {
        let Some(redis) = test_redis().await else {
            return;
        };
        let store = &redis.store;
        let mut record = sample_record();
        record.paths.remove(&Rendition::Avif);
        record.sizes.remove(&Rendition::Avif);
        store.put_metadata(&record).await.unwrap();

        let artifacts = [DerivedArtifact {
            rendition: Rendition::Webp,
            path: "portrait/webp/20240115103045-abcdefgh.webp".to_string(),
            size: 77,
        }];
        store.attach_derived(&record.id, &artifacts).await.unwrap();

        let updated = store.get_metadata(&record.id).await.unwrap();
        assert_eq!(updated.path(Rendition::Webp), Some(artifacts[0].path.as_str()));
        assert_eq!(updated.sizes.get(&Rendition::Webp), Some(&77));
        assert_eq!(updated.tags, record.tags);

        store.delete_metadata(&record.id).await.unwrap();
        assert!(store
            .attach_derived(&record.id, &artifacts)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.get_metadata(&record.id).await.unwrap_err().is_not_found());
    }
}
