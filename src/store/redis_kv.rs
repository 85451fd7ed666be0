use super::{ClaimedSwap, KvBackend, StoreError};
use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};

// Swap only when the current value equals the expected one (or is absent when
// no value is expected).
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

// Same swap, but only while the JSON record at KEYS[1] carries ARGV[1] as its
// claim token. Returns -1 when it does not.
const CLAIMED_CAS_SCRIPT: &str = r#"
local owner = redis.call('GET', KEYS[1])
if not owner then return -1 end
local record = cjson.decode(owner)
if record['claim_token'] ~= ARGV[1] then return -1 end
local current = redis.call('GET', KEYS[2])
if ARGV[2] == '0' then
  if current then return 0 end
elseif current ~= ARGV[3] then
  return 0
end
redis.call('SET', KEYS[2], ARGV[4])
return 1
"#;

#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    namespace: String,
    cas: Script,
    claimed_cas: Script,
}

impl RedisKv {
    pub fn open(url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            cas: Script::new(CAS_SCRIPT),
            claimed_cas: Script::new(CLAIMED_CAS_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(self.key(key)).await.map_err(backend)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.key(key), value)
            .await
            .map_err(backend)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.cas.prepare_invoke();
        invocation
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value);
        let swapped: i32 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(swapped == 1)
    }

    async fn claimed_swap(
        &self,
        owner_key: &str,
        token: &str,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<ClaimedSwap, StoreError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.claimed_cas.prepare_invoke();
        invocation
            .key(self.key(owner_key))
            .key(self.key(key))
            .arg(token)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value);
        let outcome: i32 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(match outcome {
            1 => ClaimedSwap::Swapped,
            0 => ClaimedSwap::Mismatch,
            _ => ClaimedSwap::NotOwner,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key(key)).await.map_err(backend)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", self.key(prefix));
        let mut found = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(backend)?;
        let mut keys = Vec::new();
        while let Some(key) = found.next_item().await {
            let key = key.map_err(backend)?;
            if let Some(stripped) = key.strip_prefix(&self.namespace) {
                keys.push(stripped.to_string());
            }
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    // Runs only against a live server named by REDIS_URL.
    fn live() -> Option<RedisKv> {
        let url = std::env::var("REDIS_URL").ok()?;
        let namespace = format!("crosslist-test:{}:", Uuid::new_v4().simple());
        RedisKv::open(&url, &namespace).ok()
    }

    #[tokio::test]
    async fn round_trips_against_live_redis() {
        let Some(kv) = live() else {
            return;
        };

        assert_eq!(kv.get("job:a").await.unwrap(), None);
        assert!(kv.compare_and_swap("job:a", None, "v1".into()).await.unwrap());
        assert!(!kv.compare_and_swap("job:a", None, "v2".into()).await.unwrap());
        assert!(!kv.compare_and_swap("job:a", Some("stale"), "v2".into()).await.unwrap());
        assert!(kv.compare_and_swap("job:a", Some("v1"), "v2".into()).await.unwrap());
        assert_eq!(kv.get("job:a").await.unwrap().as_deref(), Some("v2"));

        kv.put("job:owned", r#"{"claim_token":"w1"}"#.into()).await.unwrap();
        assert_eq!(
            kv.claimed_swap("job:owned", "w1", "artifact:a", None, "x".into())
                .await
                .unwrap(),
            ClaimedSwap::Swapped
        );
        assert_eq!(
            kv.claimed_swap("job:owned", "w2", "artifact:a", Some("x"), "y".into())
                .await
                .unwrap(),
            ClaimedSwap::NotOwner
        );
        assert_eq!(kv.get("artifact:a").await.unwrap().as_deref(), Some("x"));
        kv.delete("job:owned").await.unwrap();
        kv.delete("artifact:a").await.unwrap();

        kv.put("job:b", "v".into()).await.unwrap();
        kv.put("batch:x", "v".into()).await.unwrap();
        assert_eq!(kv.keys("job:").await.unwrap(), vec!["job:a", "job:b"]);

        for key in ["job:a", "job:b", "batch:x"] {
            kv.delete(key).await.unwrap();
        }
        assert!(kv.keys("").await.unwrap().is_empty());
    }
}
