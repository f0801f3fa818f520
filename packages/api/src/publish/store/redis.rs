use std::time::Duration;

use futures::lock::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::publish::session::{CasOutcome, PublishSession, SessionStore, SessionStoreError};

const SESSION_PREFIX: &str = "publish:session:";
const TOKEN_PREFIX: &str = "publish:token:";
const RUN_PREFIX: &str = "publish:run:";

// Replaces the record only when the stored revision still matches the one
// the writer read. ARGV: new json, expected revision, ttl seconds.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
local decoded = cjson.decode(current)
if tostring(decoded.revision) ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', tonumber(ARGV[3]))
return 1
"#;

pub struct RedisSessionStore {
    connection: Mutex<MultiplexedConnection>,
    session_ttl: Duration,
    cas: Script,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, session_ttl: Duration) -> Result<Self, SessionStoreError> {
        let client =
            redis::Client::open(url).map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(Self {
            connection: Mutex::new(connection),
            session_ttl,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn session_key(id: &str) -> String {
        format!("{}{}", SESSION_PREFIX, id)
    }

    fn token_key(id: &str) -> String {
        format!("{}{}", TOKEN_PREFIX, id)
    }

    fn run_key(run_id: &str) -> String {
        format!("{}{}", RUN_PREFIX, run_id)
    }

    fn ttl_secs(&self) -> u64 {
        self.session_ttl.as_secs().max(1)
    }
}

#[async_trait::async_trait]
impl SessionStore for RedisSessionStore {
    async fn insert(&self, session: &PublishSession) -> Result<(), SessionStoreError> {
        let json = serde_json::to_string(session)?;
        let mut conn = self.connection.lock().await;
        let _: () = conn
            .set_ex(Self::session_key(&session.id), json, self.ttl_secs())
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PublishSession>, SessionStoreError> {
        let mut conn = self.connection.lock().await;
        let raw: Option<String> = conn
            .get(Self::session_key(id))
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        session: &PublishSession,
    ) -> Result<CasOutcome, SessionStoreError> {
        let json = serde_json::to_string(session)?;
        let expected = session.revision.wrapping_sub(1).to_string();
        let mut conn = self.connection.lock().await;
        let verdict: i64 = self
            .cas
            .key(Self::session_key(&session.id))
            .arg(json)
            .arg(expected)
            .arg(self.ttl_secs())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(match verdict {
            1 => CasOutcome::Written,
            0 => CasOutcome::Conflict,
            _ => CasOutcome::Missing,
        })
    }

    async fn put_token(&self, session_id: &str, token: &str) -> Result<(), SessionStoreError> {
        let mut conn = self.connection.lock().await;
        let _: () = conn
            .set_ex(Self::token_key(session_id), token, self.ttl_secs())
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn take_token(&self, session_id: &str) -> Result<Option<String>, SessionStoreError> {
        let mut conn = self.connection.lock().await;
        // GETDEL is atomic, so concurrent consumers race for one winner.
        let token: Option<String> = redis::cmd("GETDEL")
            .arg(Self::token_key(session_id))
            .query_async(&mut *conn)
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(token)
    }

    async fn index_run(&self, run_id: &str, session_id: &str) -> Result<(), SessionStoreError> {
        let mut conn = self.connection.lock().await;
        let _: () = conn
            .set_ex(Self::run_key(run_id), session_id, self.ttl_secs())
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn session_for_run(&self, run_id: &str) -> Result<Option<String>, SessionStoreError> {
        let mut conn = self.connection.lock().await;
        conn.get(Self::run_key(run_id))
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))
    }

    async fn ping(&self) -> Result<(), SessionStoreError> {
        let mut conn = self.connection.lock().await;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| SessionStoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
