//! Token grants and the per-request access decision.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::compiler::{self, sql_safe, Statement};
use crate::config::{split_fields, AccessGrant, ManagedTokens};
use crate::database::{fetch_rows, Database, JsonRow};
use crate::error::{CompileError, GateError, GateResult};
use crate::value::ParamValue;

pub const WILDCARD: &str = "*";

const MANAGED_SCRIPT: &str = "managed_tokens";

/// Privilege a request needs on the addressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Exec,
}

impl Operation {
    fn permitted_by(self, grant: &AccessGrant) -> bool {
        match self {
            Operation::Read => grant.read,
            Operation::Write => grant.write,
            Operation::Exec => grant.exec,
        }
    }
}

/// Facts the access decision is made from.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub database: &'a str,
    pub object: &'a str,
    pub operation: Operation,
    /// Bearer token with any `Bearer ` prefix already removed.
    pub token: &'a str,
    pub origin: Option<&'a str>,
    pub referer: Option<&'a str>,
}

/// Strips an optional, case-insensitive `Bearer ` prefix.
pub fn extract_bearer(header: &str) -> &str {
    let header = header.trim();
    match header.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => header[7..].trim(),
        _ => header,
    }
}

/// Short digest of a token, safe to log.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(6).map(|byte| format!("{byte:02x}")).collect()
}

/// Host part of an origin or referer URL, lower-cased.
pub fn origin_host(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = match url.host()? {
        Host::Domain(domain) => domain.to_ascii_lowercase(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    };
    (!host.is_empty()).then_some(host)
}

/// `*suffix` matches any host ending in `suffix`; anything else must match exactly.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    match pattern.strip_prefix('*') {
        Some(suffix) => host.ends_with(suffix),
        None => pattern == host,
    }
}

fn origin_allowed(grant: &AccessGrant, request: &AccessRequest<'_>) -> bool {
    if grant.allowed_origins.is_empty() {
        return true;
    }
    [request.origin, request.referer]
        .into_iter()
        .flatten()
        .filter_map(origin_host)
        .any(|host| grant.allowed_origins.iter().any(|pattern| host_matches(pattern, &host)))
}

/// First grant covering the database, object and origin with the needed
/// privilege wins.
pub fn has_access(grants: &[AccessGrant], request: &AccessRequest<'_>) -> GateResult<()> {
    let allowed = grants.iter().any(|grant| {
        (grant.target_database == request.database || grant.target_database == WILDCARD)
            && grant
                .target_objects
                .iter()
                .any(|object| object == request.object || object == WILDCARD)
            && origin_allowed(grant, request)
            && request.operation.permitted_by(grant)
    });
    if allowed {
        Ok(())
    } else {
        Err(GateError::denied(format!(
            "access token not allowed for database {} and object {}",
            request.database, request.object
        )))
    }
}

/// Source of grants for tokens that are not configured statically.
#[async_trait]
pub trait GrantSource: Send + Sync {
    async fn grants(&self, token: &str) -> GateResult<Vec<AccessGrant>>;
}

/// Grants read from a table in one of the configured databases.
#[derive(Debug)]
pub struct ManagedGrants {
    database: Arc<Database>,
    statement: Statement,
}

fn column_or<'a>(configured: &'a str, default: &'a str) -> String {
    match configured.trim() {
        "" => sql_safe(default),
        name => sql_safe(name),
    }
}

/// Grant query built from the configured table and column names.
pub fn managed_token_query(config: &ManagedTokens) -> String {
    format!(
        "SELECT {} AS \"target_database\", {} AS \"target_objects\", {} AS \"allowed_origins\", \
         {} AS \"read_private\", {} AS \"write_private\", {} AS \"exec_private\" \
         FROM {} WHERE {}=?token?",
        column_or(&config.target_database, "TARGET_DATABASE"),
        column_or(&config.target_objects, "TARGET_OBJECTS"),
        column_or(&config.allowed_origins, "ALLOWED_ORIGINS"),
        column_or(&config.read_private, "READ_PRIVATE"),
        column_or(&config.write_private, "WRITE_PRIVATE"),
        column_or(&config.exec_private, "EXEC_PRIVATE"),
        column_or(&config.table_name, "TOKENS"),
        column_or(&config.token, "TOKEN"),
    )
}

impl ManagedGrants {
    /// Resolves the grant query (explicit text, file, or template) and
    /// compiles it for the token database's dialect.
    pub async fn load(config: &ManagedTokens, database: Arc<Database>) -> GateResult<Self> {
        let text = if !config.query.trim().is_empty() {
            config.query.clone()
        } else if !config.query_path.trim().is_empty() {
            let path = config.query_path.trim();
            tokio::fs::read_to_string(path).await.map_err(|source| GateError::Io {
                path: path.to_string(),
                source,
            })?
        } else {
            managed_token_query(config)
        };

        let statement = compiler::compile(MANAGED_SCRIPT, &text, database.dialect())
            .and_then(|statements| statements.into_iter().next().ok_or(CompileError::Empty))
            .map_err(|source| GateError::Compile {
                script: MANAGED_SCRIPT.into(),
                source,
            })?;
        info!(database = %database.id(), params = statement.params.len(), "managed tokens enabled");
        Ok(Self { database, statement })
    }
}

#[async_trait]
impl GrantSource for ManagedGrants {
    async fn grants(&self, token: &str) -> GateResult<Vec<AccessGrant>> {
        let pool = self.database.pool().await?;
        let params = vec![ParamValue::from(token); self.statement.params.len()];
        let rows = fetch_rows(pool, &self.statement.sql, &params).await?;
        Ok(rows.iter().map(grant_from_row).collect())
    }
}

fn text_field(row: &JsonRow, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn flag_field(row: &JsonRow, key: &str) -> bool {
    row.get(key)
        .cloned()
        .map(ParamValue::from)
        .and_then(|value| value.to_flag())
        .unwrap_or(false)
}

fn grant_from_row(row: &JsonRow) -> AccessGrant {
    AccessGrant {
        target_database: text_field(row, "target_database"),
        target_objects: split_fields(&text_field(row, "target_objects")),
        allowed_origins: split_fields(&text_field(row, "allowed_origins")),
        read: flag_field(row, "read_private"),
        write: flag_field(row, "write_private"),
        exec: flag_field(row, "exec_private"),
    }
}

#[derive(Default)]
struct GrantCache {
    entries: HashMap<String, Arc<Vec<AccessGrant>>>,
    /// Bumped by every clear. A load that began before a clear is not stored.
    clears: u64,
}

/// Resolves token grants and decides access.
pub struct Authorizer {
    static_tokens: HashMap<String, Arc<Vec<AccessGrant>>>,
    managed: Option<Arc<dyn GrantSource>>,
    cache_tokens: bool,
    cache: Mutex<GrantCache>,
}

impl Authorizer {
    pub fn new(
        static_tokens: HashMap<String, Vec<AccessGrant>>,
        managed: Option<Arc<dyn GrantSource>>,
        cache_tokens: bool,
    ) -> Self {
        Self {
            static_tokens: static_tokens
                .into_iter()
                .map(|(token, grants)| (token, Arc::new(grants)))
                .collect(),
            managed,
            cache_tokens,
            cache: Mutex::new(GrantCache::default()),
        }
    }

    pub fn caches_tokens(&self) -> bool {
        self.cache_tokens
    }

    pub fn is_cached(&self, token: &str) -> bool {
        self.cache.lock().entries.contains_key(token)
    }

    /// Drops one token's cached grants. Returns whether an entry existed.
    pub fn clear_token(&self, token: &str) -> bool {
        let removed = {
            let mut cache = self.cache.lock();
            cache.clears += 1;
            cache.entries.remove(token).is_some()
        };
        debug!(token = %token_fingerprint(token), removed, "token cache cleared");
        removed
    }

    async fn grants_for(&self, token: &str) -> GateResult<Arc<Vec<AccessGrant>>> {
        let generation = {
            let cache = self.cache.lock();
            if let Some(cached) = cache.entries.get(token) {
                return Ok(cached.clone());
            }
            cache.clears
        };

        if let Some(source) = &self.managed {
            let grants = Arc::new(source.grants(token).await?);
            debug!(token = %token_fingerprint(token), grants = grants.len(), "managed grants loaded");
            if self.cache_tokens {
                let mut cache = self.cache.lock();
                if cache.clears == generation {
                    cache.entries.insert(token.to_string(), grants.clone());
                } else {
                    debug!(token = %token_fingerprint(token), "cache cleared during load, not storing");
                }
            }
            return Ok(grants);
        }

        Ok(self.static_tokens.get(token).cloned().unwrap_or_default())
    }

    /// Token-based part of the decision, for objects that are not public.
    pub async fn check(&self, request: &AccessRequest<'_>) -> GateResult<()> {
        if request.token.is_empty() {
            return Err(GateError::denied("access denied"));
        }
        let grants = self.grants_for(request.token).await?;
        if grants.is_empty() {
            warn!(token = %token_fingerprint(request.token), "token has no grants");
            return Err(GateError::denied("access denied"));
        }
        has_access(&grants, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn grant(database: &str, objects: &[&str]) -> AccessGrant {
        AccessGrant {
            target_database: database.into(),
            target_objects: objects.iter().map(|o| o.to_string()).collect(),
            ..AccessGrant::default()
        }
    }

    fn request<'a>(operation: Operation, token: &'a str) -> AccessRequest<'a> {
        AccessRequest {
            database: "test_db",
            object: "token_table",
            operation,
            token,
            origin: None,
            referer: None,
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GrantSource for CountingSource {
        async fn grants(&self, token: &str) -> GateResult<Vec<AccessGrant>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if token == "managed" {
                Ok(vec![AccessGrant {
                    read: true,
                    ..grant("*", &["*"])
                }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    /// Holds its first lookup open until released.
    #[derive(Default)]
    struct GatedSource {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl GrantSource for GatedSource {
        async fn grants(&self, _token: &str) -> GateResult<Vec<AccessGrant>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(vec![AccessGrant {
                read: true,
                ..grant("*", &["*"])
            }])
        }
    }

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(extract_bearer("Bearer 0987654321"), "0987654321");
        assert_eq!(extract_bearer("bearer   abc "), "abc");
        assert_eq!(extract_bearer("1234567890"), "1234567890");
        assert_eq!(extract_bearer(""), "");
    }

    #[test]
    fn origin_hosts() {
        assert_eq!(origin_host("https://api.example.com").as_deref(), Some("api.example.com"));
        assert_eq!(origin_host("https://API.example.com:8443/path?q=1").as_deref(), Some("api.example.com"));
        assert_eq!(origin_host("http://user@localhost:8080").as_deref(), Some("localhost"));
        assert_eq!(origin_host("http://[::1]:80/").as_deref(), Some("::1"));
        assert_eq!(origin_host(""), None);
        assert_eq!(origin_host("not a url"), None);
        assert_eq!(origin_host("https://evil.net\\@api.example.com/").as_deref(), Some("evil.net"));
    }

    #[test]
    fn wildcard_origin_patterns() {
        let grant = AccessGrant {
            read: true,
            allowed_origins: vec!["*.example.com".into()],
            ..grant("test_db", &["token_table"])
        };
        let grants = [grant];
        let base = request(Operation::Read, "t");

        let by_origin = AccessRequest { origin: Some("https://api.example.com"), ..base };
        assert!(has_access(&grants, &by_origin).is_ok());

        let by_referer = AccessRequest { referer: Some("https://api.example.com/path"), ..base };
        assert!(has_access(&grants, &by_referer).is_ok());

        let other = AccessRequest { origin: Some("https://api.example.net"), ..base };
        assert!(has_access(&grants, &other).is_err());

        let smuggled = AccessRequest { referer: Some("https://evil.net\\@api.example.com/"), ..base };
        assert!(has_access(&grants, &smuggled).is_err());
        assert!(has_access(&grants, &base).is_err());
    }

    #[test]
    fn exact_origin_requires_equality() {
        assert!(host_matches("localhost", "localhost"));
        assert!(!host_matches("example.com", "api.example.com"));
        assert!(host_matches("*example.com", "example.com"));
    }

    #[test]
    fn privilege_follows_operation() {
        let grants = [AccessGrant {
            write: true,
            ..grant("test_db", &["token_table"])
        }];
        assert!(has_access(&grants, &request(Operation::Write, "t")).is_ok());
        let err = has_access(&grants, &request(Operation::Read, "t")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "access token not allowed for database test_db and object token_table"
        );
        assert!(has_access(&[AccessGrant { exec: true, ..grant("*", &["*"]) }], &request(Operation::Exec, "t")).is_ok());
        assert!(has_access(&[AccessGrant { read: true, ..grant("other", &["*"]) }], &request(Operation::Read, "t")).is_err());
    }

    #[tokio::test]
    async fn static_tokens() {
        let tokens = HashMap::from([(
            "1234567890".to_string(),
            vec![AccessGrant {
                read: true,
                ..grant("test_db", &["token_table"])
            }],
        )]);
        let auth = Authorizer::new(tokens, None, false);
        assert!(auth.check(&request(Operation::Read, "1234567890")).await.is_ok());

        let err = auth.check(&request(Operation::Read, "unknown")).await.unwrap_err();
        assert_eq!(err.to_string(), "access denied");
        let err = auth.check(&request(Operation::Read, "")).await.unwrap_err();
        assert!(matches!(err, GateError::Denied(_)));
    }

    #[tokio::test]
    async fn managed_grants_are_cached_until_cleared() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let auth = Authorizer::new(HashMap::new(), Some(source.clone()), true);

        auth.check(&request(Operation::Read, "managed")).await.unwrap();
        auth.check(&request(Operation::Read, "managed")).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(auth.is_cached("managed"));

        assert!(auth.clear_token("managed"));
        assert!(!auth.is_cached("managed"));
        auth.check(&request(Operation::Read, "managed")).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_during_load_is_not_undone() {
        let source = Arc::new(GatedSource::default());
        let auth = Authorizer::new(HashMap::new(), Some(source.clone()), true);
        let req = request(Operation::Read, "managed");

        let clear = async {
            source.started.notified().await;
            auth.clear_token("managed");
            source.release.notify_one();
        };
        let (loaded, ()) = tokio::join!(auth.check(&req), clear);
        loaded.unwrap();
        assert!(!auth.is_cached("managed"));

        auth.check(&req).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(auth.is_cached("managed"));
    }

    #[tokio::test]
    async fn disabled_cache_queries_every_time() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let auth = Authorizer::new(HashMap::new(), Some(source.clone()), false);
        auth.check(&request(Operation::Read, "managed")).await.unwrap();
        auth.check(&request(Operation::Read, "managed")).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(auth.check(&request(Operation::Read, "nobody")).await.is_err());
    }

    #[test]
    fn template_uses_defaults_and_escapes_names() {
        let sql = managed_token_query(&ManagedTokens {
            table_name: "MY_TOKENS--".into(),
            ..ManagedTokens::default()
        });
        assert_eq!(
            sql,
            "SELECT TARGET_DATABASE AS \"target_database\", TARGET_OBJECTS AS \"target_objects\", \
             ALLOWED_ORIGINS AS \"allowed_origins\", READ_PRIVATE AS \"read_private\", \
             WRITE_PRIVATE AS \"write_private\", EXEC_PRIVATE AS \"exec_private\" \
             FROM MY_TOKENS WHERE TOKEN=?token?"
        );
    }

    #[tokio::test]
    async fn managed_query_compiles_for_the_token_database() {
        let db = Arc::new(Database::new(
            "tokens",
            &DatabaseConfig {
                kind: "pgx".into(),
                url: String::new(),
                max_connections: 1,
            },
        ));
        let templated = ManagedGrants::load(&ManagedTokens::default(), db.clone()).await.unwrap();
        assert!(templated.statement.sql.ends_with("FROM TOKENS WHERE TOKEN=$1"));

        let explicit = ManagedTokens {
            query: "select * from grants where a=?token? or b=?token?".into(),
            ..ManagedTokens::default()
        };
        let explicit = ManagedGrants::load(&explicit, db.clone()).await.unwrap();
        assert_eq!(explicit.statement.sql, "select * from grants where a=$1 or b=$2");

        let empty = ManagedTokens {
            query: "-- nothing here".into(),
            ..ManagedTokens::default()
        };
        let err = ManagedGrants::load(&empty, db).await.unwrap_err();
        assert!(matches!(err, GateError::Compile { source: CompileError::Empty, .. }));
    }

    #[test]
    fn grant_rows_tolerate_encodings() {
        let row: JsonRow = serde_json::from_value(serde_json::json!({
            "target_database": "test_db",
            "target_objects": "a  b",
            "read_private": 1,
            "write_private": "0",
            "exec_private": true
        }))
        .unwrap();
        let grant = grant_from_row(&row);
        assert_eq!(grant.target_objects, vec!["a", "b"]);
        assert!(grant.allowed_origins.is_empty());
        assert!(grant.read && !grant.write && grant.exec);
    }
}
