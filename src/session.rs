//! Session manager built on top of [`TtlStore`].
//!
//! A session is just a tagged key-value bag with a creation and expiry
//! timestamp, serialised to a single line of bytes and written through to
//! whatever [`TtlStore`] backs the manager. Where the session id travels
//! (`Cookie`/`Header`/`Query`) and how a fresh one is minted are both
//! pluggable, the same way [`ConnectionFilter`](crate::ConnectionFilter) and
//! [`ConnectionData`](crate::ConnectionData) are pluggable on the server.

use crate::{limits::SessionLimits, store::TtlStore, Request, Response};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;
use uuid::Uuid;

const NIL_MARKER: &str = "__NIL_VALUE__";

/// A session value. `Opaque` carries the `other` wire tag for callers storing
/// application-specific encodings this crate has no dedicated variant for.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    Opaque(String),
}

impl Value {
    fn tag(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int(_) => "number",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Nil => "nil",
            Value::Opaque(_) => "other",
        }
    }

    fn encode_raw(&self) -> String {
        match self {
            Value::String(s) | Value::Opaque(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Nil => String::new(),
        }
    }

    // Unknown tags, and values parseable under their declared tag but not
    // matching it, both fall back to `String` per the documented wire contract.
    fn decode(tag: &str, raw: &str) -> Value {
        match tag {
            "number" => raw.parse().map(Value::Int).unwrap_or_else(|_| Value::String(raw.to_string())),
            "float" => raw.parse().map(Value::Float).unwrap_or_else(|_| Value::String(raw.to_string())),
            "bool" => raw.parse().map(Value::Bool).unwrap_or_else(|_| Value::String(raw.to_string())),
            "other" => Value::Opaque(raw.to_string()),
            _ => Value::String(raw.to_string()),
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Where an incoming request carries its session id.
#[derive(Debug, Clone, Copy)]
pub enum KeyLookup {
    Cookie(&'static str),
    Header(&'static str),
    Query(&'static str),
}

/// A live session: values plus the bookkeeping needed to serialise and save it.
pub struct Session {
    id: String,
    created_at: u64,
    expires_at: u64,
    values: HashMap<String, Value>,
    store: TtlStore,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn set_expiry(&mut self, ttl: Duration) {
        self.expires_at = now_unix() + ttl.as_secs();
    }

    /// Serialises and writes this session through to its backing store, with
    /// TTL equal to `expires_at - now`. Deletes the stored entry instead if
    /// that TTL is zero or negative.
    pub fn save(&self) {
        let now = now_unix();
        if self.expires_at <= now {
            self.store.delete(&self.id);
            return;
        }

        self.store
            .set(self.id.clone(), &self.serialize(), Duration::from_secs(self.expires_at - now));
    }

    // "<id>|<created_unix>|<expires_unix>|<k1>=<tag>:<v1>;<k2>=<tag>:<v2>;..."
    // A Nil value is encoded as "<k>=__NIL_VALUE__;" instead of a tagged pair.
    fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{}|{}|{}|", self.id, self.created_at, self.expires_at);
        for (key, value) in &self.values {
            if let Value::Nil = value {
                out.push_str(&format!("{key}={NIL_MARKER};"));
            } else {
                out.push_str(&format!("{key}={}:{};", value.tag(), value.encode_raw()));
            }
        }
        out.into_bytes()
    }

    fn deserialize(store: TtlStore, bytes: &[u8]) -> Option<Session> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut parts = text.splitn(4, '|');
        let id = parts.next()?.to_string();
        let created_at = parts.next()?.parse().ok()?;
        let expires_at = parts.next()?.parse().ok()?;
        let rest = parts.next().unwrap_or("");

        let mut values = HashMap::new();
        for entry in rest.split(';') {
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };

            if value == NIL_MARKER {
                values.insert(key.to_string(), Value::Nil);
                continue;
            }

            // A value without a tag is treated as a plain string.
            let value = match value.split_once(':') {
                Some((tag, raw)) => Value::decode(tag, raw),
                None => Value::String(value.to_string()),
            };
            values.insert(key.to_string(), value);
        }

        Some(Session {
            id,
            created_at,
            expires_at,
            values,
            store,
        })
    }
}

type KeyGenerator = dyn Fn() -> String + Send + Sync;

/// Builds and persists [`Session`]s against a [`TtlStore`], resolving the
/// session id from wherever [`KeyLookup`] points.
#[derive(Clone)]
pub struct SessionManager {
    store: TtlStore,
    limits: SessionLimits,
    lookup: KeyLookup,
    key_generator: Arc<KeyGenerator>,
    path: &'static str,
    domain: Option<&'static str>,
    secure: bool,
    http_only: bool,
}

impl SessionManager {
    /// Cookie-based lookup under `limits.cookie_name`, UUID v4 ids, path `/`,
    /// `HttpOnly` set, `Secure` unset - override with the builder methods below.
    pub fn new(store: TtlStore, limits: SessionLimits) -> Self {
        let lookup = KeyLookup::Cookie(limits.cookie_name);

        SessionManager {
            store,
            limits,
            lookup,
            key_generator: Arc::new(|| Uuid::new_v4().to_string()),
            path: "/",
            domain: None,
            secure: false,
            http_only: true,
        }
    }

    pub fn key_lookup(mut self, lookup: KeyLookup) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn key_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }

    pub fn cookie_path(mut self, path: &'static str) -> Self {
        self.path = path;
        self
    }

    pub fn cookie_domain(mut self, domain: &'static str) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn cookie_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn cookie_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Resolves the session id from `request` and loads it, or returns a
    /// freshly allocated session if no id was present or the store had
    /// nothing live under it. Never emits a cookie.
    pub fn get(&self, request: &Request) -> Session {
        if let Some(id) = self.resolve_id(request) {
            if let Ok(bytes) = self.store.get(&id) {
                if let Some(session) = Session::deserialize(self.store.clone(), &bytes) {
                    return session;
                }
            }
            trace!(target: "session", "incoming id {id} expired or absent, minting a new session");
        }
        self.fresh_session()
    }

    /// Like [`get`](SessionManager::get), but if the request carried no id
    /// and the lookup source is `Cookie`, writes a `Set-Cookie` for the new
    /// session's id onto `response`.
    pub fn get_or_create(&self, request: &Request, response: &mut Response) -> Session {
        let had_id = self.resolve_id(request).is_some();
        let session = self.get(request);

        if !had_id {
            if let KeyLookup::Cookie(name) = self.lookup {
                let max_age = (session.expires_at.saturating_sub(now_unix())) as i64;
                self.set_cookie(response, name, &session.id, max_age);
            }
        }

        session
    }

    /// Clears `session`'s values and forces its expiry into the past,
    /// removing it from the backing store. If `response` is supplied and the
    /// lookup source is `Cookie`, also expires the client's cookie.
    pub fn destroy(&self, session: &mut Session, response: Option<&mut Response>) {
        session.values.clear();
        session.expires_at = 0;
        self.store.delete(&session.id);

        if let Some(response) = response {
            if let KeyLookup::Cookie(name) = self.lookup {
                self.set_cookie(response, name, "", -1);
            }
        }
    }

    fn fresh_session(&self) -> Session {
        let now = now_unix();
        Session {
            id: (self.key_generator)(),
            created_at: now,
            expires_at: now + self.limits.default_ttl.as_secs(),
            values: HashMap::new(),
            store: self.store.clone(),
        }
    }

    fn resolve_id(&self, request: &Request) -> Option<String> {
        match self.lookup {
            KeyLookup::Cookie(name) => {
                let cookie_header = request.header(b"cookie")?;
                parse_cookie(cookie_header, name)
            }
            KeyLookup::Header(name) => std::str::from_utf8(request.header(name.as_bytes())?)
                .ok()
                .map(str::to_string),
            KeyLookup::Query(name) => std::str::from_utf8(request.url().query(name.as_bytes())?)
                .ok()
                .map(str::to_string),
        }
    }

    fn set_cookie(&self, response: &mut Response, name: &str, id: &str, max_age: i64) {
        let mut cookie = format!("{name}={id}; Path={}; Max-Age={max_age}", self.path);
        if let Some(domain) = self.domain {
            cookie.push_str(&format!("; Domain={domain}"));
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        response.header("set-cookie", cookie);
    }
}

/// Splits a raw `Cookie` header on `;`, trims each part, splits once on `=`,
/// and returns the value for `name`. Fragments with no `=` are skipped.
fn parse_cookie(header: &[u8], name: &str) -> Option<String> {
    let header = std::str::from_utf8(header).ok()?;
    for part in header.split(';') {
        let part = part.trim();
        let (key, value) = part.split_once('=')?;
        if key.trim() == name {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{ReqLimits, StoreLimits};

    fn manager() -> SessionManager {
        SessionManager::new(TtlStore::new(StoreLimits::default()), SessionLimits::default())
    }

    #[test]
    fn round_trips_values_through_serialization() {
        let mgr = manager();
        let mut session = mgr.fresh_session();
        session.set("name", Value::String("ada".into()));
        session.set("visits", Value::Int(3));
        session.set("score", Value::Float(1.5));
        session.set("admin", Value::Bool(true));
        session.set("deleted_field", Value::Nil);
        session.save();

        let bytes = mgr.store.get(&session.id).unwrap();
        let restored = Session::deserialize(mgr.store.clone(), &bytes).unwrap();

        assert_eq!(restored.get("name"), Some(&Value::String("ada".into())));
        assert_eq!(restored.get("visits"), Some(&Value::Int(3)));
        assert_eq!(restored.get("score"), Some(&Value::Float(1.5)));
        assert_eq!(restored.get("admin"), Some(&Value::Bool(true)));
        assert_eq!(restored.get("deleted_field"), Some(&Value::Nil));
    }

    #[test]
    fn tagless_value_deserializes_as_string() {
        let mgr = manager();
        let store = mgr.store.clone();
        store.set("abc", b"abc|0|9999999999|greeting=hi;", Duration::ZERO);
        let bytes = store.get("abc").unwrap();
        let session = Session::deserialize(store, &bytes).unwrap();
        assert_eq!(session.get("greeting"), Some(&Value::String("hi".to_string())));
    }

    #[test]
    fn unknown_tag_deserializes_as_string() {
        let mgr = manager();
        let store = mgr.store.clone();
        store.set("abc", b"abc|0|9999999999|thing=weird:xyz;", Duration::ZERO);
        let bytes = store.get("abc").unwrap();
        let session = Session::deserialize(store, &bytes).unwrap();
        assert_eq!(session.get("thing"), Some(&Value::String("xyz".to_string())));
    }

    #[test]
    fn cookie_parsing_skips_malformed_fragments() {
        assert_eq!(parse_cookie(b"sid=abc; garbage; theme=dark", "theme"), Some("dark".to_string()));
        assert_eq!(parse_cookie(b"garbage", "sid"), None);
    }

    #[test]
    fn get_without_existing_id_returns_fresh_session() {
        let mgr = manager();
        let req = Request::new(&ReqLimits::default());
        let session = mgr.get(&req);
        assert!(session.keys().next().is_none());
    }
}
