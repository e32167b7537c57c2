//! Topology identity and the once-per-process declaration cache
//!
//! A [`TopologyKey`] names one declaration: a queue, or an exchange together with
//! its complete queue/binding-key table. [`TopologyCache`] guarantees the broker
//! sees each key declared at most once for the lifetime of the process, even when
//! many publishers and consumers race on first use.

use crate::error::MessagingError;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::OnceCell;
use tracing::debug;

/// Exchange routing semantics supported by the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExchangeKind {
    Fanout,
    Direct,
    Topic,
}

impl ExchangeKind {
    /// Prefix used for derived exchange names
    pub fn prefix(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "f",
            ExchangeKind::Direct => "d",
            ExchangeKind::Topic => "t",
        }
    }
}

/// Queue name to binding keys, kept sorted so equal tables compare and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RoutingTable(BTreeMap<String, BTreeSet<String>>);

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every queue bound with the empty key, the fanout shape
    pub fn from_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for queue in queues {
            table = table.route(queue, [""]);
        }
        table
    }

    /// Add binding keys for a queue. An empty key list binds with `""`.
    pub fn route<I, K>(mut self, queue: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let entry = self.0.entry(queue.into()).or_default();
        entry.extend(keys.into_iter().map(Into::into));
        if entry.is_empty() {
            entry.insert(String::new());
        }
        self
    }

    /// Add binding keys given as a `,`/`;` separated list
    pub fn route_list(self, queue: impl Into<String>, keys: &str) -> Self {
        self.route(queue, parse_binding_keys(keys))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Queue names in sorted order
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.0.iter().map(|(queue, keys)| (queue.as_str(), keys))
    }

    /// `{prefix}_{queue}_{queue}...` over the sorted queue names
    pub fn derived_exchange_name(&self, kind: ExchangeKind) -> String {
        let mut name = String::from(kind.prefix());
        for queue in self.queues() {
            name.push('_');
            name.push_str(queue);
        }
        name
    }
}

/// Split a binding key list on `,` and `;`, trimming each entry.
///
/// Blank input yields the single empty key.
pub fn parse_binding_keys(raw: &str) -> Vec<String> {
    let keys: Vec<String> = raw
        .split([',', ';'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect();

    if keys.is_empty() {
        vec![String::new()]
    } else {
        keys
    }
}

/// Identity of one declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopologyKey {
    Queue(String),
    Exchange {
        kind: ExchangeKind,
        exchange: String,
        bindings: RoutingTable,
    },
}

impl TopologyKey {
    pub fn queue(name: impl Into<String>) -> Self {
        TopologyKey::Queue(name.into())
    }

    pub fn exchange(kind: ExchangeKind, exchange: impl Into<String>, bindings: RoutingTable) -> Self {
        TopologyKey::Exchange {
            kind,
            exchange: exchange.into(),
            bindings,
        }
    }

    /// Stable SHA-256 digest of the canonical form, for logs
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for TopologyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyKey::Queue(name) => write!(f, "queue:{}", name),
            TopologyKey::Exchange {
                kind,
                exchange,
                bindings,
            } => {
                write!(f, "{}:{}", kind, exchange)?;
                for (queue, keys) in bindings.iter() {
                    let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                    write!(f, "|{}={}", queue, keys.join(","))?;
                }
                Ok(())
            }
        }
    }
}

/// Process-wide set of completed declarations
///
/// Append-only: once a key is declared it stays declared. A failed declaration
/// leaves the key undeclared so the next caller retries it.
#[derive(Default)]
pub struct TopologyCache {
    declared: Mutex<HashMap<TopologyKey, Arc<OnceCell<()>>>>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &TopologyKey) -> Arc<OnceCell<()>> {
        let mut declared = self.declared.lock().unwrap_or_else(|e| e.into_inner());
        declared.entry(key.clone()).or_default().clone()
    }

    /// Run `declare` unless `key` has already been declared.
    ///
    /// Concurrent callers for the same key wait on the single in-flight declaration.
    /// Returns `true` only to the caller whose `declare` ran and succeeded.
    pub async fn ensure_declared<F, Fut>(
        &self,
        key: &TopologyKey,
        declare: F,
    ) -> Result<bool, MessagingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), MessagingError>>,
    {
        let cell = self.cell(key);
        if cell.initialized() {
            return Ok(false);
        }

        let mut ran = false;
        cell.get_or_try_init(|| {
            ran = true;
            declare()
        })
        .await?;

        if ran {
            debug!(key = %key, fingerprint = %key.fingerprint(), "Topology declared");
        }
        Ok(ran)
    }

    pub fn is_declared(&self, key: &TopologyKey) -> bool {
        let declared = self.declared.lock().unwrap_or_else(|e| e.into_inner());
        declared.get(key).is_some_and(|cell| cell.initialized())
    }

    /// Number of keys declared so far
    pub fn len(&self) -> usize {
        let declared = self.declared.lock().unwrap_or_else(|e| e.into_inner());
        declared.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
