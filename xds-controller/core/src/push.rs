use crate::{HashMap, HashSet, TypeUrl};
use chrono::{SecondsFormat, Utc};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Describes a push to one or more proxies.
///
/// Scheduled pushes carry the names of resources that changed, grouped by type. Pushes that answer
/// a client request instead set `from_request`, and are scoped to the type and session that asked.
#[derive(Clone, Debug)]
pub struct PushRequest {
    /// Resources that changed since the last push, by type URL.
    pub configs_updated: HashMap<TypeUrl, HashSet<String>>,

    /// Set when this push is a response to a client request rather than a configuration change.
    pub from_request: bool,

    /// The version reported on every response generated for this push.
    pub version: String,

    /// Subscription changes made by the request this push responds to.
    pub delta: ResourceDelta,

    /// When the first change merged into this push was observed.
    pub start: Instant,
}

/// Subscription changes carried by a client request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceDelta {
    /// Names newly subscribed to.
    pub subscribed: HashSet<String>,

    /// Names that were tracked for the client and are now unsubscribed.
    pub unsubscribed: HashSet<String>,
}

/// Issues push versions from a monotonically increasing counter.
#[derive(Debug, Default)]
pub struct PushVersion(AtomicU64);

// === impl PushRequest ===

impl PushRequest {
    /// A push for resources of `type_url` that changed.
    pub fn updated(type_url: impl Into<TypeUrl>, names: impl IntoIterator<Item = String>) -> Self {
        let mut configs_updated = HashMap::default();
        configs_updated.insert(type_url.into(), names.into_iter().collect());
        Self {
            configs_updated,
            from_request: false,
            version: String::new(),
            delta: ResourceDelta::default(),
            start: Instant::now(),
        }
    }

    /// A push answering a client request, resyncing the requested type in full.
    pub fn full_resync(version: String) -> Self {
        Self::from_request(version, ResourceDelta::default())
    }

    /// A push answering a client request that changed its subscriptions.
    pub fn from_request(version: String, delta: ResourceDelta) -> Self {
        Self {
            configs_updated: HashMap::default(),
            from_request: true,
            version,
            delta,
            start: Instant::now(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.from_request
    }

    /// Indicates whether this request resyncs the full contents of a type.
    ///
    /// Requests that didn't change subscriptions resync in full, as do scheduled pushes that don't
    /// name any changed resources.
    pub fn is_full(&self) -> bool {
        if self.from_request {
            self.delta.is_empty()
        } else {
            self.configs_updated.is_empty()
        }
    }

    /// A short description of why this push is happening, suitable for logs.
    pub fn reason(&self) -> &'static str {
        if self.from_request {
            "request"
        } else {
            "config"
        }
    }

    /// Returns the names that changed for the given type, if any.
    pub fn updated_names(&self, type_url: &str) -> Option<&HashSet<String>> {
        self.configs_updated.get(type_url)
    }

    /// Merges `other` into this request by taking the union of updated names.
    ///
    /// The start time is the earlier of the two. A version set on `other` replaces this one.
    pub fn merge(mut self, other: PushRequest) -> PushRequest {
        for (type_url, names) in other.configs_updated {
            self.configs_updated
                .entry(type_url)
                .or_default()
                .extend(names);
        }
        if other.start < self.start {
            self.start = other.start;
        }
        if !other.version.is_empty() {
            self.version = other.version;
        }
        self
    }

    /// The total number of changed names across all types.
    pub fn num_updated(&self) -> usize {
        self.configs_updated.values().map(|names| names.len()).sum()
    }
}

// === impl ResourceDelta ===

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty()
    }
}

// === impl PushVersion ===

impl PushVersion {
    /// Returns a new version of the form `<RFC3339 timestamp>/<counter>`.
    pub fn next(&self) -> String {
        let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}/{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            n
        )
    }
}

/// Builds a unique response nonce from a push version.
pub fn nonce(version: &str) -> String {
    format!("{version}{}", uuid::Uuid::new_v4())
}
