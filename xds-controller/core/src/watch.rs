use crate::{HashSet, ResourceDelta, TypeUrl};
use std::time::Instant;

/// The resource name a client subscribes to in order to receive every resource of a type.
pub const WILDCARD: &str = "*";

/// Tracks the state of a single type subscription for a proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchedResource {
    pub type_url: TypeUrl,

    /// For wildcard subscriptions, the names the client currently holds. Otherwise, the names the
    /// client subscribed to, whether or not they currently exist.
    ///
    /// `None` when names are not tracked, which is the case for wildcard subscriptions to types
    /// that may have very large numbers of resources.
    pub resource_names: Option<HashSet<String>>,

    /// Set when the client wants every resource of this type.
    pub wildcard: bool,

    /// The nonce of the last response sent for this type.
    pub nonce_sent: String,

    /// The nonce of the last response the client acknowledged.
    pub nonce_acked: String,

    /// The error reported by the client when it last rejected a response.
    pub last_error: String,

    pub last_send_time: Option<Instant>,

    /// Forces a response to the next request, even if it looks like a plain ACK.
    pub always_respond: bool,
}

/// Computes the tracked names for a subscription.
///
/// Returns the updated set of names, whether the request is a wildcard subscription, and whether
/// the request changed the set. The wildcard name is never included in the returned set.
pub fn delta_watched_resources<'a>(
    existing: Option<HashSet<String>>,
    subscribe: &[String],
    unsubscribe: &[String],
    initial: impl IntoIterator<Item = &'a String>,
) -> (HashSet<String>, bool, bool) {
    let mut names = existing.unwrap_or_default();
    let mut changed = false;
    for name in subscribe {
        changed |= names.insert(name.clone());
    }
    // Set by clients on the first request of a new stream so that the server knows what the client
    // already holds.
    for name in initial {
        changed |= names.insert(name.clone());
    }
    for name in unsubscribe {
        changed |= names.remove(name);
    }

    // A request is a wildcard subscription if it explicitly subscribes to `*`, or if it does not
    // subscribe to anything at all. This means a client can't subscribe to nothing; clients that
    // want to start empty subscribe to and unsubscribe from `*` in their first request.
    let wildcard = names.remove(WILDCARD) || subscribe.is_empty();
    (names, wildcard, changed)
}

// === impl WatchedResource ===

impl WatchedResource {
    /// Initializes a subscription from the first request for a type on a stream.
    ///
    /// When `track_names` is false, wildcard subscriptions do not record resource names.
    pub fn new<'a>(
        type_url: impl Into<TypeUrl>,
        subscribe: &[String],
        unsubscribe: &[String],
        initial: impl IntoIterator<Item = &'a String>,
        track_names: bool,
    ) -> Self {
        let (names, wildcard, _) = delta_watched_resources(None, subscribe, unsubscribe, initial);
        let resource_names = if wildcard && !track_names {
            None
        } else {
            Some(names)
        };
        Self {
            type_url: type_url.into(),
            resource_names,
            wildcard,
            ..Default::default()
        }
    }

    /// Applies a subsequent request's subscription changes.
    ///
    /// Returns the names that were newly subscribed or dropped, and whether the subscription
    /// changed at all. While names are untracked, only changes to the wildcard subscription count;
    /// dropping the wildcard starts tracking names.
    pub fn apply_subscriptions<'a>(
        &mut self,
        subscribe: &[String],
        unsubscribe: &[String],
        initial: impl IntoIterator<Item = &'a String>,
    ) -> (ResourceDelta, bool) {
        let mut delta = ResourceDelta::default();
        let mut changed = false;

        if subscribe.iter().any(|name| name == WILDCARD) {
            changed |= !std::mem::replace(&mut self.wildcard, true);
        }
        if unsubscribe.iter().any(|name| name == WILDCARD) {
            changed |= std::mem::replace(&mut self.wildcard, false);
        }
        if !self.wildcard && self.resource_names.is_none() {
            self.resource_names = Some(HashSet::default());
        }
        let Some(names) = self.resource_names.as_mut() else {
            return (delta, changed);
        };

        for name in subscribe.iter().filter(|name| *name != WILDCARD) {
            if names.insert(name.clone()) {
                delta.subscribed.insert(name.clone());
                changed = true;
            }
        }
        for name in initial {
            changed |= names.insert(name.clone());
        }
        for name in unsubscribe.iter().filter(|name| *name != WILDCARD) {
            if names.remove(name) {
                delta.unsubscribed.insert(name.clone());
                changed = true;
            }
        }

        (delta, changed)
    }

    /// Iterates over the tracked names, if any.
    pub fn tracked_names(&self) -> impl Iterator<Item = &String> + '_ {
        self.resource_names.iter().flatten()
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.resource_names
            .as_ref()
            .is_some_and(|names| names.contains(name))
    }

    /// Records a response that was sent successfully.
    ///
    /// Removed names are only forgotten by wildcard subscriptions. A named subscription keeps its
    /// names until the client unsubscribes, so that resources created again are still sent.
    pub fn record_sent<'a>(
        &mut self,
        nonce: impl Into<String>,
        added: impl IntoIterator<Item = &'a String>,
        removed: impl IntoIterator<Item = &'a String>,
    ) {
        self.nonce_sent = nonce.into();
        self.last_send_time = Some(Instant::now());
        if let Some(names) = self.resource_names.as_mut() {
            names.extend(added.into_iter().cloned());
            if self.wildcard {
                for name in removed {
                    names.remove(name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_NAMES: &[String] = &[];

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sorted<'a>(names: impl IntoIterator<Item = &'a String>) -> Vec<&'a str> {
        let mut names = names.into_iter().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    #[test]
    fn empty_subscription_is_wildcard() {
        let w = WatchedResource::new("t", &[], &[], NO_NAMES, true);
        assert!(w.wildcard);
        assert_eq!(w.resource_names, Some(HashSet::default()));
    }

    #[test]
    fn explicit_wildcard() {
        let (names, wildcard, changed) =
            delta_watched_resources(None, &strings(&["*", "a"]), &[], NO_NAMES);
        assert!(wildcard);
        assert!(changed);
        assert_eq!(sorted(&names), vec!["a"]);
    }

    #[test]
    fn named_subscription_is_not_wildcard() {
        let w = WatchedResource::new("t", &strings(&["a", "b"]), &[], NO_NAMES, true);
        assert!(!w.wildcard);
        assert_eq!(sorted(w.tracked_names()), vec!["a", "b"]);
    }

    #[test]
    fn subscribe_and_unsubscribe_wildcard_starts_empty() {
        let w = WatchedResource::new("t", &strings(&["*"]), &strings(&["*"]), NO_NAMES, true);
        assert!(!w.wildcard);
        assert_eq!(w.tracked_names().count(), 0);
    }

    #[test]
    fn initial_versions_are_tracked() {
        let initial = strings(&["x", "y"]);
        let w = WatchedResource::new("t", &[], &[], &initial, true);
        assert!(w.wildcard);
        assert_eq!(sorted(w.tracked_names()), vec!["x", "y"]);
    }

    #[test]
    fn untracked_wildcard() {
        let w = WatchedResource::new("t", &[], &[], NO_NAMES, false);
        assert!(w.wildcard);
        assert_eq!(w.resource_names, None);

        // Named subscriptions are always tracked.
        let w = WatchedResource::new("t", &strings(&["a"]), &[], NO_NAMES, false);
        assert_eq!(sorted(w.tracked_names()), vec!["a"]);
    }

    #[test]
    fn apply_subscriptions_reports_changes() {
        let mut w = WatchedResource::new("t", &strings(&["a"]), &[], NO_NAMES, true);

        let (delta, changed) = w.apply_subscriptions(&strings(&["a"]), &[], NO_NAMES);
        assert!(!changed, "resubscribing is not a change");
        assert!(delta.is_empty());

        let (delta, changed) =
            w.apply_subscriptions(&strings(&["b"]), &strings(&["a", "z"]), NO_NAMES);
        assert!(changed);
        assert_eq!(sorted(&delta.subscribed), vec!["b"]);
        assert_eq!(
            sorted(&delta.unsubscribed),
            vec!["a"],
            "only tracked names are reported as unsubscribed"
        );
        assert_eq!(sorted(w.tracked_names()), vec!["b"]);
    }

    #[test]
    fn apply_subscriptions_toggles_wildcard() {
        let mut w = WatchedResource::new("t", &strings(&["a"]), &[], NO_NAMES, true);
        assert!(!w.wildcard);

        let (delta, changed) = w.apply_subscriptions(&strings(&["*"]), &[], NO_NAMES);
        assert!(changed);
        assert!(delta.is_empty());
        assert!(w.wildcard);

        let (_, changed) = w.apply_subscriptions(&strings(&["*"]), &[], NO_NAMES);
        assert!(!changed);

        let (_, changed) = w.apply_subscriptions(&[], &strings(&["*"]), NO_NAMES);
        assert!(changed);
        assert!(!w.wildcard);
    }

    #[test]
    fn record_sent_updates_held_names() {
        let held = strings(&["a", "b"]);
        let mut w = WatchedResource::new("t", &[], &[], &held, true);
        let added = strings(&["c"]);
        let removed = strings(&["b"]);
        w.record_sent("n1", &added, &removed);
        assert_eq!(w.nonce_sent, "n1");
        assert!(w.last_send_time.is_some());
        assert_eq!(sorted(w.tracked_names()), vec!["a", "c"]);

        let mut untracked = WatchedResource::new("t", &[], &[], NO_NAMES, false);
        untracked.record_sent("n2", &added, &removed);
        assert_eq!(untracked.nonce_sent, "n2");
        assert_eq!(untracked.resource_names, None);
    }

    #[test]
    fn removed_names_stay_subscribed() {
        let mut w = WatchedResource::new("t", &strings(&["a", "b"]), &[], NO_NAMES, true);
        w.record_sent("n1", NO_NAMES, &strings(&["b"]));
        assert_eq!(sorted(w.tracked_names()), vec!["a", "b"]);
        assert!(w.is_tracked("b"));

        let (delta, changed) = w.apply_subscriptions(&[], &strings(&["b"]), NO_NAMES);
        assert!(changed);
        assert_eq!(sorted(&delta.unsubscribed), vec!["b"]);
        assert_eq!(sorted(w.tracked_names()), vec!["a"]);
    }

    #[test]
    fn untracked_wildcard_ignores_named_subscriptions() {
        let mut w = WatchedResource::new("t", &[], &[], NO_NAMES, false);
        for _ in 0..2 {
            let (delta, changed) = w.apply_subscriptions(&strings(&["a"]), &[], NO_NAMES);
            assert!(!changed);
            assert!(delta.is_empty());
        }
        assert_eq!(w.resource_names, None);

        // Dropping the wildcard starts tracking the names subscribed alongside it.
        let (delta, changed) = w.apply_subscriptions(&strings(&["a"]), &strings(&["*"]), NO_NAMES);
        assert!(changed);
        assert!(!w.wildcard);
        assert_eq!(sorted(&delta.subscribed), vec!["a"]);
        assert_eq!(sorted(w.tracked_names()), vec!["a"]);
    }
}
