use super::*;
use maplit::hashset;
use prometheus_client::registry::Registry;

const TYPE: &str = "type.googleapis.com/test.Route";

#[derive(Clone, Debug)]
struct Route {
    gateway: &'static str,
    name: &'static str,
    backend: &'static str,
}

impl IntoResource for Route {
    fn resource_name(&self) -> String {
        self.name.to_string()
    }

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.backend.as_bytes())
    }
}

fn route(gateway: &'static str, name: &'static str, backend: &'static str) -> Route {
    Route {
        gateway,
        name,
        backend,
    }
}

fn scoped() -> Collection<Route> {
    Collection::scoped(TYPE, |r: &Route| Some(Scope::new("default", r.gateway)))
}

fn changed(rx: &mut mpsc::UnboundedReceiver<PushRequest>) -> std::collections::HashSet<String> {
    let push = rx.try_recv().expect("a push must be published");
    assert!(!push.is_request());
    push.updated_names(TYPE)
        .expect("push must name the collection's type")
        .iter()
        .cloned()
        .collect()
}

#[test]
fn publishes_changes_after_registration() {
    let routes = Collection::<Route>::new(TYPE);
    routes.apply(route("gw", "a", "svc-a"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    routes.register(tx);
    assert!(rx.try_recv().is_err(), "earlier changes are not replayed");

    routes.apply(route("gw", "b", "svc-b"));
    assert_eq!(changed(&mut rx), hashset! {"b".to_string()});

    // Reapplying an identical object is not a change.
    routes.apply(route("gw", "b", "svc-b"));
    assert!(rx.try_recv().is_err());

    routes.apply(route("gw", "b", "svc-c"));
    assert_eq!(changed(&mut rx), hashset! {"b".to_string()});
    assert_eq!(routes.get(None, "b").unwrap().value, "svc-c");

    assert!(routes.delete("a"));
    assert_eq!(changed(&mut rx), hashset! {"a".to_string()});
    assert!(!routes.delete("a"));
    assert!(rx.try_recv().is_err());
    assert_eq!(routes.len(), 1);
}

#[test]
fn reset_publishes_one_batch() {
    let routes = Collection::<Route>::new(TYPE);
    let (tx, mut rx) = mpsc::unbounded_channel();
    routes.register(tx);

    routes.reset(vec![route("gw", "a", "1"), route("gw", "b", "1")]);
    assert_eq!(
        changed(&mut rx),
        hashset! {"a".to_string(), "b".to_string()}
    );

    routes.reset(vec![
        route("gw", "a", "1"),
        route("gw", "b", "2"),
        route("gw", "c", "1"),
    ]);
    assert_eq!(
        changed(&mut rx),
        hashset! {"b".to_string(), "c".to_string()}
    );

    routes.reset(vec![route("gw", "c", "1")]);
    assert_eq!(
        changed(&mut rx),
        hashset! {"a".to_string(), "b".to_string()}
    );
    assert!(rx.try_recv().is_err());

    routes.reset(vec![route("gw", "c", "1")]);
    assert!(rx.try_recv().is_err(), "an identical snapshot is not a change");
}

#[test]
fn scoped_reads_are_filtered() {
    let routes = scoped();
    routes.apply(route("gw-1", "a", "one"));
    routes.apply(route("gw-2", "a", "two"));
    routes.apply(route("gw-2", "b", "two"));

    let gw1 = Scope::new("default", "gw-1");
    let gw2 = Scope::new("default", "gw-2");

    assert_eq!(routes.get(Some(&gw1), "a").unwrap().value, "one");
    assert_eq!(routes.get(Some(&gw2), "a").unwrap().value, "two");
    assert!(routes.get(Some(&gw1), "b").is_none());
    assert!(routes.get(None, "a").is_none());

    let mut names = routes
        .list(Some(&gw2))
        .into_iter()
        .map(|r| r.name)
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert!(routes.list(None).is_empty());

    assert!(routes.delete("default/gw-2/a"));
    assert!(routes.get(Some(&gw2), "a").is_none());
    assert!(routes.get(Some(&gw1), "a").is_some());
}

#[test]
fn unscoped_resources_are_visible_to_every_scope() {
    let routes = Collection::<Route>::new(TYPE);
    routes.apply(route("gw", "a", "svc"));
    let gw = Scope::new("default", "gw");
    assert!(routes.get(Some(&gw), "a").is_some());
    assert_eq!(routes.list(Some(&gw)).len(), 1);
    assert_eq!(routes.list(None).len(), 1);
}

#[test]
fn scoped_collections_hold_shared_resources() {
    let routes = Collection::scoped(TYPE, |r: &Route| {
        (!r.gateway.is_empty()).then(|| Scope::new("default", r.gateway))
    });
    routes.apply(route("", "shared", "svc"));
    routes.apply(route("gw", "own", "svc"));

    let gw = Scope::new("default", "gw");
    assert!(routes.get(None, "shared").is_some());
    assert!(routes.get(Some(&gw), "shared").is_some());
    assert!(routes.get(None, "own").is_none());
    assert_eq!(routes.list(Some(&gw)).len(), 2);
    assert_eq!(routes.list(None).len(), 1);
}

#[test]
fn serves_generators() {
    let routes = Collection::<Route>::new(TYPE);
    routes.apply(route("gw", "a", "svc"));
    let discover: Arc<dyn DiscoverResources> = Arc::new(routes.clone());
    assert_eq!(discover.list(None).len(), 1);

    // Clones share the same index.
    routes.apply(route("gw", "b", "svc"));
    assert!(discover.get(None, "b").is_some());
}

#[test]
fn records_metrics() {
    let mut prom = Registry::default();
    let routes =
        Collection::<Route>::new(TYPE).with_metrics(IndexMetrics::register(&mut prom));
    routes.apply(route("gw", "a", "1"));
    routes.apply(route("gw", "b", "1"));
    routes.delete("a");
    routes.reset(vec![]);

    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &prom).unwrap();
    assert!(
        text.contains(&format!("index_applies_total{{type_url=\"{TYPE}\"}} 2")),
        "{text}"
    );
    assert!(
        text.contains(&format!("index_deletes_total{{type_url=\"{TYPE}\"}} 1")),
        "{text}"
    );
    assert!(
        text.contains(&format!("index_size{{type_url=\"{TYPE}\"}} 0")),
        "{text}"
    );
}
