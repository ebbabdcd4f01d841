use super::*;
use delta_xds_controller_core::Proxy;
use tokio::{
    sync::Semaphore,
    time::{self, Duration},
};
use tokio_test::{assert_pending, assert_ready, task};

const TYPE: &str = "type.googleapis.com/test.Resource";

fn connection(node: &str) -> Arc<Connection> {
    let (con, _push_rx) = Connection::new(Arc::new(Proxy::new(node, None)), None, None);
    con
}

fn updated(name: &str) -> PushRequest {
    PushRequest::updated(TYPE, [name.to_string()])
}

fn names(req: &PushRequest) -> Vec<&str> {
    let mut names = req
        .updated_names(TYPE)
        .map(|names| names.iter().map(String::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    names.sort_unstable();
    names
}

#[tokio::test]
async fn merges_pending_pushes() {
    let queue = PushQueue::default();
    let a = connection("a");

    queue.enqueue(&a, updated("x"));
    queue.enqueue(&a, updated("y"));
    assert_eq!(queue.pending(), 1, "a connection has at most one pending push");

    let (con, req) = queue.dequeue().await.expect("push must be pending");
    assert_eq!(con.id(), a.id());
    assert_eq!(names(&req), vec!["x", "y"]);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn holds_pushes_while_in_flight() {
    let queue = PushQueue::default();
    let a = connection("a");

    queue.enqueue(&a, updated("x"));
    let (_, first) = queue.dequeue().await.unwrap();
    assert_eq!(names(&first), vec!["x"]);

    // Pushes enqueued while a push is in flight are merged and held.
    queue.enqueue(&a, updated("y"));
    queue.enqueue(&a, updated("z"));
    assert_eq!(queue.pending(), 0);
    {
        let mut dequeue = task::spawn(queue.dequeue());
        assert_pending!(dequeue.poll());
    }

    queue.mark_done(a.id());
    assert_eq!(queue.pending(), 1);
    let (con, second) = queue.dequeue().await.unwrap();
    assert_eq!(con.id(), a.id());
    assert_eq!(names(&second), vec!["y", "z"]);

    // Nothing was merged during the second push.
    queue.mark_done(a.id());
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn dequeues_connections_in_order() {
    let queue = PushQueue::default();
    let a = connection("a");
    let b = connection("b");

    queue.enqueue(&b, updated("x"));
    queue.enqueue(&a, updated("x"));
    queue.enqueue(&b, updated("y"));

    let (first, _) = queue.dequeue().await.unwrap();
    let (second, _) = queue.dequeue().await.unwrap();
    assert_eq!(first.id(), b.id());
    assert_eq!(second.id(), a.id());
}

#[tokio::test]
async fn wakes_waiting_dequeue() {
    let queue = PushQueue::default();
    let a = connection("a");

    let mut dequeue = task::spawn(queue.dequeue());
    assert_pending!(dequeue.poll());

    queue.enqueue(&a, updated("x"));
    assert!(dequeue.is_woken());
    let (con, _) = assert_ready!(dequeue.poll()).expect("push must be pending");
    assert_eq!(con.id(), a.id());
}

#[tokio::test]
async fn removes_closed_connections() {
    let queue = PushQueue::default();
    let a = connection("a");
    let b = connection("b");

    queue.enqueue(&a, updated("x"));
    queue.enqueue(&b, updated("x"));
    queue.remove(a.id());
    assert_eq!(queue.pending(), 1);

    let (con, _) = queue.dequeue().await.unwrap();
    assert_eq!(con.id(), b.id());

    // Pushes merged into a removed connection's in-flight push are dropped.
    queue.enqueue(&b, updated("y"));
    queue.remove(b.id());
    queue.mark_done(b.id());
    assert_eq!(queue.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_dequeue() {
    let queue = Arc::new(PushQueue::default());
    let dequeue = tokio::spawn({
        let queue = queue.clone();
        async move { queue.dequeue().await.map(|(con, _)| con.id().to_string()) }
    });

    time::sleep(Duration::from_millis(10)).await;
    queue.shutdown();
    assert_eq!(dequeue.await.unwrap(), None);

    queue.enqueue(&connection("a"), updated("x"));
    assert_eq!(queue.pending(), 0, "enqueue is a no-op after shutdown");
}

#[tokio::test]
async fn dropping_push_done_requeues_and_releases_permit() {
    let queue = Arc::new(PushQueue::default());
    let permits = Arc::new(Semaphore::new(1));
    let a = connection("a");

    queue.enqueue(&a, updated("x"));
    let (con, _) = queue.dequeue().await.unwrap();
    let permit = permits.clone().try_acquire_owned().unwrap();
    let done = PushDone::new(queue.clone(), con.id(), Some(permit));

    queue.enqueue(&a, updated("y"));
    assert_eq!(permits.available_permits(), 0);
    assert_eq!(queue.pending(), 0);

    drop(done);
    assert_eq!(permits.available_permits(), 1);
    assert_eq!(queue.pending(), 1);
    let (_, req) = queue.dequeue().await.unwrap();
    assert_eq!(names(&req), vec!["y"]);
}
