//! End-to-end scheduling behavior: ranking, draining, health recovery and
//! request timeouts, driven through the public distributor surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use browsergrid::config::{GridConfig, Secret};
use browsergrid::data::{Capabilities, NewSessionPayload, Session};
use browsergrid::distributor::{Distributor, NewSessionError};
use browsergrid::events::LocalEventBus;
use browsergrid::node::{
    FailingSessionFactory, HealthReport, LocalNode, Node, SettableHealthCheck, TestSessionFactory,
};
use browsergrid::queue::SessionRequestQueue;
use browsergrid::sessionmap::SessionMap;

const SECRET: &str = "cheddar";

struct Grid {
    bus: Arc<LocalEventBus>,
    queue: Arc<SessionRequestQueue>,
    distributor: Arc<Distributor>,
}

fn grid_with(config: GridConfig) -> Grid {
    let bus = LocalEventBus::new();
    let sessions = SessionMap::new(bus.clone());
    let queue = SessionRequestQueue::new(bus.clone(), config.retry_interval);
    let distributor = Distributor::new(bus.clone(), sessions, Arc::clone(&queue), config);
    Grid {
        bus,
        queue,
        distributor,
    }
}

fn grid() -> Grid {
    grid_with(
        GridConfig::new()
            .with_request_timeout(Duration::from_millis(500))
            .with_retry_interval(Duration::from_millis(50))
            .with_health_check_interval(Duration::from_millis(50))
            .with_registration_secret(Secret::new(SECRET)),
    )
}

fn chrome() -> Capabilities {
    Capabilities::new().with("browserName", "chrome")
}

fn firefox() -> Capabilities {
    Capabilities::new().with("browserName", "firefox")
}

fn edge() -> Capabilities {
    Capabilities::new().with("browserName", "MicrosoftEdge")
}

fn node(grid: &Grid, uri: &str, stereotypes: &[Capabilities]) -> Arc<LocalNode> {
    let mut builder = LocalNode::builder(grid.bus.clone(), uri, Secret::new(SECRET));
    for stereotype in stereotypes {
        builder = builder.add_slot(stereotype.clone(), Arc::new(TestSessionFactory::new(uri)));
    }
    builder.build()
}

async fn create_session(grid: &Grid, capabilities: Capabilities) -> Session {
    grid.distributor
        .new_session(&NewSessionPayload::single(capabilities))
        .await
        .expect("session should be created")
        .session
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting until {what}");
}

#[tokio::test]
async fn lightest_loaded_node_wins() {
    let grid = grid();

    let uris = [
        "http://idle:5555",
        "http://light:5555",
        "http://medium:5555",
        "http://heavy:5555",
    ];
    let preload = [0usize, 4, 6, 8];

    for (uri, load) in uris.into_iter().zip(preload) {
        let stereotypes: Vec<Capabilities> = (0..10).map(|_| chrome()).collect();
        let n = node(&grid, uri, &stereotypes);
        for _ in 0..load {
            n.new_session(&chrome()).await.unwrap();
        }
        grid.distributor.add(n).unwrap();
    }

    let session = create_session(&grid, chrome()).await;
    assert_eq!(session.uri, "http://idle:5555");
}

#[tokio::test]
async fn all_ties_fall_back_to_registration_order() {
    let grid = grid();

    for uri in ["http://a:5555", "http://b:5555", "http://c:5555"] {
        let stereotypes: Vec<Capabilities> = (0..5).map(|_| chrome()).collect();
        grid.distributor.add(node(&grid, uri, &stereotypes)).unwrap();
    }

    let first = create_session(&grid, chrome()).await;
    let second = create_session(&grid, chrome()).await;
    let third = create_session(&grid, chrome()).await;

    assert_eq!(first.uri, "http://a:5555");
    assert_eq!(second.uri, "http://b:5555");
    assert_eq!(third.uri, "http://c:5555");
}

#[tokio::test]
async fn common_browsers_avoid_the_versatile_nodes() {
    let grid = grid();

    let versatile_uris: Vec<String> =
        (0..3).map(|i| format!("http://edge-{i}:5555")).collect();
    let duo_uris: Vec<String> = (0..5).map(|i| format!("http://duo-{i}:5555")).collect();
    let firefox_uris: Vec<String> = (0..3).map(|i| format!("http://ff-{i}:5555")).collect();

    for uri in &versatile_uris {
        grid.distributor
            .add(node(&grid, uri, &[edge(), chrome(), firefox()]))
            .unwrap();
    }
    for uri in &duo_uris {
        grid.distributor
            .add(node(&grid, uri, &[chrome(), firefox()]))
            .unwrap();
    }
    for uri in &firefox_uris {
        grid.distributor.add(node(&grid, uri, &[firefox()])).unwrap();
    }

    let mut chrome_uris = Vec::new();
    for _ in 0..5 {
        chrome_uris.push(create_session(&grid, chrome()).await.uri);
    }
    let mut firefox_placed = Vec::new();
    for _ in 0..5 {
        firefox_placed.push(create_session(&grid, firefox()).await.uri);
    }

    // Every chrome session landed on a two-browser node; the versatile
    // nodes kept their slots for the browser only they can serve.
    for uri in &chrome_uris {
        assert!(
            duo_uris.contains(uri),
            "chrome session landed on {uri} while a narrower node was free"
        );
    }

    // Firefox filled the single-browser nodes first and only overflowed
    // onto the versatile nodes once those were full.
    for uri in &firefox_placed[..3] {
        assert!(
            firefox_uris.contains(uri),
            "firefox session landed on {uri} while a firefox-only node was free"
        );
    }
    for uri in &firefox_placed[3..] {
        assert!(
            versatile_uris.contains(uri),
            "firefox overflow landed on {uri}, expected a versatile node"
        );
    }

    let session = create_session(&grid, edge()).await;
    assert!(
        versatile_uris.contains(&session.uri),
        "edge session landed on {}",
        session.uri
    );
}

#[tokio::test]
async fn drained_node_lingers_until_its_sessions_stop() {
    let grid = grid();
    let n = node(&grid, "http://a:5555", &[chrome(), chrome()]);
    let node_id = n.id();
    grid.distributor.add(n.clone()).unwrap();

    let first = create_session(&grid, chrome()).await;
    let second = create_session(&grid, chrome()).await;

    grid.distributor.drain(node_id).unwrap();
    assert!(grid.distributor.available_nodes().is_empty());
    assert_eq!(grid.distributor.status().nodes.len(), 1);

    n.stop(first.id).await.unwrap();
    // One session still active: the node must stay registered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(grid.distributor.status().nodes.len(), 1);

    n.stop(second.id).await.unwrap();
    let distributor = Arc::clone(&grid.distributor);
    wait_until("the drained node is unregistered", move || {
        distributor.status().nodes.is_empty()
    })
    .await;
    assert!(grid.distributor.available_nodes().is_empty());
}

#[tokio::test]
async fn node_recovers_after_health_flips_up() {
    let grid = grid();
    let health = SettableHealthCheck::new(HealthReport::down("unplugged"));
    let n = LocalNode::builder(grid.bus.clone(), "http://a:5555", Secret::new(SECRET))
        .add_slot(chrome(), Arc::new(TestSessionFactory::new("http://a:5555")))
        .with_health_check(health.clone())
        .build();
    grid.distributor.add(n).unwrap();
    grid.distributor.refresh().await;

    let result = grid
        .distributor
        .new_session(&NewSessionPayload::single(chrome()))
        .await;
    assert_eq!(result.unwrap_err(), NewSessionError::Timeout);

    health.set(HealthReport::up("plugged back in"));
    grid.distributor.refresh().await;

    let session = create_session(&grid, chrome()).await;
    assert_eq!(session.uri, "http://a:5555");
}

#[tokio::test]
async fn empty_grid_times_out_and_leaves_the_queue_clean() {
    let grid = grid_with(
        GridConfig::new()
            .with_request_timeout(Duration::from_secs(2))
            .with_retry_interval(Duration::from_millis(100))
            .with_health_check_interval(Duration::from_millis(100))
            .with_registration_secret(Secret::new(SECRET)),
    );

    let started = Instant::now();
    let result = grid
        .distributor
        .new_session(&NewSessionPayload::single(chrome()))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.unwrap_err(), NewSessionError::Timeout);
    assert!(
        elapsed >= Duration::from_millis(1900) && elapsed < Duration::from_secs(4),
        "timed out after {elapsed:?}, expected about 2s"
    );
    assert!(grid.queue.is_empty());
}

#[tokio::test]
async fn factory_failure_keeps_capacity_available() {
    let grid = grid();
    let n = LocalNode::builder(grid.bus.clone(), "http://a:5555", Secret::new(SECRET))
        .add_slot(chrome(), Arc::new(FailingSessionFactory::new("boom")))
        .build();
    grid.distributor.add(n).unwrap();

    let result = grid
        .distributor
        .new_session(&NewSessionPayload::single(chrome()))
        .await;
    assert!(
        matches!(
            &result,
            Err(NewSessionError::Timeout) | Err(NewSessionError::FactoryFailed(_))
        ),
        "unexpected result: {result:?}"
    );

    // The slot was released on every failed attempt.
    assert!(grid.distributor.status().has_capacity);
}

#[tokio::test]
async fn clearing_the_queue_cancels_waiting_callers() {
    let grid = grid_with(
        GridConfig::new()
            .with_request_timeout(Duration::from_secs(10))
            .with_retry_interval(Duration::from_millis(50))
            .with_health_check_interval(Duration::from_millis(50))
            .with_registration_secret(Secret::new(SECRET)),
    );

    let distributor = Arc::clone(&grid.distributor);
    let waiter = tokio::spawn(async move {
        distributor
            .new_session(&NewSessionPayload::single(chrome()))
            .await
    });

    let queue = Arc::clone(&grid.queue);
    wait_until("the request is queued", move || !queue.is_empty()).await;
    assert_eq!(grid.queue.clear(), 1);

    let result = waiter.await.unwrap();
    assert_eq!(result.unwrap_err(), NewSessionError::Cancelled);
}

#[tokio::test]
async fn queued_requests_drain_in_arrival_order_when_capacity_returns() {
    let grid = grid_with(
        GridConfig::new()
            .with_request_timeout(Duration::from_secs(10))
            .with_retry_interval(Duration::from_millis(50))
            .with_health_check_interval(Duration::from_millis(50))
            .with_registration_secret(Secret::new(SECRET)),
    );

    let n = node(&grid, "http://a:5555", &[chrome()]);
    grid.distributor.add(n.clone()).unwrap();

    // Occupy the only slot, then queue a second request behind it.
    let first = create_session(&grid, chrome()).await;

    let distributor = Arc::clone(&grid.distributor);
    let waiter = tokio::spawn(async move {
        distributor
            .new_session(&NewSessionPayload::single(chrome()))
            .await
    });

    let queue = Arc::clone(&grid.queue);
    wait_until("the second request is queued", move || !queue.is_empty()).await;

    n.stop(first.id).await.unwrap();
    grid.distributor.refresh().await;

    let second = waiter.await.unwrap().unwrap().session;
    assert_eq!(second.uri, "http://a:5555");
}

#[tokio::test]
async fn forced_removal_leaves_sessions_in_the_map() {
    let grid = grid();
    let n = node(&grid, "http://a:5555", &[chrome()]);
    let node_id = n.id();
    grid.distributor.add(n).unwrap();

    let session = create_session(&grid, chrome()).await;
    grid.distributor.remove(node_id).unwrap();

    // The registration is gone but the session descriptor survives until
    // an explicit close.
    assert!(grid.distributor.status().nodes.is_empty());
    assert_eq!(
        grid.distributor.session_map().get(session.id).unwrap().id,
        session.id
    );
}
