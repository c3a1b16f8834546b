use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use eels_forks::{GitResolution, Resolution, ResolutionTable, ResolverConfig, SameAsResolution};
use http::{HeaderValue, StatusCode};
use serde_json::{Value, json};
use url::Url;

use super::*;
use crate::config::StartupBackoff;
use crate::http::{BufferedResponse, OutboundRequest, send};
use crate::launcher::test_helpers::{FakeBehavior, TestLauncher};

struct Harness {
	dir: tempfile::TempDir,
	socket: PathBuf,
	launcher: TestLauncher,
	daemon: Arc<Daemon>,
	shutdown: CancellationToken,
	server: tokio::task::JoinHandle<std::io::Result<()>>,
}

fn settings(dir: &Path) -> DaemonSettings {
	DaemonSettings {
		runtime_dir: Some(dir.join("run")),
		shutdown_grace: Duration::from_millis(200),
		startup: StartupBackoff {
			initial: Duration::from_millis(5),
			ceiling: Duration::from_millis(320),
			..StartupBackoff::default()
		},
		..DaemonSettings::default()
	}
}

async fn start(settings_for: impl FnOnce(&Path) -> DaemonSettings, behavior: FakeBehavior) -> Harness {
	let dir = tempfile::tempdir().unwrap();
	let url = Url::parse("https://example.com/specs.git").unwrap();
	let table = ResolutionTable::from_rules([
		(
			"EELSMaster".to_string(),
			Resolution::Git(GitResolution::branch(url, "master").pinned("feedface")),
		),
		(
			"Cancun".to_string(),
			Resolution::SameAs(SameAsResolution {
				same_as: "EELSMaster".into(),
			}),
		),
	]);
	let resolver = Arc::new(Resolver::new(Arc::new(table), ResolverConfig::new(dir.path().join("cache"))));
	let launcher = TestLauncher::with_behavior(behavior);
	let daemon = Daemon::new(resolver, Arc::new(launcher.clone()), settings_for(dir.path()));

	let socket = dir.path().join("master.sock");
	let shutdown = CancellationToken::new();
	let server = tokio::spawn(serve(socket.clone(), daemon.clone(), shutdown.clone()));
	for _ in 0..200 {
		if socket.exists() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}

	Harness {
		dir,
		socket,
		launcher,
		daemon,
		shutdown,
		server,
	}
}

impl Harness {
	async fn post(&self, body: Value) -> BufferedResponse {
		let request = OutboundRequest {
			method: Method::POST,
			path: "/".into(),
			content_type: Some(HeaderValue::from_static("application/json")),
			body: Bytes::from(body.to_string()),
		};
		send(&self.socket, request, Duration::from_secs(5), Duration::from_secs(10))
			.await
			.unwrap()
	}

	async fn stop(self) {
		self.shutdown.cancel();
		self.server.await.unwrap().unwrap();
		assert!(!self.socket.exists());
		drop(self.dir);
	}
}

fn json_of(response: &BufferedResponse) -> Value {
	serde_json::from_slice(&response.body).unwrap()
}

#[tokio::test]
async fn relays_through_the_master_socket_with_provenance() {
	let harness = start(settings, FakeBehavior::default()).await;

	let response = harness.post(json!({ "state": { "fork": "Cancun" }, "alloc": {} })).await;
	assert_eq!(response.status, StatusCode::OK);
	let body = json_of(&response);
	assert_eq!(body["fork"], "Cancun");
	assert_eq!(body["request"]["alloc"], json!({}));
	assert_eq!(body["_info_metadata"]["eels-resolution"]["commit"], "feedface");
	assert_eq!(body["_info_metadata"]["eels-resolution"]["branch"], "master");

	harness.stop().await;
}

#[tokio::test]
async fn missing_fork_is_rejected_without_spawning() {
	let harness = start(settings, FakeBehavior::default()).await;

	let response = harness.post(json!({ "alloc": {} })).await;
	assert_eq!(response.status, StatusCode::BAD_REQUEST);
	assert!(json_of(&response)["error"].as_str().unwrap().contains("state.fork"));

	let response = harness.post(json!({ "state": { "fork": "Atlantis" } })).await;
	assert_eq!(response.status, StatusCode::BAD_REQUEST);
	assert_eq!(harness.launcher.total(), 0);

	harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_worker() {
	let harness = Arc::new(
		start(
			settings,
			FakeBehavior {
				startup_delay: Duration::from_millis(50),
				..FakeBehavior::default()
			},
		)
		.await,
	);

	let requests: Vec<_> = (0..6)
		.map(|i| {
			let harness = harness.clone();
			tokio::spawn(async move { harness.post(json!({ "state": { "fork": "Cancun" }, "n": i })).await })
		})
		.collect();
	for request in requests {
		let response = request.await.unwrap();
		assert_eq!(response.status, StatusCode::OK);
	}

	assert_eq!(harness.launcher.launches("Cancun"), 1);
	assert_eq!(harness.daemon.supervisor().worker_count(), 1);

	let Ok(harness) = Arc::try_unwrap(harness) else {
		panic!("harness still shared");
	};
	harness.stop().await;
}

#[tokio::test]
async fn liveness_probe_on_master_is_not_implemented() {
	let harness = start(settings, FakeBehavior::default()).await;

	let response = send(
		&harness.socket,
		OutboundRequest::get("/heartbeat/"),
		Duration::from_secs(5),
		Duration::from_secs(5),
	)
	.await
	.unwrap();
	assert_eq!(response.status, StatusCode::NOT_IMPLEMENTED);
	assert_eq!(response.content_type.unwrap(), "application/json");

	harness.stop().await;
}

#[tokio::test]
async fn idle_daemon_shuts_down_and_stops_workers() {
	let harness = start(
		|dir| DaemonSettings {
			idle_timeout: Duration::from_millis(300),
			idle_check_interval: Duration::from_millis(50),
			..settings(dir)
		},
		FakeBehavior::default(),
	)
	.await;

	let response = harness.post(json!({ "state": { "fork": "EELSMaster" } })).await;
	assert_eq!(response.status, StatusCode::OK);
	let worker_socket = harness.daemon.supervisor().socket_path("EELSMaster");
	assert!(worker_socket.exists());

	let Harness {
		dir,
		socket,
		daemon,
		shutdown,
		server,
		..
	} = harness;
	tokio::time::timeout(Duration::from_secs(5), server)
		.await
		.expect("daemon did not shut down when idle")
		.unwrap()
		.unwrap();

	assert!(shutdown.is_cancelled());
	assert_eq!(daemon.supervisor().worker_count(), 0);
	assert!(!worker_socket.exists());
	assert!(!socket.exists());
	drop(dir);
}

#[tokio::test]
async fn stale_master_socket_is_replaced() {
	let dir = tempfile::tempdir().unwrap();
	let socket = dir.path().join("master.sock");
	std::fs::write(&socket, b"stale").unwrap();

	let resolver = Arc::new(Resolver::new(
		Arc::new(ResolutionTable::default()),
		ResolverConfig::new(dir.path().join("cache")),
	));
	let daemon = Daemon::new(resolver, Arc::new(TestLauncher::new()), settings(dir.path()));
	let shutdown = CancellationToken::new();
	let server = tokio::spawn(serve(socket.clone(), daemon, shutdown.clone()));

	let mut answered = false;
	for _ in 0..200 {
		if let Ok(response) = send(&socket, OutboundRequest::get("/"), Duration::from_millis(100), Duration::from_secs(1)).await {
			assert_eq!(response.status, StatusCode::NOT_IMPLEMENTED);
			answered = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	assert!(answered);

	shutdown.cancel();
	server.await.unwrap().unwrap();
}
