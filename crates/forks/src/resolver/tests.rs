use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use url::Url;

use super::*;
use crate::resolution::{LocalResolution, Resolution, SameAsResolution};
use crate::{ConfigError, ResolutionTable};

/// Remote that serves whatever commit `head` currently names.
#[derive(Default)]
struct FakeSource {
	head: Mutex<String>,
	fail_fetch: AtomicBool,
	fail_remote: AtomicBool,
	fetches: AtomicUsize,
	remote_checks: AtomicUsize,
}

impl FakeSource {
	fn at(head: &str) -> Arc<Self> {
		let source = Self::default();
		*source.head.lock().unwrap() = head.to_string();
		Arc::new(source)
	}

	fn advance(&self, head: &str) {
		*self.head.lock().unwrap() = head.to_string();
	}

	fn fetches(&self) -> usize {
		self.fetches.load(Ordering::SeqCst)
	}

	fn remote_checks(&self) -> usize {
		self.remote_checks.load(Ordering::SeqCst)
	}
}

impl SnapshotSource for FakeSource {
	fn remote_head(&self, rule: &GitResolution) -> Result<String, ResolveError> {
		self.remote_checks.fetch_add(1, Ordering::SeqCst);
		if self.fail_remote.load(Ordering::SeqCst) {
			return Err(ResolveError::Git {
				operation: "ls-remote",
				url: rule.git_url.to_string(),
				message: "could not resolve host".into(),
			});
		}
		Ok(self.head.lock().unwrap().clone())
	}

	fn fetch(&self, rule: &GitResolution, dest: &Path) -> Result<String, ResolveError> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		std::fs::create_dir_all(dest.join("src")).unwrap();
		if self.fail_fetch.load(Ordering::SeqCst) {
			return Err(ResolveError::Git {
				operation: "clone",
				url: rule.git_url.to_string(),
				message: "connection refused".into(),
			});
		}
		std::fs::create_dir_all(dest.join(".git")).unwrap();
		let head = rule.commit.clone().unwrap_or_else(|| self.head.lock().unwrap().clone());
		std::fs::write(dest.join("HEAD_COMMIT"), &head).unwrap();
		Ok(head)
	}
}

fn url() -> Url {
	Url::parse("https://example.com/specs.git").unwrap()
}

fn table(rules: Vec<(&str, Resolution)>) -> Arc<ResolutionTable> {
	Arc::new(ResolutionTable::from_rules(
		rules.into_iter().map(|(name, rule)| (name.to_string(), rule)),
	))
}

fn resolver(root: &Path, table: Arc<ResolutionTable>, source: Arc<FakeSource>) -> Resolver {
	Resolver::with_source(table, ResolverConfig::new(root), source)
}

fn checked_out(path: &Path) -> String {
	std::fs::read_to_string(path.join("HEAD_COMMIT")).unwrap()
}

#[test]
fn pinned_rule_is_fetched_once() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("unused");
	let rules = table(vec![("Prague", Resolution::Git(GitResolution::branch(url(), "forks/prague").pinned("c0ffee")))]);
	let resolver = resolver(cache.path(), rules, source.clone());

	let first = resolver.resolve("Prague").unwrap();
	let second = resolver.resolve("Prague").unwrap();

	assert_eq!(first, second);
	assert_eq!(first.path, cache.path().join("Prague"));
	assert_eq!(checked_out(&first.path), "c0ffee");
	assert!(!first.path.join(".git").exists());
	assert!(first.src_dir().is_dir());
	assert_eq!(source.fetches(), 1);
	assert_eq!(source.remote_checks(), 0);

	let entry = resolver.layout().read_entry("Prague").unwrap();
	assert_eq!(entry.head, "c0ffee");
}

#[test]
fn stale_branch_follows_the_remote() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master")))]);
	let config = ResolverConfig::new(cache.path()).revalidate_after(Duration::ZERO);
	let resolver = Resolver::with_source(rules, config, source.clone());

	let first = resolver.resolve("EELSMaster").unwrap();
	assert_eq!(checked_out(&first.path), "s1");

	source.advance("s2");
	let second = resolver.resolve("EELSMaster").unwrap();
	assert_eq!(checked_out(&second.path), "s2");
	assert_eq!(resolver.layout().read_entry("EELSMaster").unwrap().head, "s2");
	assert_eq!(source.fetches(), 2);
	assert_eq!(source.remote_checks(), 1);
}

#[test]
fn unchanged_remote_refreshes_the_timestamp_only() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master")))]);
	let config = ResolverConfig::new(cache.path()).revalidate_after(Duration::ZERO);
	let resolver = Resolver::with_source(rules, config, source.clone());

	resolver.resolve("EELSMaster").unwrap();
	let before = resolver.layout().read_entry("EELSMaster").unwrap().timestamp;
	resolver.resolve("EELSMaster").unwrap();
	let after = resolver.layout().read_entry("EELSMaster").unwrap().timestamp;

	assert_eq!(source.fetches(), 1);
	assert_eq!(source.remote_checks(), 1);
	assert!(after >= before);
}

#[test]
fn fresh_branch_skips_the_remote() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master")))]);
	let resolver = resolver(cache.path(), rules, source.clone());

	resolver.resolve("EELSMaster").unwrap();
	source.advance("s2");
	let path = resolver.resolve("EELSMaster").unwrap().path;

	assert_eq!(checked_out(&path), "s1");
	assert_eq!(source.remote_checks(), 0);
	assert_eq!(source.fetches(), 1);
}

#[test]
fn changed_rule_discards_the_snapshot() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");

	let old = resolver(
		cache.path(),
		table(vec![("Prague", Resolution::Git(GitResolution::branch(url(), "forks/prague")))]),
		source.clone(),
	);
	old.resolve("Prague").unwrap();

	let new = resolver(
		cache.path(),
		table(vec![("Prague", Resolution::Git(GitResolution::branch(url(), "forks/prague").pinned("abc")))]),
		source.clone(),
	);
	let path = new.resolve("Prague").unwrap().path;

	assert_eq!(checked_out(&path), "abc");
	assert_eq!(source.fetches(), 2);
}

#[test]
fn deleted_snapshot_is_fetched_again() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("Prague", Resolution::Git(GitResolution::branch(url(), "forks/prague").pinned("abc")))]);
	let resolver = resolver(cache.path(), rules, source.clone());

	let path = resolver.resolve("Prague").unwrap().path;
	std::fs::remove_dir_all(&path).unwrap();
	resolver.resolve("Prague").unwrap();

	assert_eq!(source.fetches(), 2);
	assert!(path.is_dir());
}

#[test]
fn failed_refresh_does_not_reuse_the_old_snapshot() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master")))]);
	let config = ResolverConfig::new(cache.path()).revalidate_after(Duration::ZERO);
	let resolver = Resolver::with_source(rules, config, source.clone());

	resolver.resolve("EELSMaster").unwrap();
	source.advance("s2");
	source.fail_fetch.store(true, Ordering::SeqCst);

	let err = resolver.resolve("EELSMaster").unwrap_err();
	assert!(matches!(err, ResolveError::Git { operation: "clone", .. }));
	assert!(resolver.layout().read_entry("EELSMaster").is_none());
	assert!(!cache.path().join("EELSMaster").exists());

	source.fail_fetch.store(false, Ordering::SeqCst);
	let path = resolver.resolve("EELSMaster").unwrap().path;
	assert_eq!(checked_out(&path), "s2");
}

#[test]
fn failed_revalidation_drops_the_old_snapshot() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master")))]);
	let config = ResolverConfig::new(cache.path()).revalidate_after(Duration::ZERO);
	let resolver = Resolver::with_source(rules, config, source.clone());

	resolver.resolve("EELSMaster").unwrap();
	source.fail_remote.store(true, Ordering::SeqCst);

	let err = resolver.resolve("EELSMaster").unwrap_err();
	assert!(matches!(err, ResolveError::Git { operation: "ls-remote", .. }));
	assert!(resolver.layout().read_entry("EELSMaster").is_none());
	assert!(!cache.path().join("EELSMaster").exists());
	assert_eq!(source.fetches(), 1);

	source.fail_remote.store(false, Ordering::SeqCst);
	resolver.resolve("EELSMaster").unwrap();
	assert_eq!(source.fetches(), 2);
}

#[test]
fn each_alias_gets_its_own_snapshot() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![
		("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master"))),
		(
			"Cancun",
			Resolution::SameAs(SameAsResolution {
				same_as: "EELSMaster".into(),
			}),
		),
		(
			"Shanghai",
			Resolution::SameAs(SameAsResolution {
				same_as: "Cancun".into(),
			}),
		),
	]);
	let config = ResolverConfig::new(cache.path()).revalidate_after(Duration::ZERO);
	let resolver = Resolver::with_source(rules, config, source.clone());

	let cancun = resolver.resolve("Cancun").unwrap();
	let shanghai = resolver.resolve("Shanghai").unwrap();

	assert_eq!(cancun.source_fork, "EELSMaster");
	assert_eq!(shanghai.source_fork, "EELSMaster");
	assert_eq!(cancun.path, cache.path().join("Cancun"));
	assert_eq!(shanghai.path, cache.path().join("Shanghai"));
	assert!(resolver.layout().read_entry("Cancun").is_some());
	assert!(resolver.layout().read_entry("EELSMaster").is_none());
	assert!(!cache.path().join("EELSMaster").exists());
	assert_eq!(source.fetches(), 2);

	// Refreshing one alias leaves the other's snapshot in place.
	source.advance("s2");
	let refreshed = resolver.resolve("Shanghai").unwrap();
	assert_eq!(checked_out(&refreshed.path), "s2");
	assert_eq!(checked_out(&cancun.path), "s1");
}

#[test]
fn local_rules_are_used_in_place() {
	let cache = tempfile::tempdir().unwrap();
	let checkout = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![
		(
			"Osaka",
			Resolution::Local(LocalResolution {
				path: checkout.path().to_path_buf(),
			}),
		),
		(
			"Gone",
			Resolution::Local(LocalResolution {
				path: checkout.path().join("missing"),
			}),
		),
	]);
	let resolver = resolver(cache.path(), rules, source.clone());

	let resolved = resolver.resolve("Osaka").unwrap();
	assert_eq!(resolved.path, checkout.path());
	assert_eq!(resolved.src_dir(), checkout.path().join("src"));

	let err = resolver.resolve("Gone").unwrap_err();
	assert!(matches!(err, ResolveError::MissingLocalPath { ref fork, .. } if fork == "Gone"));
	assert_eq!(source.fetches(), 0);
	assert!(!resolver.invalidate("Osaka").unwrap());
}

#[test]
fn unknown_and_invalid_forks_are_config_errors() {
	let cache = tempfile::tempdir().unwrap();
	let root = cache.path().join("cache");
	let source = FakeSource::at("s1");
	let resolver = resolver(&root, table(vec![]), source.clone());

	let err = resolver.resolve("Atlantis").unwrap_err();
	assert!(err.is_config());
	assert!(matches!(err, ResolveError::Config(ConfigError::UnknownFork(_))));

	let err = resolver.resolve("../etc").unwrap_err();
	assert!(matches!(err, ResolveError::Config(ConfigError::InvalidForkName { .. })));
	assert!(!root.exists());
	assert_eq!(source.fetches(), 0);
}

#[test]
fn describe_reports_the_checked_out_commit() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![
		("EELSMaster", Resolution::Git(GitResolution::branch(url(), "master"))),
		(
			"Cancun",
			Resolution::SameAs(SameAsResolution {
				same_as: "EELSMaster".into(),
			}),
		),
		(
			"Osaka",
			Resolution::Local(LocalResolution {
				path: "/opt/specs".into(),
			}),
		),
	]);
	let resolver = resolver(cache.path(), rules, source.clone());

	let before = resolver.describe("Cancun").unwrap();
	assert_eq!(before["git-url"], "https://example.com/specs.git");
	assert_eq!(before["branch"], "master");
	assert!(before.get("commit").is_none());

	resolver.resolve("Cancun").unwrap();
	let after = resolver.describe("Cancun").unwrap();
	assert_eq!(after["commit"], "s1");

	assert_eq!(resolver.describe("Osaka").unwrap(), serde_json::json!({ "path": "/opt/specs" }));
	assert_eq!(source.remote_checks(), 0);
}

#[test]
fn invalidate_forces_a_new_fetch() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("Prague", Resolution::Git(GitResolution::branch(url(), "forks/prague").pinned("abc")))]);
	let resolver = resolver(cache.path(), rules, source.clone());

	resolver.resolve("Prague").unwrap();
	assert!(resolver.invalidate("Prague").unwrap());
	assert!(resolver.layout().read_entry("Prague").is_none());

	resolver.resolve("Prague").unwrap();
	assert_eq!(source.fetches(), 2);
}

#[test]
fn concurrent_resolutions_fetch_once() {
	let cache = tempfile::tempdir().unwrap();
	let source = FakeSource::at("s1");
	let rules = table(vec![("Prague", Resolution::Git(GitResolution::branch(url(), "forks/prague").pinned("abc")))]);
	let resolver = Arc::new(resolver(cache.path(), rules, source.clone()));

	let handles: Vec<_> = (0..4)
		.map(|_| {
			let resolver = Arc::clone(&resolver);
			std::thread::spawn(move || resolver.resolve("Prague").unwrap())
		})
		.collect();
	for handle in handles {
		handle.join().unwrap();
	}

	assert_eq!(source.fetches(), 1);
}
