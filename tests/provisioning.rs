//! Engine-level tests for provisioning under concurrency

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::TempDir;
use vhostgate::artifacts::HostLayout;
use vhostgate::deploy::scan_once;
use vhostgate::engine::{
    Disposition, EngineSettings, HostOutcome, ProvisionRequest, ProvisioningEngine, RejectReason,
};
use vhostgate::error::GatewayErrorCode;
use vhostgate::hostname::normalize;
use vhostgate::registry::{HostRegistry, HostTable};
use vhostgate::throttle::ThrottleDenial;

struct Env {
    _tmp: TempDir,
    runtime: PathBuf,
    sites: PathBuf,
    table: Arc<HostTable>,
    engine: Arc<ProvisioningEngine>,
}

fn settings(runtime: &Path) -> EngineSettings {
    EngineSettings {
        logging_enabled: false,
        wait_for_context: Duration::ZERO,
        wait_poll_interval: Duration::from_millis(10),
        time_between_creations: Duration::ZERO,
        max_creations: 100,
        scan_dependency_paths: false,
        shared_key: None,
        app_base: "webapps".to_string(),
        layout: HostLayout::new(runtime, "Catalina"),
    }
}

fn env_with(adjust: impl FnOnce(&mut EngineSettings)) -> Env {
    let tmp = TempDir::new().unwrap();
    let runtime = tmp.path().join("runtime");
    let sites = tmp.path().join("sites");
    for i in 0..16 {
        std::fs::create_dir_all(sites.join(format!("app{}", i))).unwrap();
    }

    let mut settings = settings(&runtime);
    adjust(&mut settings);

    let table = Arc::new(HostTable::new());
    let engine = Arc::new(ProvisioningEngine::new(
        Arc::clone(&table) as Arc<dyn HostRegistry>,
        settings,
    ));
    Env {
        _tmp: tmp,
        runtime,
        sites,
        table,
        engine,
    }
}

impl Env {
    fn site(&self, i: usize) -> String {
        self.sites
            .join(format!("app{}", i))
            .to_string_lossy()
            .into_owned()
    }

    fn conf_dir(&self, host: &str) -> PathBuf {
        self.runtime.join("conf/Catalina").join(host)
    }

    /// Run `requests` on separate threads released together
    fn handle_concurrently(&self, requests: Vec<ProvisionRequest>) -> Vec<HostOutcome> {
        let barrier = Arc::new(Barrier::new(requests.len()));
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let engine = Arc::clone(&self.engine);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.handle(&request)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap().outcome)
            .collect()
    }
}

#[test]
fn test_new_host_then_alias_scenario() {
    let env = env_with(|s| s.time_between_creations = Duration::from_secs(60));

    let first = env.engine.handle(
        &ProvisionRequest::new("app1.example.com", env.site(1)).with_uri("/welcome.cfm", None),
    );
    assert_eq!(first.outcome, HostOutcome::CreatedNew);
    assert_eq!(
        first.disposition,
        Disposition::Redirect("/welcome.cfm".to_string())
    );
    assert!(env.conf_dir("app1.example.com").join("ROOT.xml").is_file());
    let after_create = env.engine.throttle().snapshot();

    let second = env.engine.handle(
        &ProvisionRequest::new("app2.example.com", env.site(2)).with_context("app1.example.com"),
    );
    assert_eq!(second.outcome, HostOutcome::AddedAlias);
    assert!(!env.conf_dir("app2.example.com").exists());
    assert_eq!(env.engine.throttle().snapshot(), after_create);
}

#[test]
fn test_known_host_never_reenters_creation() {
    let env = env_with(|s| s.max_creations = 1);
    let request = ProvisionRequest::new("app1.example.com", env.site(1));
    assert_eq!(env.engine.handle(&request).outcome, HostOutcome::CreatedNew);

    // Even with the limit exhausted, known hosts are a plain pass-through
    for raw in ["app1.example.com", "APP1.example.com:8080"] {
        let result = env
            .engine
            .handle(&ProvisionRequest::new(raw, env.site(1)));
        assert_eq!(result.outcome, HostOutcome::AlreadyExists);
        assert_eq!(result.disposition, Disposition::PassThrough);
    }
    assert_eq!(env.engine.throttle().snapshot().created, 1);
}

#[test]
fn test_max_creations_one_concurrent_distinct_hosts() {
    let env = env_with(|s| s.max_creations = 1);
    let outcomes = env.handle_concurrently(vec![
        ProvisionRequest::new("one.test", env.site(1)),
        ProvisionRequest::new("two.test", env.site(2)),
    ]);

    let created = outcomes
        .iter()
        .filter(|o| **o == HostOutcome::CreatedNew)
        .count();
    let denied = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                HostOutcome::Rejected(RejectReason::Throttled(ThrottleDenial::LimitReached {
                    max: 1
                }))
            )
        })
        .count();
    assert_eq!(created, 1);
    assert_eq!(denied, 1);
    assert_eq!(env.table.len(), 1);
}

#[test]
fn test_exactly_n_creations_under_concurrency() {
    let env = env_with(|s| s.max_creations = 5);
    let requests = (0..16)
        .map(|i| ProvisionRequest::new(format!("host{}.test", i), env.site(i)))
        .collect();

    let outcomes = env.handle_concurrently(requests);
    let created = outcomes
        .iter()
        .filter(|o| **o == HostOutcome::CreatedNew)
        .count();
    assert_eq!(created, 5);
    assert_eq!(env.table.len(), 5);
    assert_eq!(env.engine.throttle().snapshot().created, 5);

    // The limit holds for the rest of the process lifetime
    let late = env
        .engine
        .handle(&ProvisionRequest::new("late.test", env.site(0)));
    assert!(matches!(
        late.disposition,
        Disposition::Reject {
            code: GatewayErrorCode::CreationLimitReached,
            ..
        }
    ));
}

#[test]
fn test_spacing_allows_only_first_of_concurrent_requests() {
    let env = env_with(|s| s.time_between_creations = Duration::from_secs(60));
    let requests = (0..8)
        .map(|i| ProvisionRequest::new(format!("spaced{}.test", i), env.site(i)))
        .collect();

    let outcomes = env.handle_concurrently(requests);
    let created = outcomes
        .iter()
        .filter(|o| **o == HostOutcome::CreatedNew)
        .count();
    let too_soon = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                HostOutcome::Rejected(RejectReason::Throttled(ThrottleDenial::TooSoon { .. }))
            )
        })
        .count();
    assert_eq!(created, 1);
    assert_eq!(too_soon, 7);
}

#[test]
fn test_concurrent_requests_for_same_host_create_once() {
    let env = env_with(|s| s.time_between_creations = Duration::from_secs(60));
    let requests = (0..8)
        .map(|_| ProvisionRequest::new("same.test", env.site(3)))
        .collect();

    let outcomes = env.handle_concurrently(requests);
    let created = outcomes
        .iter()
        .filter(|o| **o == HostOutcome::CreatedNew)
        .count();
    assert_eq!(created, 1);
    // Everyone else either saw the host before the lock, or after it
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, HostOutcome::CreatedNew | HostOutcome::AlreadyExists)));
    assert_eq!(env.engine.throttle().snapshot().created, 1);
}

#[test]
fn test_aliases_bypass_throttle_back_to_back() {
    let env = env_with(|s| {
        s.time_between_creations = Duration::from_secs(60);
        s.max_creations = 1;
    });
    assert_eq!(
        env.engine
            .handle(&ProvisionRequest::new("main.test", env.site(0)))
            .outcome,
        HostOutcome::CreatedNew
    );

    let requests = (1..6)
        .map(|i| ProvisionRequest::new(format!("alias{}.test", i), env.site(i)).with_context("main.test"))
        .collect();
    let outcomes = env.handle_concurrently(requests);
    assert!(outcomes.iter().all(|o| *o == HostOutcome::AddedAlias));

    let main = env.table.resolve("main.test").unwrap();
    assert_eq!(main.aliases().len(), 5);
    assert_eq!(env.engine.throttle().snapshot().created, 1);
}

#[test]
fn test_new_context_and_its_aliases_race() {
    let env = env_with(|s| s.time_between_creations = Duration::from_secs(60));
    let requests = (0..6)
        .map(|i| ProvisionRequest::new(format!("www{}.shop.test", i), env.site(4)).with_context("shop.test"))
        .collect();

    let outcomes = env.handle_concurrently(requests);
    let created = outcomes
        .iter()
        .filter(|o| **o == HostOutcome::CreatedNew)
        .count();
    assert_eq!(created, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, HostOutcome::CreatedNew | HostOutcome::AddedAlias)));

    let shop = env.table.resolve("shop.test").unwrap();
    assert_eq!(shop.aliases().len(), 6);
    assert_eq!(env.table.len(), 1);
}

#[test]
fn test_missing_doc_root_passes_through() {
    let env = env_with(|_| {});
    let mut request = ProvisionRequest::new("app1.example.com", env.site(1));
    request.doc_root = None;

    let result = env.engine.handle(&request);
    assert_eq!(result.disposition, Disposition::PassThrough);
    assert_eq!(
        result.outcome,
        HostOutcome::Rejected(RejectReason::MissingDocRoot)
    );
    assert!(env.table.is_empty());
    assert!(!env.conf_dir("app1.example.com").exists());
}

#[test]
fn test_wait_for_deployment_by_runtime() {
    let env = env_with(|s| {
        s.wait_for_context = Duration::from_secs(5);
        s.wait_poll_interval = Duration::from_millis(20);
    });
    let layout = env.engine.layout().clone();
    let table = Arc::clone(&env.table);

    // Stand-in for the runtime's background deployment scan
    let scanner = std::thread::spawn(move || {
        for _ in 0..200 {
            if !scan_once(&table, &layout).is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    });

    let result = env
        .engine
        .handle(&ProvisionRequest::new("deployed.test", env.site(5)));
    assert_eq!(result.outcome, HostOutcome::CreatedNew);
    assert!(scanner.join().unwrap());

    let host = env.table.resolve("deployed.test").unwrap();
    let expected = std::fs::canonicalize(env.site(5)).unwrap();
    assert_eq!(host.deployed_doc_root(), Some(expected));
    assert!(env.runtime.join("work/Catalina/deployed.test").is_dir());
}

#[test]
fn test_wait_timeout_still_redirects() {
    let env = env_with(|s| {
        s.wait_for_context = Duration::from_millis(100);
        s.wait_poll_interval = Duration::from_millis(20);
    });

    let result = env.engine.handle(
        &ProvisionRequest::new("slow.test", env.site(6)).with_uri("/x.cfm", Some("y=1")),
    );
    assert_eq!(result.outcome, HostOutcome::CreatedNew);
    assert_eq!(
        result.disposition,
        Disposition::Redirect("/x.cfm?y=1".to_string())
    );
}

#[test]
fn test_stale_artifacts_replaced_on_creation() {
    let env = env_with(|_| {});
    let conf = env.conf_dir("stale.test");
    std::fs::create_dir_all(&conf).unwrap();
    std::fs::write(conf.join("ROOT.xml"), "<Context docBase=\"/old\"/>").unwrap();
    std::fs::write(conf.join("leftover.xml"), "x").unwrap();

    let result = env
        .engine
        .handle(&ProvisionRequest::new("stale.test", env.site(7)));
    assert_eq!(result.outcome, HostOutcome::CreatedNew);
    assert!(!conf.join("leftover.xml").exists());

    let contents = std::fs::read_to_string(conf.join("ROOT.xml")).unwrap();
    let expected = std::fs::canonicalize(env.site(7)).unwrap();
    assert!(contents.contains(&*expected.to_string_lossy()));
}

#[test]
fn test_unusual_hostnames_get_safe_artifact_names() {
    let env = env_with(|_| {});
    let result = env
        .engine
        .handle(&ProvisionRequest::new("[::1]:8080", env.site(8)));
    assert_eq!(result.outcome, HostOutcome::CreatedNew);

    let name = normalize("[::1]:8080");
    assert_eq!(name, "_91__58__58_1_93_");
    assert!(env.conf_dir(&name).join("ROOT.xml").is_file());
}
