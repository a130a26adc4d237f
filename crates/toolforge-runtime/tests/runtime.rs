//! End-to-end behaviour of the loader, registry, recovery policy and runtime
//! facade, driven through scripted mock modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use toolforge_runtime::config::{DEFAULT_MAX_MEMORY, DEFAULT_TIMEOUT_MS};
use toolforge_runtime::{
    CircuitState, ErrorCode, ExecuteOptions, HealthReport, HealthStatus, Module, ModuleConfig,
    ModuleDescriptor, ModuleError, ModuleFactory, ModuleMetadata, ModuleOutput, ModuleRegistry,
    ModuleRuntime, ModuleSource, RecoveryConfig, ResolvedConfig, Result, RuntimeConfig,
    RuntimeEvent,
};

// ---------------------------------------------------------------------------
// Scripted mock modules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Script {
    init_delay: Duration,
    exec_delay: Duration,
    fail_init: bool,
    incompatible: bool,
    /// Leading calls that fail with a transient `NETWORK_ERROR`.
    flaky_calls: u32,
    /// Every call fails with this code.
    always_fail: Option<ErrorCode>,
}

/// Counters shared by every module a factory creates.
#[derive(Debug, Clone, Default)]
struct Probes {
    creates: Arc<AtomicU32>,
    inits: Arc<AtomicU32>,
    disposes: Arc<AtomicU32>,
    init_order: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl Probes {
    fn calls(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

struct MockModule {
    id: String,
    script: Script,
    probes: Probes,
    calls: AtomicU32,
}

#[async_trait]
impl Module for MockModule {
    async fn initialize(&self, _config: &ResolvedConfig) -> Result<()> {
        tokio::time::sleep(self.script.init_delay).await;
        self.probes.inits.fetch_add(1, Ordering::SeqCst);
        self.probes.init_order.lock().unwrap().push(self.id.clone());
        if self.script.fail_init {
            return Err(ModuleError::new(
                ErrorCode::InitializationError,
                "sandbox refused to start",
            ));
        }
        Ok(())
    }

    async fn execute(&self, input: Value, options: &ExecuteOptions) -> Result<ModuleOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .probes
            .calls
            .lock()
            .unwrap()
            .entry(self.id.clone())
            .or_default() += 1;

        tokio::time::sleep(self.script.exec_delay).await;
        if options.operation == "panic" {
            panic!("mock module blew up");
        }
        if let Some(code) = self.script.always_fail {
            return Err(ModuleError::new(code, ""));
        }
        if n <= self.script.flaky_calls {
            return Err(ModuleError::new(ErrorCode::NetworkError, "connection reset"));
        }
        Ok(ModuleOutput::new(json!({ "module": self.id, "input": input })))
    }

    async fn dispose(&self) {
        self.probes.disposes.fetch_add(1, Ordering::SeqCst);
    }

    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            id: self.id.clone(),
            name: self.id.clone(),
            version: "1.0.0".into(),
            category: "mock".into(),
            description: String::new(),
            operations: vec!["echo".into()],
        }
    }

    async fn health(&self) -> HealthReport {
        HealthReport::new(HealthStatus::Healthy, Duration::ZERO)
    }

    fn is_compatible(&self) -> bool {
        !self.script.incompatible
    }
}

#[derive(Default)]
struct MockFactory {
    scripts: HashMap<String, Script>,
    probes: Probes,
}

impl MockFactory {
    fn script(mut self, id: &str, script: Script) -> Self {
        self.scripts.insert(id.to_owned(), script);
        self
    }
}

#[async_trait]
impl ModuleFactory for MockFactory {
    type Module = MockModule;

    async fn create(&self, descriptor: &ModuleDescriptor) -> Result<MockModule> {
        self.probes.creates.fetch_add(1, Ordering::SeqCst);
        Ok(MockModule {
            id: descriptor.id.clone(),
            script: self.scripts.get(&descriptor.id).cloned().unwrap_or_default(),
            probes: self.probes.clone(),
            calls: AtomicU32::new(0),
        })
    }
}

fn descriptor(id: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(
        id,
        id,
        "1.0.0",
        "mock",
        ModuleSource::Wasm {
            location: format!("file:///opt/toolforge/{id}.wasm"),
        },
    )
}

fn fast_recovery() -> RecoveryConfig {
    RecoveryConfig {
        max_attempts: 3,
        retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(5),
        ..RecoveryConfig::default()
    }
}

fn runtime_with(
    descriptors: impl IntoIterator<Item = ModuleDescriptor>,
    factory: MockFactory,
    config: RuntimeConfig,
) -> (ModuleRuntime<MockFactory>, Probes) {
    let registry = ModuleRegistry::new();
    for d in descriptors {
        registry.register_module(d);
    }
    let probes = factory.probes.clone();
    (ModuleRuntime::new(registry, factory, config), probes)
}

fn default_config() -> RuntimeConfig {
    RuntimeConfig {
        recovery: fast_recovery(),
        ..RuntimeConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_share_one_initialization() {
    let factory = MockFactory::default().script(
        "slow",
        Script {
            init_delay: Duration::from_millis(50),
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with([descriptor("slow")], factory, default_config());

    let loads = (0..10).map(|_| runtime.loader().load_module("slow", None));
    let instances = futures::future::join_all(loads).await;

    let first = instances[0].as_ref().unwrap();
    for instance in &instances {
        assert!(Arc::ptr_eq(first, instance.as_ref().unwrap()));
    }
    assert_eq!(Probes::count(&probes.creates), 1);
    assert_eq!(Probes::count(&probes.inits), 1);
    assert!(first.is_initialized());
}

#[tokio::test]
async fn unload_then_reload_builds_a_fresh_instance() {
    let (runtime, probes) = runtime_with([descriptor("a")], MockFactory::default(), default_config());
    let loader = runtime.loader();

    let first = loader.load_module("a", None).await.unwrap();
    assert!(loader.is_module_loaded("a"));

    assert!(loader.unload_module("a").await);
    assert!(!loader.is_module_loaded("a"));
    assert!(!first.is_initialized());
    assert_eq!(Probes::count(&probes.disposes), 1);
    assert!(!loader.unload_module("a").await);

    let second = loader.load_module("a", None).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(Probes::count(&probes.inits), 2);

    let stale = first.execute(json!(1), &ExecuteOptions::new("echo")).await;
    assert_eq!(stale.error_code(), Some(ErrorCode::InitializationError));
}

#[tokio::test]
async fn unknown_module_fails_to_load() {
    let (runtime, probes) = runtime_with(Vec::new(), MockFactory::default(), default_config());

    let err = runtime.loader().load_module("ghost", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::LoadFailed);
    assert!(!err.suggestions.is_empty());
    assert_eq!(Probes::count(&probes.creates), 0);

    let result = runtime.run("ghost", json!(null), ExecuteOptions::new("echo")).await;
    assert_eq!(result.error_code(), Some(ErrorCode::LoadFailed));
    assert!(result.data().is_none());
}

#[tokio::test]
async fn preload_reports_each_module_independently() {
    let (runtime, _) = runtime_with(
        [descriptor("a"), descriptor("b")],
        MockFactory::default(),
        default_config(),
    );

    let results = runtime.loader().preload_modules(["a", "missing", "b"]).await;
    let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["a", "missing", "b"]);
    assert!(results[0].1.is_ok());
    assert_eq!(
        results[1].1.as_ref().unwrap_err().code,
        ErrorCode::LoadFailed
    );
    assert!(results[2].1.is_ok());
    assert_eq!(runtime.loader().loaded_modules(), ["a", "b"]);
}

#[tokio::test]
async fn dependencies_load_first() {
    let (runtime, probes) = runtime_with(
        [
            descriptor("app").with_dependencies(["parser"]),
            descriptor("parser").with_dependencies(["lexer"]),
            descriptor("lexer"),
        ],
        MockFactory::default(),
        default_config(),
    );

    runtime.loader().load_module("app", None).await.unwrap();
    assert_eq!(
        *probes.init_order.lock().unwrap(),
        ["lexer", "parser", "app"]
    );
    assert_eq!(runtime.loader().loaded_modules(), ["app", "lexer", "parser"]);
}

#[tokio::test]
async fn dependency_cycles_are_rejected() {
    let (runtime, probes) = runtime_with(
        [
            descriptor("x").with_dependencies(["y"]),
            descriptor("y").with_dependencies(["x"]),
        ],
        MockFactory::default(),
        default_config(),
    );

    let err = runtime.loader().load_module("x", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::LoadFailed);
    assert!(err.details.get("cycle").is_some());
    assert_eq!(Probes::count(&probes.inits), 0);
    assert!(runtime.loader().loaded_modules().is_empty());
}

#[tokio::test]
async fn failed_dependency_fails_the_dependent() {
    let factory = MockFactory::default().script(
        "lexer",
        Script {
            fail_init: true,
            ..Script::default()
        },
    );
    let (runtime, _) = runtime_with(
        [descriptor("parser").with_dependencies(["lexer"]), descriptor("lexer")],
        factory,
        default_config(),
    );

    let err = runtime.loader().load_module("parser", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::LoadFailed);
    assert_eq!(err.details["dependency"], "lexer");
    assert_eq!(err.cause(), Some("INITIALIZATION_ERROR"));
}

#[tokio::test]
async fn invalid_limits_are_clamped_to_defaults() {
    let (runtime, _) = runtime_with([descriptor("a")], MockFactory::default(), default_config());

    let config = ModuleConfig::new()
        .with_max_memory(-1)
        .with_timeout_ms(0)
        .with_log_level("chatty");
    let instance = runtime.loader().load_module("a", Some(config)).await.unwrap();

    assert_eq!(instance.config().max_memory, DEFAULT_MAX_MEMORY);
    assert_eq!(
        instance.config().timeout,
        Duration::from_millis(DEFAULT_TIMEOUT_MS)
    );
}

#[tokio::test]
async fn initialization_failure_is_load_failed_and_disposes() {
    let factory = MockFactory::default().script(
        "broken",
        Script {
            fail_init: true,
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with([descriptor("broken")], factory, default_config());

    let err = runtime.loader().load_module("broken", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::LoadFailed);
    assert_eq!(err.cause(), Some("INITIALIZATION_ERROR"));
    assert_eq!(Probes::count(&probes.disposes), 1);
    assert!(!runtime.loader().is_module_loaded("broken"));

    // A failed load is not cached.
    runtime.loader().load_module("broken", None).await.unwrap_err();
    assert_eq!(Probes::count(&probes.inits), 2);
}

#[tokio::test]
async fn incompatible_module_is_never_initialized() {
    let factory = MockFactory::default().script(
        "legacy",
        Script {
            incompatible: true,
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with([descriptor("legacy")], factory, default_config());

    let err = runtime.loader().load_module("legacy", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::LoadFailed);
    assert_eq!(err.cause(), Some("INCOMPATIBLE_MODULE"));
    assert_eq!(Probes::count(&probes.inits), 0);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn registering_the_same_id_twice_keeps_one_entry() {
    let registry = ModuleRegistry::new();
    registry.register_module(descriptor("a"));
    let mut newer = descriptor("a");
    newer.version = "1.1.0".into();
    registry.register_module(newer);

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get_module("a").unwrap().version, "1.1.0");
}

#[test]
fn builtin_search_is_case_insensitive() {
    let runtime = ModuleRuntime::with_builtins(RuntimeConfig::default()).unwrap();
    let registry = runtime.registry();

    let json: Vec<String> = registry
        .search_modules("JSON")
        .into_iter()
        .map(|d| d.id)
        .collect();
    for id in ["json-formatter", "json-validator", "json-converter"] {
        assert!(json.iter().any(|j| j == id), "{id} missing from {json:?}");
    }

    let formatters: Vec<String> = registry
        .search_modules("formatter")
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert!(formatters.iter().any(|id| id == "json-formatter"));
    assert!(formatters.iter().any(|id| id == "code-formatter"));
    assert!(registry.search_modules("no-such-tool").is_empty());
}

// ---------------------------------------------------------------------------
// Execution, timeouts and error normalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_execution_times_out() {
    let factory = MockFactory::default().script(
        "sleepy",
        Script {
            exec_delay: Duration::from_millis(500),
            ..Script::default()
        },
    );
    let config = RuntimeConfig {
        defaults: ModuleConfig::new().with_timeout_ms(30),
        recovery: RecoveryConfig {
            max_attempts: 1,
            ..fast_recovery()
        },
        ..RuntimeConfig::default()
    };
    let (runtime, _) = runtime_with([descriptor("sleepy")], factory, config);

    let started = Instant::now();
    let result = runtime.run("sleepy", json!({}), ExecuteOptions::new("echo")).await;
    assert!(started.elapsed() < Duration::from_millis(500));

    let err = result.error().unwrap();
    assert_eq!(err.code, ErrorCode::TimeoutError);
    assert!(err.recoverable);
    assert_eq!(err.details["timeout_ms"], 30);
}

#[tokio::test]
async fn module_failures_are_normalized() {
    let factory = MockFactory::default().script(
        "faulty",
        Script {
            always_fail: Some(ErrorCode::ExecutionError),
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with([descriptor("faulty")], factory, default_config());

    let result = runtime.run("faulty", json!({}), ExecuteOptions::new("echo")).await;
    let err = result.error().unwrap();
    assert_eq!(err.code, ErrorCode::ExecutionError);
    assert!(!err.message.is_empty());
    assert!(!err.suggestions.is_empty());
    assert_eq!(err.details["module_id"], "faulty");

    // Not transient, so not retried.
    assert_eq!(probes.calls("faulty"), 1);
    assert!(result.recovery().is_none());
}

#[tokio::test]
async fn panics_become_host_errors() {
    let (runtime, _) = runtime_with([descriptor("a")], MockFactory::default(), default_config());

    let result = runtime.run("a", json!({}), ExecuteOptions::new("panic")).await;
    let err = result.error().unwrap();
    assert_eq!(err.code, ErrorCode::HostRuntimeError);
    assert!(err.message.contains("mock module blew up"));

    // The instance survives and keeps serving.
    let result = runtime.run("a", json!(1), ExecuteOptions::new("echo")).await;
    assert!(result.is_success());
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let factory = MockFactory::default().script(
        "flaky",
        Script {
            flaky_calls: 2,
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with([descriptor("flaky")], factory, default_config());
    let mut events = runtime.events().subscribe();

    let result = runtime
        .run("flaky", json!("ping"), ExecuteOptions::new("echo"))
        .await;
    assert!(result.is_success());
    assert_eq!(result.data().unwrap()["input"], "ping");

    let report = result.recovery().unwrap();
    assert!(report.attempted);
    assert!(report.success);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.retried, [ErrorCode::NetworkError, ErrorCode::NetworkError]);
    assert_eq!(report.fallback, None);
    assert_eq!(probes.calls("flaky"), 3);
    assert_eq!(runtime.recovery().circuit_state("flaky"), CircuitState::Closed);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.as_ref(), RuntimeEvent::RetryScheduled { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let factory = MockFactory::default().script(
        "down",
        Script {
            always_fail: Some(ErrorCode::NetworkError),
            ..Script::default()
        },
    );
    let config = RuntimeConfig {
        recovery: RecoveryConfig {
            max_attempts: 1,
            failure_threshold: 2,
            cool_down: Duration::from_secs(60),
            ..fast_recovery()
        },
        ..RuntimeConfig::default()
    };
    let (runtime, probes) = runtime_with([descriptor("down")], factory, config);

    for _ in 0..2 {
        let result = runtime.run("down", json!({}), ExecuteOptions::new("echo")).await;
        assert_eq!(result.error_code(), Some(ErrorCode::NetworkError));
    }
    assert_eq!(runtime.recovery().circuit_state("down"), CircuitState::Open);

    let result = runtime.run("down", json!({}), ExecuteOptions::new("echo")).await;
    let err = result.error().unwrap();
    assert_eq!(err.code, ErrorCode::CircuitOpen);
    assert!(err.details.get("retry_after_ms").is_some());
    assert_eq!(probes.calls("down"), 2);
}

#[tokio::test]
async fn fallback_answers_for_a_failing_primary() {
    let factory = MockFactory::default().script(
        "primary",
        Script {
            always_fail: Some(ErrorCode::NetworkError),
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with(
        [descriptor("primary"), descriptor("backup")],
        factory,
        default_config(),
    );
    runtime.register_fallback("primary", "backup");

    let result = runtime
        .run("primary", json!("payload"), ExecuteOptions::new("echo"))
        .await;
    assert!(result.is_success());
    assert_eq!(result.data().unwrap()["module"], "backup");

    let report = result.recovery().unwrap();
    assert!(report.attempted);
    assert!(report.success);
    assert_eq!(report.fallback.as_deref(), Some("backup"));
    assert_eq!(report.attempts, 4);
    assert_eq!(probes.calls("primary"), 3);
    assert_eq!(probes.calls("backup"), 1);
}

#[tokio::test]
async fn non_recoverable_failures_skip_fallbacks() {
    let factory = MockFactory::default().script(
        "strict",
        Script {
            always_fail: Some(ErrorCode::InvalidInput),
            ..Script::default()
        },
    );
    let (runtime, probes) = runtime_with(
        [descriptor("strict"), descriptor("backup")],
        factory,
        default_config(),
    );
    runtime.register_fallback("strict", "backup");

    let result = runtime.run("strict", json!({}), ExecuteOptions::new("echo")).await;
    assert_eq!(result.error_code(), Some(ErrorCode::InvalidInput));
    assert!(result.recovery().is_none());
    assert_eq!(probes.calls("strict"), 1);
    assert_eq!(probes.calls("backup"), 0);
}

// ---------------------------------------------------------------------------
// Events and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_events_are_published() {
    let (runtime, _) = runtime_with([descriptor("a")], MockFactory::default(), default_config());
    let mut events = runtime.events().subscribe();

    runtime.loader().load_module("a", None).await.unwrap();
    runtime.shutdown().await;

    let first = events.recv().await.unwrap();
    assert!(matches!(first.as_ref(), RuntimeEvent::ModuleLoaded { module_id, .. } if module_id == "a"));
    let second = events.recv().await.unwrap();
    assert!(matches!(second.as_ref(), RuntimeEvent::ModuleUnloaded { module_id } if module_id == "a"));
    assert!(runtime.loader().loaded_modules().is_empty());
}

#[tokio::test]
async fn unregistering_unloads_the_module() {
    let (runtime, probes) = runtime_with([descriptor("a")], MockFactory::default(), default_config());
    runtime.loader().load_module("a", None).await.unwrap();

    runtime.unregister_module("a").await.unwrap();
    assert!(!runtime.registry().contains("a"));
    assert!(!runtime.loader().is_module_loaded("a"));
    assert_eq!(Probes::count(&probes.disposes), 1);

    let err = runtime.unregister_module("a").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ModuleNotFound);
}

#[tokio::test]
async fn builtin_tools_run_end_to_end() {
    let runtime = ModuleRuntime::with_builtins(RuntimeConfig::default()).unwrap();

    let result = runtime
        .run(
            "json-formatter",
            json!("{\"b\":[1,2]}"),
            ExecuteOptions::new("format").with_param("indent", 4),
        )
        .await;
    assert_eq!(
        result.data().unwrap(),
        &json!("{\n    \"b\": [\n        1,\n        2\n    ]\n}")
    );

    let result = runtime
        .run(
            "json-converter",
            json!({ "name": "ada" }),
            ExecuteOptions::new("to_yaml"),
        )
        .await;
    assert_eq!(result.data().unwrap(), &json!("name: ada\n"));

    let health = runtime.health("json-validator").await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
}
