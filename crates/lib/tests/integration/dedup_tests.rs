use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_lib::cache::MemoryCache;
use kiln_lib::rule::{BuildContext, RuleBuilder, RuleKind};
use kiln_lib::step::{ExecutionContext, Step, StepExecutionResult};
use kiln_lib::{BuildStatus, Rule};

use super::common::{Cell, counted, genrule, read, t};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_execution() {
  let cell = Cell::new();
  let shared = genrule("//:shared", &counted("shared", "sleep 0.2 && echo shared > $OUT"), &[], "shared.txt")
    .build()
    .unwrap();
  let mut rules = vec![shared];
  for i in 0..4 {
    rules.push(
      genrule(&format!("//:user{}", i), "cat $DEPS > $OUT", &[], "user.txt")
        .declared_dep(t("//:shared"))
        .build()
        .unwrap(),
    );
  }
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));

  let mut handles = Vec::new();
  for i in 0..4 {
    let engine = engine.clone();
    handles.push(tokio::spawn(async move {
      engine.build(&[t(&format!("//:user{}", i)), t("//:shared")]).await.unwrap()
    }));
  }

  for handle in handles {
    let report = handle.await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.get(&t("//:shared")).unwrap().status, BuildStatus::SuccessBuiltLocally);
  }
  assert_eq!(cell.runs("shared"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_rules_under_different_targets_run_once() {
  let cell = Cell::new();
  let cmd = counted("same", "sleep 0.1 && echo same > $OUT");
  let rules = vec![
    genrule("//x:one", &cmd, &[], "out.txt").build().unwrap(),
    genrule("//x:two", &cmd, &[], "out.txt").build().unwrap(),
  ];
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));

  let report = engine.build(&[t("//x:one"), t("//x:two")]).await.unwrap();

  assert!(report.is_success());
  let one = report.get(&t("//x:one")).unwrap();
  let two = report.get(&t("//x:two")).unwrap();
  assert_eq!(one.rule_key, two.rule_key);
  assert_eq!(cell.runs("same"), 1);
  assert_eq!(report.count(BuildStatus::SuccessFromCache), 1);
  assert_eq!(read(&one.outputs[0]), "same\n");
  assert_eq!(read(&two.outputs[0]), "same\n");
}

/// Tracks how many of its steps run at the same time.
#[derive(Debug)]
struct Gauge {
  current: AtomicUsize,
  peak: AtomicUsize,
}

#[derive(Debug)]
struct GaugeKind(Arc<Gauge>);

#[derive(Debug)]
struct GaugeStep(Arc<Gauge>);

#[async_trait]
impl Step for GaugeStep {
  fn short_name(&self) -> &str {
    "gauge"
  }

  fn description(&self, _ctx: &ExecutionContext) -> String {
    "gauge".to_string()
  }

  async fn execute(&self, _ctx: &ExecutionContext) -> StepExecutionResult {
    let now = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.0.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(30)).await;
    self.0.current.fetch_sub(1, Ordering::SeqCst);
    StepExecutionResult::Success
  }
}

impl RuleKind for GaugeKind {
  fn type_tag(&self) -> &str {
    "gauge"
  }

  fn steps(&self, _ctx: &BuildContext) -> Vec<Box<dyn Step>> {
    vec![Box::new(GaugeStep(self.0.clone()))]
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executing_rules_never_exceed_parallelism() {
  let cell = Cell::new();
  let gauge = Arc::new(Gauge {
    current: AtomicUsize::new(0),
    peak: AtomicUsize::new(0),
  });
  let rules: Vec<Rule> = (0..8)
    .map(|i| {
      RuleBuilder::new(t(&format!("//:r{}", i)), Arc::new(GaugeKind(gauge.clone())))
        .field("index", i as i64)
        .build()
        .unwrap()
    })
    .collect();
  let targets: Vec<_> = rules.iter().map(|r| r.target().clone()).collect();

  let graph = kiln_lib::RuleGraph::from_rules(rules).unwrap();
  let engine = kiln_lib::BuildEngine::new(graph, Arc::new(MemoryCache::new()), cell.config().with_parallelism(2));
  let report = engine.build(&targets).await.unwrap();

  assert!(report.is_success());
  assert_eq!(report.len(), 8);
  let peak = gauge.peak.load(Ordering::SeqCst);
  assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
}
