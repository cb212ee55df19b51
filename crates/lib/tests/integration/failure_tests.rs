use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_lib::cache::MemoryCache;
use kiln_lib::engine::{BuildError, CancelReason, RuleState};
use kiln_lib::{BuildStatus, Rule};

use super::common::{Cell, counted, genrule, t};

fn ok_rule(name: &str, deps: &[&str]) -> Rule {
  genrule(name, "echo ok > $OUT", &[], "out.txt")
    .declared_deps(deps.iter().map(|d| t(d)))
    .build()
    .unwrap()
}

#[tokio::test]
async fn failure_is_contained_to_dependents() {
  let cell = Cell::new();
  let rules = vec![
    genrule("//:b", &counted("b", "echo broken >&2; exit 3"), &[], "out.txt")
      .build()
      .unwrap(),
    ok_rule("//:a", &["//:b"]),
    ok_rule("//:c", &["//:b"]),
    ok_rule("//:d", &[]),
  ];
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));

  let report = engine.build(&[t("//:a"), t("//:c"), t("//:d")]).await.unwrap();

  assert!(!report.is_success());
  let b = report.get(&t("//:b")).unwrap();
  assert_eq!(b.status, BuildStatus::Failed);
  match &b.error {
    Some(BuildError::StepFailure {
      short_name,
      exit_code,
      message,
      ..
    }) => {
      assert_eq!(short_name, "shell");
      assert_eq!(*exit_code, Some(3));
      assert!(message.contains("broken"), "{}", message);
    }
    other => panic!("expected a step failure, got {:?}", other),
  }

  for name in ["//:a", "//:c"] {
    let result = report.get(&t(name)).unwrap();
    assert_eq!(result.status, BuildStatus::Cancelled);
    assert_eq!(
      result.error,
      Some(BuildError::Cancelled {
        reason: CancelReason::DependencyFailed {
          dependency: t("//:b"),
          root_cause: t("//:b"),
        },
      })
    );
  }
  assert_eq!(report.get(&t("//:d")).unwrap().status, BuildStatus::SuccessBuiltLocally);
  assert_eq!(report.cancelled_by(&t("//:b")), BTreeSet::from([t("//:a"), t("//:c")]));
  assert_eq!(cell.runs("b"), 1);
}

#[tokio::test]
async fn cancellation_chain_names_the_root_cause() {
  let cell = Cell::new();
  let rules = vec![
    genrule("//:base", "exit 1", &[], "out.txt").build().unwrap(),
    ok_rule("//:mid", &["//:base"]),
    ok_rule("//:top", &["//:mid"]),
  ];
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));

  let report = engine.build(&[t("//:top")]).await.unwrap();

  let top = report.get(&t("//:top")).unwrap();
  assert_eq!(top.status, BuildStatus::Cancelled);
  assert_eq!(top.root_cause(&t("//:top")), Some(&t("//:base")));
  assert_eq!(report.failures().count(), 1);
  assert_eq!(report.cancelled_by(&t("//:base")).len(), 2);
}

#[tokio::test]
async fn missing_declared_output_fails_the_rule() {
  let cell = Cell::new();
  let engine = cell.engine(
    vec![genrule("//:lazy", "true", &[], "never.txt").build().unwrap()],
    Arc::new(MemoryCache::new()),
  );

  let report = engine.build(&[t("//:lazy")]).await.unwrap();

  let result = report.get(&t("//:lazy")).unwrap();
  assert_eq!(result.status, BuildStatus::Failed);
  assert!(result.rule_key.is_some());
  assert!(matches!(result.error, Some(BuildError::MissingOutput { .. })));
}

#[tokio::test]
async fn unreadable_input_fails_before_execution() {
  let cell = Cell::new();
  let rules = vec![
    genrule("//:lib", &counted("lib", "cat $SRCS > $OUT"), &["missing.txt"], "lib.txt")
      .build()
      .unwrap(),
    ok_rule("//:app", &["//:lib"]),
  ];
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));

  let report = engine.build(&[t("//:app")]).await.unwrap();

  let lib = report.get(&t("//:lib")).unwrap();
  assert_eq!(lib.status, BuildStatus::Failed);
  assert_eq!(lib.rule_key, None);
  match &lib.error {
    Some(BuildError::UnhashableInput { path, .. }) => assert!(path.contains("missing.txt")),
    other => panic!("expected an unhashable input, got {:?}", other),
  }
  assert_eq!(report.get(&t("//:app")).unwrap().status, BuildStatus::Cancelled);
  assert_eq!(cell.runs("lib"), 0);
}

#[tokio::test]
async fn cancelled_build_reports_every_unfinished_rule() {
  let cell = Cell::new();
  let rules = vec![
    genrule("//:slow", &counted("slow", "sleep 0.3 && echo done > $OUT"), &[], "out.txt")
      .build()
      .unwrap(),
    genrule("//:after", &counted("after", "echo after > $OUT"), &[], "out.txt")
      .declared_dep(t("//:slow"))
      .build()
      .unwrap(),
  ];
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));
  let mut events = engine.subscribe();

  let build = tokio::spawn({
    let engine = engine.clone();
    async move { engine.build(&[t("//:after")]).await.unwrap() }
  });

  // Cancel once the slow rule is running; its step is allowed to finish.
  while let Some(event) = events.recv().await {
    if event.target == t("//:slow") && event.state == RuleState::Executing {
      break;
    }
  }
  engine.cancel();
  let report = build.await.unwrap();

  assert_eq!(cell.runs("slow"), 1);
  assert_eq!(cell.runs("after"), 0);
  let after = report.get(&t("//:after")).unwrap();
  assert_eq!(after.status, BuildStatus::Cancelled);
  assert_eq!(
    after.error,
    Some(BuildError::Cancelled {
      reason: CancelReason::Requested,
    })
  );
}
