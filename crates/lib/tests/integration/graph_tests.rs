use std::sync::Arc;

use kiln_lib::cache::MemoryCache;
use kiln_lib::{GraphError, RuleGraph};

use super::common::{Cell, genrule, t};

#[tokio::test]
async fn cycle_is_rejected_before_anything_runs() {
  let cell = Cell::new();
  let rules = vec![
    genrule("//:x", "echo x > $OUT", &[], "x.txt")
      .declared_dep(t("//:y"))
      .build()
      .unwrap(),
    genrule("//:y", "echo y > $OUT", &[], "y.txt")
      .declared_dep(t("//:x"))
      .build()
      .unwrap(),
    genrule("//:z", "echo z > $OUT", &[], "z.txt").build().unwrap(),
  ];
  let engine = cell.engine(rules, Arc::new(MemoryCache::new()));
  let mut events = engine.subscribe();

  let err = engine.build(&[t("//:z"), t("//:x")]).await.unwrap_err();

  match &err {
    GraphError::CyclicDependency { cycle } => {
      assert!(cycle.contains(&t("//:x")));
      assert!(cycle.contains(&t("//:y")));
      assert_eq!(cycle.first(), cycle.last());
    }
    other => panic!("expected a cycle, got {:?}", other),
  }
  assert!(err.to_string().contains("//:x -> //:y -> //:x"));
  assert!(events.try_recv().is_err(), "no rule may be scheduled");
  assert!(!cell.config().output_root.exists());
}

#[test]
fn incremental_registration_requires_known_dependencies() {
  let mut graph = RuleGraph::new();
  let app = genrule("//app:bin", "true", &[], "bin").declared_dep(t("//lib:core")).build().unwrap();

  let err = graph.add_rule(app.clone()).unwrap_err();
  assert_eq!(
    err,
    GraphError::MissingDependency {
      dependent: t("//app:bin"),
      missing: t("//lib:core"),
    }
  );

  graph.add_rule(genrule("//lib:core", "true", &[], "core").build().unwrap()).unwrap();
  graph.add_rule(app).unwrap();
  assert_eq!(graph.topological_order().unwrap(), vec![t("//lib:core"), t("//app:bin")]);
}

#[test]
fn extra_dependencies_order_the_build_too() {
  let graph = RuleGraph::from_rules([
    genrule("//:consumer", "true", &[], "c").extra_dep(t("//:producer")).build().unwrap(),
    genrule("//:producer", "true", &[], "p").build().unwrap(),
  ])
  .unwrap();

  let closure = graph.transitive_closure(&[t("//:consumer")]).unwrap();
  assert!(closure.contains(&t("//:producer")));
  assert_eq!(graph.topological_order().unwrap(), vec![t("//:producer"), t("//:consumer")]);
}
