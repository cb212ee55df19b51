//! Extra dependencies order the build but never reach the rule key, and
//! their outputs are not handed to the dependent.
//!
//! A rule kind that reads an extra dependency's output anyway, by path, can
//! therefore be served a stale cache hit after that output changes. These
//! tests pin that behavior down next to the declared-dependency behavior it
//! contrasts with.

use std::sync::Arc;

use kiln_lib::cache::{ArtifactStore, MemoryCache};
use kiln_lib::{BuildStatus, Rule};

use super::common::{Cell, genrule, read, t};

fn tool_output(cell: &Cell) -> String {
  cell.scope(&t("//:tool")).join("tool.txt").display().to_string()
}

fn producer() -> Rule {
  genrule("//:tool", "cat $SRCS > $OUT", &["tool.src"], "tool.txt")
    .build()
    .unwrap()
}

fn consumer(cell: &Cell, declared: bool) -> Rule {
  let builder = if declared {
    genrule("//:consumer", "cat $DEPS > $OUT", &[], "copy.txt").declared_dep(t("//:tool"))
  } else {
    let cmd = format!("cat \"{}\" > $OUT", tool_output(cell));
    genrule("//:consumer", &cmd, &[], "copy.txt").extra_dep(t("//:tool"))
  };
  builder.build().unwrap()
}

async fn build_twice(declared: bool) -> (Cell, [kiln_lib::BuildReport; 2]) {
  let cell = Cell::new();
  let cache: Arc<dyn ArtifactStore> = Arc::new(MemoryCache::new());

  cell.write("tool.src", "v1\n");
  let engine = cell.engine(vec![producer(), consumer(&cell, declared)], cache.clone());
  let first = engine.build(&[t("//:consumer")]).await.unwrap();
  engine.wait_for_uploads().await;

  cell.write("tool.src", "v2\n");
  let engine = cell.engine(vec![producer(), consumer(&cell, declared)], cache);
  let second = engine.build(&[t("//:consumer")]).await.unwrap();
  engine.wait_for_uploads().await;

  (cell, [first, second])
}

#[tokio::test]
async fn changed_extra_dependency_leaves_key_unchanged() {
  let (cell, [first, second]) = build_twice(false).await;

  let tool = t("//:tool");
  assert_ne!(first.get(&tool).unwrap().rule_key, second.get(&tool).unwrap().rule_key);

  let consumer = t("//:consumer");
  assert_eq!(first.get(&consumer).unwrap().rule_key, second.get(&consumer).unwrap().rule_key);
  assert_eq!(second.get(&consumer).unwrap().status, BuildStatus::SuccessFromCache);
  // The stale hit: the producer now says v2, the consumer still holds v1.
  assert_eq!(read(&cell.scope(&tool).join("tool.txt")), "v2\n");
  assert_eq!(read(&cell.scope(&consumer).join("copy.txt")), "v1\n");
}

#[tokio::test]
async fn changed_declared_dependency_changes_key() {
  let (cell, [first, second]) = build_twice(true).await;

  let consumer = t("//:consumer");
  assert_ne!(first.get(&consumer).unwrap().rule_key, second.get(&consumer).unwrap().rule_key);
  assert_eq!(second.get(&consumer).unwrap().status, BuildStatus::SuccessBuiltLocally);
  assert_eq!(read(&cell.scope(&consumer).join("copy.txt")), "v2\n");
}

#[tokio::test]
async fn extra_dependency_outputs_are_not_passed_to_genrule() {
  let cell = Cell::new();
  cell.write("tool.src", "v1\n");
  let consumer = genrule("//:consumer", "echo \"[$DEPS]\" > $OUT", &[], "copy.txt")
    .extra_dep(t("//:tool"))
    .build()
    .unwrap();
  let engine = cell.engine(vec![producer(), consumer], Arc::new(MemoryCache::new()));

  let report = engine.build(&[t("//:consumer")]).await.unwrap();

  assert!(report.is_success());
  assert_eq!(read(&cell.scope(&t("//:consumer")).join("copy.txt")), "[]\n");
  assert_eq!(read(&cell.scope(&t("//:tool")).join("tool.txt")), "v1\n");
}
