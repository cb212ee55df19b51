use std::sync::Arc;

use kiln_lib::cache::{ArtifactStore, DirCache, MemoryCache};
use kiln_lib::{BuildStatus, Rule};

use super::common::{Cell, counted, genrule, read, t};

fn lib_rule() -> Rule {
  genrule("//:lib", &counted("lib", "cat $SRCS > $OUT"), &["a.txt"], "lib.txt")
    .build()
    .unwrap()
}

fn app_rule() -> Rule {
  genrule("//app:bin", &counted("app", "cat $DEPS > $OUT && echo app >> $OUT"), &[], "bin.txt")
    .declared_dep(t("//:lib"))
    .build()
    .unwrap()
}

#[tokio::test]
async fn builds_chain_and_passes_dependency_outputs() {
  let cell = Cell::new();
  cell.write("a.txt", "x\n");
  let engine = cell.engine(vec![lib_rule(), app_rule()], Arc::new(MemoryCache::new()));

  let report = engine.build(&[t("//app:bin")]).await.unwrap();

  assert!(report.is_success(), "{:?}", report);
  let bin = report.get(&t("//app:bin")).unwrap();
  assert_eq!(bin.status, BuildStatus::SuccessBuiltLocally);
  assert_eq!(bin.outputs, vec![cell.scope(&t("//app:bin")).join("bin.txt")]);
  assert_eq!(read(&bin.outputs[0]), "x\napp\n");
}

#[tokio::test]
async fn keys_are_identical_across_engines() {
  let cell = Cell::new();
  cell.write("a.txt", "x\n");

  let first = cell.engine(vec![lib_rule(), app_rule()], Arc::new(MemoryCache::new()));
  let first = first.build(&[t("//app:bin")]).await.unwrap();
  cell.wipe_outputs();
  let second = cell.engine(vec![lib_rule(), app_rule()], Arc::new(MemoryCache::new()));
  let second = second.build(&[t("//app:bin")]).await.unwrap();

  for target in [t("//:lib"), t("//app:bin")] {
    let a = first.get(&target).unwrap().rule_key;
    assert!(a.is_some());
    assert_eq!(a, second.get(&target).unwrap().rule_key, "{}", target);
  }
}

#[tokio::test]
async fn reverting_an_input_restores_its_key_and_hits_the_cache() {
  let cell = Cell::new();
  let cache_dir = cell.root().join("cache");
  let cache: Arc<dyn ArtifactStore> = Arc::new(DirCache::new(&cache_dir));

  cell.write("a.txt", "x");
  let engine = cell.engine(vec![lib_rule()], cache.clone());
  let report = engine.build(&[t("//:lib")]).await.unwrap();
  engine.wait_for_uploads().await;
  let k1 = report.get(&t("//:lib")).unwrap().rule_key.unwrap();
  assert_eq!(report.get(&t("//:lib")).unwrap().status, BuildStatus::SuccessBuiltLocally);

  cell.write("a.txt", "y");
  let engine = cell.engine(vec![lib_rule()], cache.clone());
  let report = engine.build(&[t("//:lib")]).await.unwrap();
  engine.wait_for_uploads().await;
  let k2 = report.get(&t("//:lib")).unwrap().rule_key.unwrap();
  assert_ne!(k1, k2);
  assert_eq!(read(&cell.scope(&t("//:lib")).join("lib.txt")), "y");

  cell.write("a.txt", "x");
  let engine = cell.engine(vec![lib_rule()], cache);
  let report = engine.build(&[t("//:lib")]).await.unwrap();
  let result = report.get(&t("//:lib")).unwrap();

  assert_eq!(result.rule_key, Some(k1));
  assert_eq!(result.status, BuildStatus::SuccessFromCache);
  assert_eq!(read(&result.outputs[0]), "x");
  assert_eq!(cell.runs("lib"), 2);
}

#[tokio::test]
async fn cache_hit_is_byte_identical_to_a_fresh_build() {
  let cell = Cell::new();
  let cache: Arc<dyn ArtifactStore> = Arc::new(DirCache::new(cell.root().join("cache")));
  let rule = || {
    genrule("//:blob", "mkdir -p $OUT && printf '\\000\\001\\377' > $OUT/data.bin && echo text > $OUT/notes.txt", &[], "blob")
      .build()
      .unwrap()
  };

  let engine = cell.engine(vec![rule()], cache.clone());
  engine.build(&[t("//:blob")]).await.unwrap();
  engine.wait_for_uploads().await;
  let scope = cell.scope(&t("//:blob"));
  let built_bin = std::fs::read(scope.join("blob/data.bin")).unwrap();
  let built_txt = std::fs::read(scope.join("blob/notes.txt")).unwrap();
  assert_eq!(built_bin, vec![0u8, 1, 255]);

  cell.wipe_outputs();
  let engine = cell.engine(vec![rule()], cache);
  let report = engine.build(&[t("//:blob")]).await.unwrap();

  assert_eq!(report.get(&t("//:blob")).unwrap().status, BuildStatus::SuccessFromCache);
  assert_eq!(std::fs::read(scope.join("blob/data.bin")).unwrap(), built_bin);
  assert_eq!(std::fs::read(scope.join("blob/notes.txt")).unwrap(), built_txt);
}

#[tokio::test]
async fn non_cacheable_rule_is_never_served_from_cache() {
  let cell = Cell::new();
  let cache = Arc::new(MemoryCache::new());
  let rule = || {
    genrule("//:stamp", &counted("stamp", "date > $OUT"), &[], "stamp.txt")
      .cacheable(false)
      .build()
      .unwrap()
  };

  for _ in 0..2 {
    let engine = cell.engine(vec![rule()], cache.clone());
    let report = engine.build(&[t("//:stamp")]).await.unwrap();
    engine.wait_for_uploads().await;
    assert_eq!(report.get(&t("//:stamp")).unwrap().status, BuildStatus::SuccessBuiltLocally);
  }

  assert_eq!(cell.runs("stamp"), 2);
  assert!(cache.is_empty());
}

#[tokio::test]
async fn unchanged_dependency_key_lets_dependent_hit() {
  let cell = Cell::new();
  let cache: Arc<dyn ArtifactStore> = Arc::new(MemoryCache::new());
  cell.write("a.txt", "x\n");

  let engine = cell.engine(vec![lib_rule(), app_rule()], cache.clone());
  engine.build(&[t("//app:bin")]).await.unwrap();
  engine.wait_for_uploads().await;

  cell.wipe_outputs();
  let engine = cell.engine(vec![lib_rule(), app_rule()], cache);
  let report = engine.build(&[t("//app:bin")]).await.unwrap();

  assert_eq!(report.count(BuildStatus::SuccessFromCache), 2);
  assert_eq!(cell.runs("lib"), 1);
  assert_eq!(cell.runs("app"), 1);
  assert_eq!(read(&cell.scope(&t("//app:bin")).join("bin.txt")), "x\napp\n");
}
