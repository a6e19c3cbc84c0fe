use super::*;
use crate::ops::{ManageCommand, MapOp, NamedOp, SketchOp};
use crate::partial::PartialResult;
use crate::scheduler::OpContext;
use crate::stream::PartialStream;
use pdq_common::{PdqError, Result, RuntimeConfig};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

fn test_ctx() -> OpContext {
    static CTX: OnceLock<OpContext> = OnceLock::new();
    CTX.get_or_init(|| {
        OpContext::new(&RuntimeConfig {
            compute_pool_size: 2,
            ..RuntimeConfig::default()
        })
        .expect("context")
    })
    .clone()
}

async fn drain<R>(stream: PartialStream<R>) -> (Vec<R>, Result<()>)
where
    R: Send + 'static,
{
    stream.subscribe().drain().await
}

fn delta_sum<R>(partials: &[PartialResult<R>]) -> f64 {
    partials.iter().map(|p| p.delta_done).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SumSketch;

impl NamedOp for SumSketch {
    const NAME: &'static str = "sum";
}

impl SketchOp<i64> for SumSketch {
    type Out = i64;

    fn zero(&self) -> i64 {
        0
    }

    fn create(&self, value: &i64) -> Result<i64> {
        Ok(*value)
    }

    fn add(&self, left: i64, right: i64) -> Result<i64> {
        Ok(left + right)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimesTen;

impl NamedOp for TimesTen {
    const NAME: &'static str = "times_ten";
}

impl MapOp<i64> for TimesTen {
    type Out = i64;

    fn apply(&self, value: &i64) -> Result<i64> {
        Ok(value * 10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlusOne;

impl NamedOp for PlusOne {
    const NAME: &'static str = "plus_one";
}

impl MapOp<i64> for PlusOne {
    type Out = i64;

    fn apply(&self, value: &i64) -> Result<i64> {
        Ok(value + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlusOneTimesTen;

impl NamedOp for PlusOneTimesTen {
    const NAME: &'static str = "plus_one_times_ten";
}

impl MapOp<i64> for PlusOneTimesTen {
    type Out = i64;

    fn apply(&self, value: &i64) -> Result<i64> {
        Ok((value + 1) * 10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Duplicate;

impl NamedOp for Duplicate {
    const NAME: &'static str = "duplicate";
}

impl MapOp<i64> for Duplicate {
    type Out = Vec<i64>;

    fn apply(&self, value: &i64) -> Result<Vec<i64>> {
        Ok(vec![*value, *value])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DropAll;

impl NamedOp for DropAll {
    const NAME: &'static str = "drop_all";
}

impl MapOp<i64> for DropAll {
    type Out = Vec<i64>;

    fn apply(&self, _value: &i64) -> Result<Vec<i64>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailOnThirteen;

impl NamedOp for FailOnThirteen {
    const NAME: &'static str = "fail_on_thirteen";
}

impl MapOp<i64> for FailOnThirteen {
    type Out = i64;

    fn apply(&self, value: &i64) -> Result<i64> {
        if *value == 13 {
            Err(PdqError::UserCode("unlucky value".to_string()))
        } else {
            Ok(*value)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SwapPair;

impl NamedOp for SwapPair {
    const NAME: &'static str = "swap_pair";
}

impl MapOp<(i64, String)> for SwapPair {
    type Out = (String, i64);

    fn apply(&self, value: &(i64, String)) -> Result<(String, i64)> {
        Ok((value.1.clone(), value.0))
    }
}

async fn final_handle<T: Wire>(
    stream: PartialStream<PartialResult<Arc<DataSet<T>>>>,
) -> Result<Arc<DataSet<T>>> {
    let (items, outcome) = drain(stream).await;
    outcome?;
    items
        .into_iter()
        .filter_map(|p| p.payload)
        .last()
        .ok_or_else(|| PdqError::Execution("no handle produced".to_string()))
}

#[tokio::test]
async fn local_sketch_emits_zero_then_value() {
    let ctx = test_ctx();
    let dataset = DataSet::local(5i64);
    let (items, outcome) = drain(dataset.sketch(&Arc::new(SumSketch), &ctx)).await;
    outcome.expect("sketch completes");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].delta_done, 0.0);
    assert_eq!(items[0].payload, Some(0));
    assert_eq!(items[1].delta_done, 1.0);
    assert_eq!(items[1].payload, Some(5));
}

#[tokio::test]
async fn parallel_sketch_merges_and_sums_progress() {
    let ctx = test_ctx();
    let dataset = DataSet::parallel(vec![
        DataSet::local(1i64),
        DataSet::local(2),
        DataSet::local(3),
    ]);
    let (items, outcome) = drain(dataset.sketch(&Arc::new(SumSketch), &ctx)).await;
    outcome.expect("sketch completes");
    // Initial zero plus one forwarded item per child.
    assert_eq!(items.len(), 4);
    assert_eq!(items[0].delta_done, 0.0);
    assert_eq!(items[0].payload, Some(0));
    assert!((delta_sum(&items) - 1.0).abs() < 1e-9);
    assert_eq!(items.last().expect("final item").payload, Some(6));
}

#[tokio::test]
async fn parallel_map_preserves_positional_order() {
    let ctx = test_ctx();
    let dataset = DataSet::parallel(vec![DataSet::local(1i64), DataSet::local(2)]);
    let stream = dataset.map(&Arc::new(TimesTen), &ctx);
    let (items, outcome) = drain(stream).await;
    outcome.expect("map completes");
    assert!((delta_sum(&items) - 1.0).abs() < 1e-9);
    let handle = items
        .into_iter()
        .filter_map(|p| p.payload)
        .last()
        .expect("assembled handle");
    assert_eq!(handle.collect_leaves().expect("leaves"), vec![10, 20]);
}

#[tokio::test]
async fn local_zip_pairs_values_in_one_emission() {
    let ctx = test_ctx();
    let left = DataSet::local(1i64);
    let right = DataSet::local("a".to_string());
    let (items, outcome) = drain(left.zip(&right, &ctx)).await;
    outcome.expect("zip completes");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].delta_done, 1.0);
    let handle = items[0].payload.as_ref().expect("pair handle");
    assert_eq!(
        handle.local_value().expect("local pair"),
        &(1i64, "a".to_string())
    );
}

#[tokio::test]
async fn zip_between_local_and_parallel_is_a_type_mismatch() {
    let ctx = test_ctx();
    let left = DataSet::local(1i64);
    let right = DataSet::parallel(vec![DataSet::local("a".to_string())]);
    let (items, outcome) = drain(left.zip(&right, &ctx)).await;
    assert!(items.is_empty());
    assert!(matches!(outcome, Err(PdqError::TypeMismatch(_))));
}

#[tokio::test]
async fn parallel_zip_requires_equal_child_counts() {
    let ctx = test_ctx();
    let left = DataSet::parallel(vec![DataSet::local(1i64), DataSet::local(2)]);
    let right = DataSet::parallel(vec![DataSet::local("a".to_string())]);
    let (items, outcome) = drain(left.zip(&right, &ctx)).await;
    assert!(items.is_empty());
    assert!(matches!(outcome, Err(PdqError::ShapeMismatch(_))));
}

#[tokio::test]
async fn zip_swap_matches_reversed_zip() {
    let ctx = test_ctx();
    let numbers = DataSet::parallel(vec![DataSet::local(1i64), DataSet::local(2)]);
    let words = DataSet::parallel(vec![
        DataSet::local("a".to_string()),
        DataSet::local("b".to_string()),
    ]);

    let swapped = final_handle(
        final_handle(numbers.zip(&words, &ctx))
            .await
            .expect("zip handle")
            .map(&Arc::new(SwapPair), &ctx),
    )
    .await
    .expect("swap handle");
    let reversed = final_handle(words.zip(&numbers, &ctx))
        .await
        .expect("reversed handle");
    assert_eq!(
        swapped.collect_leaves().expect("swapped leaves"),
        reversed.collect_leaves().expect("reversed leaves")
    );
}

#[tokio::test]
async fn flat_map_flattens_one_level() {
    let ctx = test_ctx();
    let dataset = DataSet::parallel(vec![DataSet::local(1i64), DataSet::local(2)]);
    let handle = final_handle(dataset.flat_map(&Arc::new(Duplicate), &ctx))
        .await
        .expect("flat_map handle");
    assert_eq!(handle.collect_leaves().expect("leaves"), vec![1, 1, 2, 2]);
    // Flattened: children of the produced node are leaves, not nested
    // parallel nodes.
    let children = handle.children().expect("parallel result");
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|c| c.local_value().is_some()));
}

#[tokio::test]
async fn flat_map_of_empty_sequence_yields_empty_parallel() {
    let ctx = test_ctx();
    let dataset = DataSet::local(7i64);
    let handle = final_handle(dataset.flat_map(&Arc::new(DropAll), &ctx))
        .await
        .expect("flat_map handle");
    assert_eq!(handle.children().expect("parallel").len(), 0);
}

#[tokio::test]
async fn zero_child_parallel_behaves_neutrally() {
    let ctx = test_ctx();
    let empty: Arc<DataSet<i64>> = DataSet::parallel(Vec::new());

    let (items, outcome) = drain(empty.sketch(&Arc::new(SumSketch), &ctx)).await;
    outcome.expect("sketch completes");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].delta_done, 1.0);
    assert_eq!(items[0].payload, Some(0));

    let handle = final_handle(empty.map(&Arc::new(TimesTen), &ctx))
        .await
        .expect("map handle");
    assert_eq!(handle.children().expect("parallel").len(), 0);
}

#[tokio::test]
async fn failing_child_terminates_parallel_map() {
    let ctx = test_ctx();
    let dataset = DataSet::parallel(vec![
        DataSet::local(1i64),
        DataSet::local(13),
        DataSet::local(3),
    ]);
    let (_, outcome) = drain(dataset.map(&Arc::new(FailOnThirteen), &ctx)).await;
    match outcome {
        Err(PdqError::UserCode(message)) => assert!(message.contains("unlucky")),
        other => panic!("expected user code failure, got {other:?}"),
    }
}

#[tokio::test]
async fn map_functoriality_holds_on_final_content() {
    let ctx = test_ctx();
    let dataset = DataSet::parallel(vec![
        DataSet::local(1i64),
        DataSet::local(2),
        DataSet::local(3),
    ]);

    let chained = final_handle(
        final_handle(dataset.map(&Arc::new(PlusOne), &ctx))
            .await
            .expect("first map")
            .map(&Arc::new(TimesTen), &ctx),
    )
    .await
    .expect("second map");
    let composed = final_handle(dataset.map(&Arc::new(PlusOneTimesTen), &ctx))
        .await
        .expect("composed map");
    assert_eq!(
        chained.collect_leaves().expect("chained leaves"),
        composed.collect_leaves().expect("composed leaves")
    );
}

#[tokio::test]
async fn manage_reports_one_status_per_node() {
    let ctx = test_ctx();
    let dataset = DataSet::parallel(vec![DataSet::local(1i64), DataSet::local(2)]);
    let (items, outcome) = drain(dataset.manage(ManageCommand::Ping, &ctx)).await;
    outcome.expect("manage completes");
    let statuses: Vec<_> = items.iter().filter_map(|p| p.payload.clone()).collect();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|s| s.result == "ok"));
    assert_eq!(
        statuses
            .iter()
            .filter(|s| s.node.starts_with("parallel"))
            .count(),
        1
    );
    assert!((delta_sum(&items) - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn inline_local_dataset_still_completes() {
    let ctx = test_ctx();
    let dataset = DataSet::local_inline(4i64);
    let (items, outcome) = drain(dataset.sketch(&Arc::new(SumSketch), &ctx)).await;
    outcome.expect("sketch completes");
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].payload, Some(4));
}

#[derive(Debug, Clone)]
enum TreeSpec {
    Leaf(i64),
    Node(Vec<TreeSpec>),
}

impl TreeSpec {
    fn build(&self) -> Arc<DataSet<i64>> {
        match self {
            TreeSpec::Leaf(value) => DataSet::local_inline(*value),
            TreeSpec::Node(children) => {
                DataSet::parallel(children.iter().map(TreeSpec::build).collect())
            }
        }
    }

    fn leaf_sum(&self) -> i64 {
        match self {
            TreeSpec::Leaf(value) => *value,
            TreeSpec::Node(children) => children.iter().map(TreeSpec::leaf_sum).sum(),
        }
    }
}

fn tree_strategy() -> impl Strategy<Value = TreeSpec> {
    let leaf = any::<i8>().prop_map(|v| TreeSpec::Leaf(v as i64));
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(TreeSpec::Node)
    })
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_sketch_progress_sums_to_one(spec in tree_strategy()) {
        let (items, outcome) = block_on(async {
            let ctx = test_ctx();
            drain(spec.build().sketch(&Arc::new(SumSketch), &ctx)).await
        });
        prop_assert!(outcome.is_ok());
        prop_assert!((delta_sum(&items) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn prop_sketch_final_equals_leaf_fold(spec in tree_strategy()) {
        let expected = spec.leaf_sum();
        let (items, outcome) = block_on(async {
            let ctx = test_ctx();
            drain(spec.build().sketch(&Arc::new(SumSketch), &ctx)).await
        });
        prop_assert!(outcome.is_ok());
        let last = items.last().expect("at least the zero item");
        prop_assert_eq!(last.payload, Some(expected));
    }

    #[test]
    fn prop_map_progress_sums_to_one(spec in tree_strategy()) {
        let (items, outcome) = block_on(async {
            let ctx = test_ctx();
            drain(spec.build().map(&Arc::new(TimesTen), &ctx)).await
        });
        prop_assert!(outcome.is_ok());
        prop_assert!((delta_sum(&items) - 1.0).abs() < 1e-9);
    }
}
