use std::collections::BTreeMap;

use fedplan::errors::FedplanError;
use fedplan::models::{
    AssetKind, ComputePlan, ComputePlanStatus, DataSample, Dataset, OutModel, OutputValue,
    Permissions, Task, TaskCategory, TaskErrorType, TaskStatus,
};
use fedplan::schemas::{
    ComputePlanBatches, ComputePlanRequest, ComputeTaskOutputRequest, TaskRequest,
    UpdateComputePlanTasksRequest, UpdateRequest,
};
use fedplan::store::filters;
use fedplan_test_utils::builders::{FunctionBuilder, LocalFixture, ORG, PlanTaskBuilder};
use fedplan_test_utils::fake_spawner::{FakeFailure, FakeSpawner};
use fedplan_test_utils::{init_tracing, with_timeout};

struct Assets {
    dataset: String,
    sample: String,
    train: String,
}

async fn seed(fx: &LocalFixture) -> Assets {
    let dataset = fx.dataset("mnist").await;
    let sample = fx.data_sample("train-0", &[&dataset]).await;
    let train = fx.function(FunctionBuilder::train("train")).await;
    Assets {
        dataset,
        sample,
        train,
    }
}

fn train_request(assets: &Assets, permissions: Permissions) -> TaskRequest {
    TaskRequest {
        key: None,
        category: TaskCategory::Train,
        function_key: assets.train.clone(),
        worker: ORG.to_string(),
        compute_plan_key: None,
        rank: None,
        inputs: PlanTaskBuilder::new("unused", &assets.train)
            .asset("opener", &assets.dataset)
            .asset("datasamples", &assets.sample)
            .build()
            .inputs,
        outputs: BTreeMap::from([(
            "model".to_string(),
            ComputeTaskOutputRequest {
                permissions,
                transient: false,
            },
        )]),
        metadata: Default::default(),
        tag: String::new(),
    }
}

fn train_task(id: &str, assets: &Assets) -> PlanTaskBuilder {
    PlanTaskBuilder::new(id, &assets.train)
        .asset("opener", &assets.dataset)
        .asset("datasamples", &assets.sample)
        .output("model")
}

async fn plan_tasks(fx: &LocalFixture, plan_key: &str) -> BTreeMap<String, Task> {
    fx.client
        .list::<Task>(&filters([("compute_plan_key", vec![plan_key])]), None, true)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.key.clone(), t))
        .collect()
}

#[tokio::test]
async fn single_train_task_runs_to_done() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    let task_key = with_timeout(
        fx.client
            .add_task(train_request(&assets, Permissions::public())),
    )
    .await
    .unwrap();

    let task: Task = fx.client.get(&task_key).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.rank, 0);
    assert!(task.start_date.is_some() && task.end_date.is_some());

    let model = match &task.outputs["model"].value {
        Some(OutputValue::Model(model)) => model.clone(),
        other => panic!("expected a model output, got {other:?}"),
    };
    let expected = blake3::hash(b"model model rank=0").to_hex().to_string();
    assert_eq!(model.address.checksum, expected);
    assert_eq!(model.owner, ORG);
    let stored: OutModel = fx.client.get(&model.key).await.unwrap();
    assert_eq!(stored, model);

    let plan: ComputePlan = fx.client.get(&task.compute_plan_key).await.unwrap();
    assert_eq!(plan.task_count, 1);
    assert_eq!(plan.done_count, 1);
    assert_eq!(plan.status, ComputePlanStatus::Done);
    assert!(plan.counters_consistent());
    assert_eq!(plan.name, format!("compute plan of task {task_key}"));
}

#[tokio::test]
async fn spawner_receives_staged_inputs_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    let task_key = fx
        .client
        .add_task(train_request(&assets, Permissions::public()))
        .await
        .unwrap();

    let requests = fx.spawner.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(FakeSpawner::task_key(request).as_deref(), Some(task_key.as_str()));
    assert_eq!(FakeSpawner::arg(request, "--rank").as_deref(), Some("0"));
    assert!(request.name.starts_with("function-"));

    let inputs: serde_json::Value =
        serde_json::from_str(&FakeSpawner::arg(request, "--inputs").unwrap()).unwrap();
    let ids: Vec<&str> = inputs
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"opener"));
    assert!(ids.contains(&"datasamples"));

    let samples = request.data_sample_paths.as_ref().unwrap();
    assert!(samples.contains_key(&assets.sample));
    assert!(!request.command_template.iter().any(|a| a == "--fake-data"));
}

#[tokio::test]
async fn remote_dataset_switches_to_fake_data() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    {
        let mut store = fedplan::store::lock_store(&fx.store).unwrap();
        let mut dataset: Dataset = store.get(&assets.dataset).unwrap();
        dataset.is_remote = true;
        store.replace(dataset).unwrap();
    }

    fx.client
        .add_task(train_request(&assets, Permissions::public()))
        .await
        .unwrap();

    let request = &fx.spawner.requests()[0];
    assert!(request.command_template.iter().any(|a| a == "--fake-data"));
    assert_eq!(
        FakeSpawner::arg(request, "--n-fake-samples").as_deref(),
        Some("1")
    );
    assert!(request.data_sample_paths.is_none());
}

#[tokio::test]
async fn output_permissions_are_copied_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let restricted = Permissions::restricted_to(["OrgA"]);

    let task_key = fx
        .client
        .add_task(train_request(&assets, restricted.clone()))
        .await
        .unwrap();

    let task: Task = fx.client.get(&task_key).await.unwrap();
    let Some(OutputValue::Model(model)) = &task.outputs["model"].value else {
        panic!("missing model output");
    };
    assert_eq!(model.permissions, restricted);
}

#[tokio::test]
async fn task_inputs_are_resolved_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    let task_key = fx
        .client
        .add_task(train_request(&assets, Permissions::public()))
        .await
        .unwrap();

    let dataset: Dataset = fx.client.get(&assets.dataset).await.unwrap();
    let task: Task = fx.client.get(&task_key).await.unwrap();
    let opener = task.inputs.iter().find(|i| i.identifier == "opener").unwrap();
    assert_eq!(opener.addressable.as_ref(), Some(&dataset.opener));
    assert_eq!(opener.permissions.as_ref(), Some(&dataset.permissions));
}

#[tokio::test]
async fn mismatched_outputs_list_the_difference() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    let mut request = train_request(&assets, Permissions::public());
    request.outputs.insert(
        "extra".to_string(),
        ComputeTaskOutputRequest {
            permissions: Permissions::public(),
            transient: false,
        },
    );

    let err = fx.client.add_task(request).await.unwrap_err();
    match err {
        FedplanError::InvalidRequest(msg) => {
            assert!(msg.contains("extra"), "{msg}");
            assert!(!msg.contains("\"model\""), "{msg}");
        }
        other => panic!("expected InvalidRequest, got {other:?}"),
    }
    assert_eq!(fx.spawner.call_count(), 0);
}

#[tokio::test]
async fn child_task_without_plan_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let parent = fx
        .client
        .add_task(train_request(&assets, Permissions::public()))
        .await
        .unwrap();

    let mut request = train_request(&assets, Permissions::public());
    request.inputs.push(
        PlanTaskBuilder::new("x", &assets.train)
            .parent("models", &parent, "model")
            .build()
            .inputs
            .remove(0),
    );
    let err = fx.client.add_task(request).await.unwrap_err();
    assert!(matches!(err, FedplanError::InvalidRequest(_)));
}

#[tokio::test]
async fn compute_plan_runs_in_rank_order() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let aggregate = fx.function(FunctionBuilder::aggregate("avg")).await;

    let request = ComputePlanRequest {
        key: Some("plan-1".into()),
        name: "two rounds".into(),
        tag: String::new(),
        metadata: Default::default(),
        delete_intermediary_models: false,
        batches: ComputePlanBatches {
            aggregate_tasks: vec![
                PlanTaskBuilder::new("agg", &aggregate)
                    .parent("models", "train-a", "model")
                    .parent("models", "train-b", "model")
                    .output("model")
                    .build(),
            ],
            train_tasks: vec![
                train_task("train-a", &assets).build(),
                train_task("train-b", &assets).worker("OrgB").build(),
                train_task("train-c", &assets)
                    .parent("models", "agg", "model")
                    .build(),
            ],
            ..Default::default()
        },
    };

    let plan = with_timeout(fx.client.add_compute_plan(request)).await.unwrap();
    assert_eq!(plan.status, ComputePlanStatus::Done);
    assert_eq!(plan.task_count, 4);
    assert_eq!(plan.done_count, 4);

    let tasks = plan_tasks(&fx, "plan-1").await;
    assert_eq!(tasks["train-a"].rank, 0);
    assert_eq!(tasks["agg"].rank, 1);
    assert_eq!(tasks["train-c"].rank, 2);

    let order: Vec<String> = fx
        .spawner
        .requests()
        .iter()
        .filter_map(FakeSpawner::task_key)
        .collect();
    assert_eq!(order.len(), 4);
    assert_eq!(order[2], "agg");
    assert_eq!(order[3], "train-c");

    // The aggregate received both parent models.
    let agg_inputs: serde_json::Value = serde_json::from_str(
        &FakeSpawner::arg(&fx.spawner.requests()[2], "--inputs").unwrap(),
    )
    .unwrap();
    let models = agg_inputs
        .as_array()
        .unwrap()
        .iter()
        .filter(|i| i["id"] == "models")
        .count();
    assert_eq!(models, 2);

    let orgs = fx.client.list_organizations().await.unwrap();
    assert!(orgs.iter().any(|o| o.id == ORG && o.is_current));
    assert!(orgs.iter().any(|o| o.id == "OrgB" && !o.is_current));
}

#[tokio::test]
async fn cycles_abort_the_submission_before_anything_runs() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    let request = ComputePlanRequest {
        key: Some("cyclic".into()),
        name: "cyclic".into(),
        tag: String::new(),
        metadata: Default::default(),
        delete_intermediary_models: false,
        batches: ComputePlanBatches {
            train_tasks: vec![
                train_task("a", &assets).parent("models", "b", "model").build(),
                train_task("b", &assets).parent("models", "a", "model").build(),
            ],
            ..Default::default()
        },
    };

    let err = fx.client.add_compute_plan(request).await.unwrap_err();
    assert!(matches!(err, FedplanError::InvalidRequest(_)));
    assert_eq!(fx.spawner.call_count(), 0);
    assert!(matches!(
        fx.client.get::<ComputePlan>("cyclic").await,
        Err(FedplanError::NotFound(_))
    ));
}

#[tokio::test]
async fn first_failure_stops_the_plan() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let aggregate = fx.function(FunctionBuilder::aggregate("avg")).await;
    fx.spawner.fail_on_call(2, FakeFailure::Execution);

    let request = ComputePlanRequest {
        key: Some("plan-f".into()),
        name: "fails".into(),
        tag: String::new(),
        metadata: Default::default(),
        delete_intermediary_models: false,
        batches: ComputePlanBatches {
            train_tasks: vec![
                train_task("train-a", &assets).build(),
                train_task("train-b", &assets).build(),
            ],
            aggregate_tasks: vec![
                PlanTaskBuilder::new("agg", &aggregate)
                    .parent("models", "train-a", "model")
                    .parent("models", "train-b", "model")
                    .output("model")
                    .build(),
            ],
            ..Default::default()
        },
    };

    let err = fx.client.add_compute_plan(request).await.unwrap_err();
    assert!(matches!(err, FedplanError::ExecutionError { .. }), "{err:?}");
    assert_eq!(fx.spawner.call_count(), 2);

    let tasks = plan_tasks(&fx, "plan-f").await;
    assert_eq!(tasks["train-a"].status, TaskStatus::Done);
    assert_eq!(tasks["train-b"].status, TaskStatus::Failed);
    assert_eq!(tasks["train-b"].error_type, Some(TaskErrorType::Execution));
    assert_eq!(tasks["agg"].status, TaskStatus::Canceled);

    let plan: ComputePlan = fx.client.get("plan-f").await.unwrap();
    assert_eq!(plan.status, ComputePlanStatus::Failed);
    assert_eq!(
        (plan.done_count, plan.failed_count, plan.canceled_count),
        (1, 1, 1)
    );
    assert!(plan.counters_consistent());
    assert!(plan.end_date.is_some());

    // A failed plan accepts no new tasks.
    let err = fx
        .client
        .add_compute_plan_tasks(UpdateComputePlanTasksRequest {
            key: "plan-f".into(),
            batches: ComputePlanBatches {
                train_tasks: vec![train_task("late", &assets).build()],
                ..Default::default()
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FedplanError::InvalidRequest(_)));
}

#[tokio::test]
async fn build_failures_are_recorded_as_build_errors() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    fx.spawner.fail_on_call(1, FakeFailure::Build);

    let err = fx
        .client
        .add_task(train_request(&assets, Permissions::public()))
        .await
        .unwrap_err();
    assert!(matches!(err, FedplanError::BuildError { .. }));

    let tasks: Vec<Task> = fx.client.list(&Default::default(), None, true).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].error_type, Some(TaskErrorType::Build));
}

#[tokio::test]
async fn missing_output_file_fails_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    fx.spawner.skip_outputs();

    let err = fx
        .client
        .add_task(train_request(&assets, Permissions::public()))
        .await
        .unwrap_err();
    assert!(matches!(err, FedplanError::ExecutionError { .. }));

    let tasks: Vec<Task> = fx.client.list(&Default::default(), None, true).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(fx.client.list::<OutModel>(&Default::default(), None, true).await.unwrap().is_empty());
}

#[tokio::test]
async fn extending_a_plan_ranks_new_tasks_after_existing_ones() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let aggregate = fx.function(FunctionBuilder::aggregate("avg")).await;

    let request = ComputePlanRequest {
        key: Some("plan-x".into()),
        name: "grows".into(),
        tag: String::new(),
        metadata: Default::default(),
        delete_intermediary_models: false,
        batches: ComputePlanBatches {
            train_tasks: vec![train_task("r0", &assets).build()],
            ..Default::default()
        },
    };
    fx.client.add_compute_plan(request).await.unwrap();

    let plan = fx
        .client
        .add_compute_plan_tasks(UpdateComputePlanTasksRequest {
            key: "plan-x".into(),
            batches: ComputePlanBatches {
                aggregate_tasks: vec![
                    PlanTaskBuilder::new("r1", &aggregate)
                        .parent("models", "r0", "model")
                        .output("model")
                        .build(),
                ],
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(plan.task_count, 2);
    assert_eq!(plan.done_count, 2);
    assert_eq!(plan.status, ComputePlanStatus::Done);
    let tasks = plan_tasks(&fx, "plan-x").await;
    assert_eq!(tasks["r1"].rank, 1);
}

#[tokio::test]
async fn performances_are_collected_and_snapshotted() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let metric = fx.function(FunctionBuilder::metric("accuracy")).await;
    fx.spawner.set_performance(0.875);

    let request = ComputePlanRequest {
        key: Some("plan-p".into()),
        name: "scored".into(),
        tag: String::new(),
        metadata: Default::default(),
        delete_intermediary_models: false,
        batches: ComputePlanBatches {
            train_tasks: vec![train_task("train", &assets).build()],
            test_tasks: vec![
                PlanTaskBuilder::new("test", &metric)
                    .asset("opener", &assets.dataset)
                    .asset("datasamples", &assets.sample)
                    .parent("model", "train", "model")
                    .output("performance")
                    .metadata("round_idx", "1")
                    .build(),
            ],
            ..Default::default()
        },
    };
    fx.client.add_compute_plan(request).await.unwrap();

    let performances = fx.client.get_performances("plan-p").await.unwrap();
    assert_eq!(performances.entries.len(), 1);
    let entry = &performances.entries[0];
    assert_eq!(entry.compute_task_key, "test");
    assert_eq!(entry.identifier, "performance");
    assert_eq!(entry.rank, 1);
    assert_eq!(entry.round_idx.as_deref(), Some("1"));
    assert!((entry.performance - 0.875).abs() < f64::EPSILON);

    let snapshot = fx
        .worker_dir()
        .join("live_performances/plan-p/performances.json");
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(snapshot).unwrap()).unwrap();
    assert_eq!(on_disk["entries"][0]["compute_task_key"], "test");

    // The performance file is kept next to the task's other outputs.
    let kept: Vec<_> = std::fs::read_dir(fx.worker_dir().join("outputs/test"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(kept.len(), 1);
    let raw = std::fs::read_to_string(&kept[0]).unwrap();
    assert!((raw.trim().parse::<f64>().unwrap() - 0.875).abs() < f64::EPSILON);
}

#[tokio::test]
async fn canceling_an_empty_plan_closes_it() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    let plan = fx
        .client
        .add_compute_plan(ComputePlanRequest {
            key: Some("plan-c".into()),
            name: "idle".into(),
            tag: String::new(),
            metadata: Default::default(),
            delete_intermediary_models: false,
            batches: Default::default(),
        })
        .await
        .unwrap();
    assert_eq!(plan.status, ComputePlanStatus::Empty);

    let canceled = fx.client.cancel_compute_plan("plan-c").await.unwrap();
    assert_eq!(canceled.status, ComputePlanStatus::Canceled);
    assert!(canceled.end_date.is_some());

    // Terminal plans cannot be canceled again or extended.
    assert!(matches!(
        fx.client.cancel_compute_plan("plan-c").await,
        Err(FedplanError::InvalidRequest(_))
    ));
    let err = fx
        .client
        .add_compute_plan_tasks(UpdateComputePlanTasksRequest {
            key: "plan-c".into(),
            batches: ComputePlanBatches {
                train_tasks: vec![train_task("t", &assets).build()],
                ..Default::default()
            },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FedplanError::InvalidRequest(_)));
    assert_eq!(fx.spawner.call_count(), 0);
}

#[tokio::test]
async fn link_and_unlink_update_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;
    let other = fx.dataset("other").await;

    let linked = fx
        .client
        .link_dataset_with_data_samples(&other, &[assets.sample.clone()])
        .await
        .unwrap();
    assert_eq!(linked, vec![assets.sample.clone()]);

    let sample: DataSample = fx.client.get(&assets.sample).await.unwrap();
    assert_eq!(sample.data_manager_keys, vec![assets.dataset.clone(), other.clone()]);
    let other_ds: Dataset = fx.client.get(&other).await.unwrap();
    assert_eq!(other_ds.data_sample_keys, vec![assets.sample.clone()]);

    let unlinked = fx
        .client
        .unlink_dataset_with_data_samples(&assets.dataset, &[assets.sample.clone()])
        .await
        .unwrap();
    assert_eq!(unlinked, vec![assets.sample.clone()]);

    let sample: DataSample = fx.client.get(&assets.sample).await.unwrap();
    assert_eq!(sample.data_manager_keys, vec![other.clone()]);
    let original: Dataset = fx.client.get(&assets.dataset).await.unwrap();
    assert!(original.data_sample_keys.is_empty());

    // Unlinking again reports nothing.
    let again = fx
        .client
        .unlink_dataset_with_data_samples(&assets.dataset, &[assets.sample.clone()])
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn data_sample_needs_a_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());

    let request = fedplan_test_utils::builders::data_sample_request(dir.path(), "orphan", &[]);
    let err = fx.client.add_data_sample(request).await.unwrap_err();
    assert!(matches!(err, FedplanError::InvalidRequest(_)));

    let request =
        fedplan_test_utils::builders::data_sample_request(dir.path(), "lost", &["missing"]);
    let err = fx.client.add_data_sample(request).await.unwrap_err();
    assert!(matches!(err, FedplanError::NotFound(_)));
}

#[tokio::test]
async fn update_describe_and_download() {
    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::new(dir.path());
    let assets = seed(&fx).await;

    fx.client
        .update(
            AssetKind::Dataset,
            &assets.dataset,
            UpdateRequest {
                name: Some("mnist v2".into()),
                metadata: Some([("version".to_string(), "2".to_string())].into()),
            },
        )
        .await
        .unwrap();
    let dataset: Dataset = fx.client.get(&assets.dataset).await.unwrap();
    assert_eq!(dataset.name, "mnist v2");
    assert_eq!(dataset.metadata["version"], "2");

    let err = fx
        .client
        .update(AssetKind::DataSample, &assets.sample, UpdateRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FedplanError::InvalidRequest(_)));

    let description = fx
        .client
        .describe(AssetKind::Dataset, &assets.dataset)
        .await
        .unwrap();
    assert_eq!(description, "# mnist\n");
    assert!(matches!(
        fx.client.describe(AssetKind::Function, &assets.train).await,
        Err(FedplanError::NotFound(_))
    ));

    let dest = tempfile::tempdir().unwrap();
    let opener = fx
        .client
        .download(AssetKind::Dataset, &assets.dataset, dest.path())
        .await
        .unwrap();
    assert_eq!(opener, dest.path().join("opener.py"));
    assert_eq!(
        std::fs::read_to_string(&opener).unwrap(),
        "# opener for mnist\n"
    );

    let archive = fx
        .client
        .download(AssetKind::Function, &assets.train, dest.path())
        .await
        .unwrap();
    assert!(archive.join("Dockerfile").is_file());
}
