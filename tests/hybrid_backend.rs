use std::collections::BTreeMap;
use std::time::Duration;

use fedplan::backend::RemoteBackend;
use fedplan::errors::FedplanError;
use fedplan::models::{Dataset, Permissions, TaskCategory};
use fedplan::schemas::{ComputeTaskOutputRequest, TaskRequest};
use fedplan_test_utils::builders::{FunctionBuilder, LocalFixture, ORG, PlanTaskBuilder};
use fedplan_test_utils::fake_spawner::FakeSpawner;
use fedplan_test_utils::{init_tracing, with_timeout};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dataset_json(key: &str, name: &str) -> Value {
    json!({
        "key": key,
        "name": name,
        "owner": "OtherOrg",
        "opener": { "storage_address": format!("http://backend/data_manager/{key}/opener/"), "checksum": "abc" },
        "permissions": { "public": true, "authorized_ids": [] },
        "creation_date": "2024-01-01T00:00:00Z"
    })
}

fn remote(server: &MockServer) -> RemoteBackend {
    RemoteBackend::new(&server.uri(), None, false, Duration::from_millis(500))
        .unwrap()
        .with_poll_interval(Duration::from_millis(20))
}

fn train_request(function: &str, opener: &str, sample: &str) -> TaskRequest {
    TaskRequest {
        key: None,
        category: TaskCategory::Train,
        function_key: function.to_string(),
        worker: ORG.to_string(),
        compute_plan_key: None,
        rank: None,
        inputs: PlanTaskBuilder::new("unused", function)
            .asset("opener", opener)
            .asset("datasamples", sample)
            .build()
            .inputs,
        outputs: BTreeMap::from([(
            "model".to_string(),
            ComputeTaskOutputRequest {
                permissions: Permissions::public(),
                transient: false,
            },
        )]),
        metadata: Default::default(),
        tag: String::new(),
    }
}

#[tokio::test]
async fn remote_dataset_is_cached_and_runs_on_fake_data() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data_manager/remote-ds/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(dataset_json("remote-ds", "iris")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data_manager/remote-ds/opener/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("# remote opener\n"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::hybrid(dir.path(), remote(&server));
    let sample = fx.data_sample("local-0", &["remote-ds"]).await;
    let train = fx.function(FunctionBuilder::train("train")).await;

    with_timeout(fx.client.add_task(train_request(&train, "remote-ds", &sample)))
        .await
        .unwrap();

    let dataset: Dataset = fx.client.get("remote-ds").await.unwrap();
    assert!(dataset.is_remote);
    assert!(dataset.data_sample_keys.contains(&sample));
    let opener = std::fs::read_to_string(&dataset.opener.storage_address).unwrap();
    assert_eq!(opener, "# remote opener\n");

    let requests = fx.spawner.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.command_template.iter().any(|a| a == "--fake-data"));
    assert_eq!(
        FakeSpawner::arg(request, "--n-fake-samples").as_deref(),
        Some("1")
    );
    assert!(request.data_sample_paths.is_none());
}

#[tokio::test]
async fn remote_server_errors_reach_the_caller() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::hybrid(dir.path(), remote(&server));
    let dataset = fx.dataset("local-ds").await;
    let sample = fx.data_sample("local-0", &[&dataset]).await;
    let train = fx.function(FunctionBuilder::train("train")).await;

    let err = with_timeout(fx.client.add_task(train_request(&train, "remote-ds", &sample)))
        .await
        .unwrap_err();
    match err {
        FedplanError::HttpError { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected HttpError, got {other:?}"),
    }
    assert_eq!(fx.spawner.call_count(), 0);
}

#[tokio::test]
async fn merged_listing_keeps_the_requested_order() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data_manager/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next": null,
            "results": [dataset_json("r-alpha", "alpha"), dataset_json("r-gamma", "gamma")]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let fx = LocalFixture::hybrid(dir.path(), remote(&server));
    fx.dataset("beta").await;

    let names: Vec<String> = fx
        .client
        .list::<Dataset>(&Default::default(), Some("name"), true)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, ["alpha", "beta", "gamma"]);

    let descending: Vec<String> = fx
        .client
        .list::<Dataset>(&Default::default(), Some("name"), false)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(descending, ["gamma", "beta", "alpha"]);
}
