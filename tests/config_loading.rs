use std::fs;
use std::path::Path;

use fedplan::config::loader::{TOKEN_ENV_VAR, URL_ENV_VAR};
use fedplan::config::{RawWorkspaceFile, WorkspaceFile, apply_env_overrides, load_and_validate};
use fedplan::dag::ComputePlanBuilder;
use fedplan::errors::FedplanError;
use fedplan::models::{ComputePlanStatus, Task, TaskCategory, TaskStatus};
use fedplan::types::BackendType;
use fedplan::workspace::{RegisteredAssets, identity_task_keys, new_task_keys, plan_request, register_assets};
use fedplan_test_utils::builders::{LocalFixture, ORG};
use fedplan_test_utils::{init_tracing, with_timeout};

const WORKSPACE: &str = r#"
[client]
organization = "MyOrg1"

[[dataset]]
id = "iris"
name = "Iris"
opener = "assets/opener.py"

[[data_sample]]
id = "iris-train"
path = "data/train"
datasets = ["iris"]

[[function]]
id = "linear"
name = "linear"
category = "simple"
archive = "assets/linear"
inputs.opener = { kind = "data_manager" }
inputs.datasamples = { kind = "data_sample", multiple = true }
outputs.model = { kind = "model" }

[[function]]
id = "accuracy"
name = "accuracy"
category = "metric"
archive = "assets/accuracy"
inputs.opener = { kind = "data_manager" }
inputs.datasamples = { kind = "data_sample", multiple = true }
inputs.model = { kind = "model" }
outputs.performance = { kind = "performance" }

[compute_plan]
name = "demo"
tag = "nightly"

[[compute_plan.task]]
id = "evaluate"
category = "test"
function = "accuracy"
inputs = [
  { identifier = "opener", dataset = "iris" },
  { identifier = "datasamples", data_sample = "iris-train" },
  { identifier = "model", parent = "train", output = "model" },
]
outputs.performance = { permissions = { public = true } }

[[compute_plan.task]]
id = "train"
category = "train"
function = "linear"
inputs = [
  { identifier = "opener", dataset = "iris" },
  { identifier = "datasamples", data_sample = "iris-train" },
]
outputs.model = { permissions = { public = true } }
"#;

/// Lay out the files `WORKSPACE` refers to under `root`.
fn write_workspace(root: &Path, contents: &str) -> std::path::PathBuf {
    let assets = root.join("assets");
    fs::create_dir_all(root.join("data/train")).unwrap();
    fs::write(root.join("data/train/rows.csv"), "a,b\n1,2\n").unwrap();
    fs::create_dir_all(&assets).unwrap();
    fs::write(assets.join("opener.py"), "# opener\n").unwrap();
    for name in ["linear", "accuracy"] {
        let dir = assets.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("Dockerfile"),
            format!("ENTRYPOINT [\"python3\", \"algo.py\", \"--function-name\", \"{name}\"]\n"),
        )
        .unwrap();
        fs::write(dir.join("algo.py"), "print('ok')\n").unwrap();
    }

    let path = root.join("Fedplan.toml");
    fs::write(&path, contents).unwrap();
    path
}

fn parse(contents: &str) -> RawWorkspaceFile {
    toml::from_str(contents).unwrap()
}

fn config_error(contents: &str) -> String {
    match WorkspaceFile::try_from(parse(contents)) {
        Err(FedplanError::ConfigError(msg)) => msg,
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn loads_and_resolves_paths_against_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_workspace(dir.path(), WORKSPACE);

    let cfg = load_and_validate(&path).unwrap();

    assert_eq!(cfg.client.backend, BackendType::Subprocess);
    assert_eq!(cfg.client.retry_timeout_secs, 300);
    assert_eq!(cfg.root_dir, dir.path());
    assert_eq!(
        cfg.resolve(&cfg.dataset[0].opener),
        dir.path().join("assets/opener.py")
    );
    let plan = cfg.compute_plan.as_ref().unwrap();
    assert_eq!(plan.tag, "nightly");
    assert_eq!(plan.tasks.len(), 2);
}

#[test]
fn env_values_override_url_and_token() {
    let mut raw = parse("[client]\nurl = \"http://file\"\n");
    apply_env_overrides(&mut raw, |name| match name {
        n if n == URL_ENV_VAR => Some("http://env".to_string()),
        n if n == TOKEN_ENV_VAR => Some(String::new()),
        _ => None,
    });

    assert_eq!(raw.client.url.as_deref(), Some("http://env"));
    // Empty values are ignored.
    assert_eq!(raw.client.token, None);
}

#[test]
fn remote_backend_requires_a_url() {
    let msg = config_error("[client]\nbackend = \"remote\"\n");
    assert!(msg.contains("url"), "{msg}");

    let ok = WorkspaceFile::try_from(parse(
        "[client]\nbackend = \"remote\"\nurl = \"http://localhost:8000\"\n",
    ));
    assert!(ok.is_ok());
}

#[test]
fn hybrid_needs_a_local_backend() {
    let msg = config_error("[client]\nbackend = \"remote\"\nurl = \"http://x\"\nhybrid = true\n");
    assert!(msg.contains("hybrid"), "{msg}");
}

#[test]
fn duplicate_ids_are_rejected() {
    let msg = config_error(
        r#"
[[dataset]]
id = "d"
name = "one"
opener = "a.py"

[[dataset]]
id = "d"
name = "two"
opener = "b.py"
"#,
    );
    assert!(msg.contains("duplicate id 'd'"), "{msg}");
}

#[test]
fn sample_of_unknown_dataset_is_rejected() {
    let msg = config_error(
        r#"
[[data_sample]]
id = "s"
path = "data"
datasets = ["ghost"]
"#,
    );
    assert!(msg.contains("ghost"), "{msg}");
}

#[test]
fn task_input_must_have_exactly_one_source() {
    let contents = WORKSPACE.replace(
        r#"{ identifier = "opener", dataset = "iris" },
  { identifier = "datasamples", data_sample = "iris-train" },
]
outputs.model"#,
        r#"{ identifier = "opener", dataset = "iris", model = "m1" },
  { identifier = "datasamples", data_sample = "iris-train" },
]
outputs.model"#,
    );
    let msg = config_error(&contents);
    assert!(msg.contains("exactly one"), "{msg}");
}

#[test]
fn parent_without_output_is_rejected() {
    let contents = WORKSPACE.replace(
        r#"parent = "train", output = "model""#,
        r#"parent = "train""#,
    );
    let msg = config_error(&contents);
    assert!(msg.contains("without output"), "{msg}");
}

#[test]
fn dry_run_ranking_uses_workspace_ids() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_and_validate(write_workspace(dir.path(), WORKSPACE)).unwrap();
    let section = cfg.compute_plan.as_ref().unwrap();

    let request = plan_request(
        &cfg,
        section,
        &RegisteredAssets::identity(&cfg),
        &identity_task_keys(section),
    )
    .unwrap();
    let ranked = ComputePlanBuilder::new(&section.name)
        .build_ranked(&request.batches)
        .unwrap();

    let order: Vec<(&str, u32)> = ranked
        .iter()
        .map(|t| (t.key.as_deref().unwrap(), t.rank.unwrap()))
        .collect();
    assert_eq!(order, [("train", 0), ("evaluate", 1)]);
    assert_eq!(ranked[1].category, TaskCategory::Test);
}

#[tokio::test]
async fn registered_workspace_runs_to_completion() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_and_validate(write_workspace(dir.path(), WORKSPACE)).unwrap();
    let section = cfg.compute_plan.clone().unwrap();
    let fixture = LocalFixture::new(dir.path());

    let assets = with_timeout(register_assets(&fixture.client, &cfg))
        .await
        .unwrap();
    assert_eq!(assets.functions.len(), 2);

    let task_keys = new_task_keys(&section);
    let request = plan_request(&cfg, &section, &assets, &task_keys).unwrap();
    let plan = with_timeout(fixture.client.add_compute_plan(request))
        .await
        .unwrap();

    assert_eq!(plan.name, "demo");
    assert_eq!(plan.status, ComputePlanStatus::Done);
    assert_eq!(plan.done_count, 2);

    let evaluate: Task = fixture.client.get(&task_keys["evaluate"]).await.unwrap();
    assert_eq!(evaluate.status, TaskStatus::Done);
    assert_eq!(evaluate.worker, ORG);
    assert_eq!(evaluate.rank, 1);
    assert_eq!(fixture.spawner.call_count(), 2);
}
