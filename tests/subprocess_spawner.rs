#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use fedplan::errors::FedplanError;
use fedplan::exec::spawner::{VOLUME_OUTPUTS, Volumes};
use fedplan::exec::staging::DATA_SAMPLES_DIR;
use fedplan::exec::{SpawnRequest, Spawner, SubprocessSpawner};
use fedplan_test_utils::{init_tracing, with_timeout};
use tempfile::TempDir;

const TRAIN_SCRIPT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --outputs) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf 'weights' > "$out"
echo "saved model"
echo "task $TASK_KEY"
"#;

fn write_archive(root: &Path, script: &str) -> std::path::PathBuf {
    let dir = root.join("function");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("Dockerfile"),
        "FROM alpine\nCOPY algo.sh .\nENTRYPOINT [\"sh\", \"algo.sh\", \"--function-name\", \"train\"]\n",
    )
    .unwrap();
    fs::write(dir.join("algo.sh"), script).unwrap();
    dir
}

fn volumes(root: &Path) -> Volumes {
    let volumes = Volumes {
        inputs: root.join("inputs"),
        outputs: root.join("outputs"),
        cli_args: root.join("cli-args"),
    };
    for dir in [&volumes.inputs, &volumes.outputs, &volumes.cli_args] {
        fs::create_dir_all(dir).unwrap();
    }
    volumes
}

fn request(root: &TempDir, name: &str, script: &str) -> SpawnRequest {
    SpawnRequest {
        name: name.to_string(),
        archive_path: write_archive(root.path(), script),
        command_template: vec!["--outputs".into(), format!("{VOLUME_OUTPUTS}/model")],
        data_sample_paths: None,
        volumes: volumes(root.path()),
        envs: Some(vec!["TASK_KEY=task-1".into()]),
    }
}

#[tokio::test]
async fn script_runs_against_substituted_volumes() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let request = request(&root, "fn-ok", TRAIN_SCRIPT);
    let outputs = request.volumes.outputs.clone();

    let spawner = SubprocessSpawner::new(cache.path());
    let logs = with_timeout(spawner.spawn(request)).await.unwrap();

    assert!(logs.contains("saved model"), "{logs}");
    assert!(logs.contains("task task-1"), "{logs}");
    assert_eq!(fs::read_to_string(outputs.join("model")).unwrap(), "weights");
    assert!(cache.path().join("fn-ok").join("algo.sh").is_file());
}

#[tokio::test]
async fn samples_outside_the_inputs_volume_are_staged() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let sample = root.path().join("sample-src");
    fs::create_dir_all(&sample).unwrap();
    fs::write(sample.join("data.csv"), "x\n1\n").unwrap();

    let mut request = request(&root, "fn-samples", TRAIN_SCRIPT);
    request.data_sample_paths = Some(BTreeMap::from([("s1".to_string(), sample)]));
    let inputs = request.volumes.inputs.clone();

    SubprocessSpawner::new(cache.path())
        .spawn(request)
        .await
        .unwrap();

    let staged = inputs.join(DATA_SAMPLES_DIR).join("s1").join("data.csv");
    assert_eq!(fs::read_to_string(staged).unwrap(), "x\n1\n");
}

#[tokio::test]
async fn non_zero_exit_is_an_execution_error_with_stderr() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let request = request(&root, "fn-fail", "echo 'loss is nan' >&2\nexit 3\n");

    let err = SubprocessSpawner::new(cache.path())
        .spawn(request)
        .await
        .unwrap_err();

    match err {
        FedplanError::ExecutionError {
            name,
            exit_code,
            logs,
        } => {
            assert_eq!(name, "fn-fail");
            assert_eq!(exit_code, Some(3));
            assert!(logs.contains("loss is nan"), "{logs}");
        }
        other => panic!("expected ExecutionError, got {other:?}"),
    }
}

#[tokio::test]
async fn archive_without_descriptor_is_a_build_error() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let request = request(&root, "fn-broken", TRAIN_SCRIPT);
    fs::remove_file(request.archive_path.join("Dockerfile")).unwrap();

    let err = SubprocessSpawner::new(cache.path())
        .spawn(request)
        .await
        .unwrap_err();
    assert!(
        matches!(err, FedplanError::BuildError { ref name, .. } if name == "fn-broken"),
        "{err:?}"
    );
}
