#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fedplan::backend::{Backend, Client, LocalBackend, RemoteBackend};
use fedplan::models::{
    FunctionCategory, FunctionInput, FunctionOutput, InputRef, IoKind, Metadata, Permissions,
};
use fedplan::schemas::{
    ComputePlanTaskRequest, ComputeTaskOutputRequest, DataSampleRequest, DatasetRequest,
    FunctionRequest,
};
use fedplan::store::{InMemoryAssetStore, SharedStore};

use crate::fake_spawner::FakeSpawner;

pub const ORG: &str = "MyOrg1";

/// A local client backed by a [`FakeSpawner`], with every path under one
/// temporary directory.
pub struct LocalFixture {
    pub dir: PathBuf,
    pub store: SharedStore,
    pub spawner: Arc<FakeSpawner>,
    pub client: Client,
}

impl LocalFixture {
    pub fn new(root: &Path) -> Self {
        let store = InMemoryAssetStore::shared();
        let spawner = FakeSpawner::shared();
        let client = Client::local(
            store.clone(),
            spawner.clone(),
            root.join("worker"),
            ORG,
        );
        Self {
            dir: root.to_path_buf(),
            store,
            spawner,
            client,
        }
    }

    /// Same as [`LocalFixture::new`], reading unknown assets from `remote`.
    pub fn hybrid(root: &Path, remote: RemoteBackend) -> Self {
        let store = InMemoryAssetStore::shared();
        let spawner = FakeSpawner::shared();
        let local = LocalBackend::new(store.clone(), spawner.clone(), root.join("worker"), ORG)
            .with_remote(remote);
        Self {
            dir: root.to_path_buf(),
            store,
            spawner,
            client: Client::new(Backend::Local(local)),
        }
    }

    pub fn worker_dir(&self) -> PathBuf {
        self.dir.join("worker")
    }

    /// Register a dataset with one opener file.
    pub async fn dataset(&self, name: &str) -> String {
        let request = dataset_request(&self.dir, name);
        self.client.add_dataset(request).await.unwrap()
    }

    /// Register a data sample directory holding one file.
    pub async fn data_sample(&self, name: &str, dataset_keys: &[&str]) -> String {
        let request = data_sample_request(&self.dir, name, dataset_keys);
        self.client.add_data_sample(request).await.unwrap()
    }

    pub async fn function(&self, builder: FunctionBuilder) -> String {
        let request = builder.build(&self.dir);
        self.client.add_function(request).await.unwrap()
    }
}

pub fn dataset_request(root: &Path, name: &str) -> DatasetRequest {
    let dir = root.join("datasets").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let opener = dir.join("opener.py");
    std::fs::write(&opener, format!("# opener for {name}\n")).unwrap();
    let description = dir.join("description.md");
    std::fs::write(&description, format!("# {name}\n")).unwrap();
    DatasetRequest {
        key: None,
        name: name.to_string(),
        opener,
        description: Some(description),
        permissions: Permissions::public(),
        metadata: Metadata::new(),
    }
}

pub fn data_sample_request(root: &Path, name: &str, dataset_keys: &[&str]) -> DataSampleRequest {
    let dir = root.join("samples").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("data.csv"), format!("x,y\n1,{name}\n")).unwrap();
    DataSampleRequest {
        key: None,
        path: dir,
        data_manager_keys: dataset_keys.iter().map(|k| k.to_string()).collect(),
    }
}

/// Builder for `FunctionRequest`. The archive is a directory with a
/// `Dockerfile` written by [`FunctionBuilder::build`].
pub struct FunctionBuilder {
    name: String,
    category: FunctionCategory,
    inputs: BTreeMap<String, FunctionInput>,
    outputs: BTreeMap<String, FunctionOutput>,
    metadata: Metadata,
}

impl FunctionBuilder {
    pub fn new(name: &str, category: FunctionCategory) -> Self {
        Self {
            name: name.to_string(),
            category,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            metadata: Metadata::new(),
        }
    }

    /// opener + data samples in, one model out.
    pub fn train(name: &str) -> Self {
        Self::new(name, FunctionCategory::Simple)
            .input("opener", IoKind::DataManager, false, false)
            .input("datasamples", IoKind::DataSample, false, true)
            .input("models", IoKind::Model, true, true)
            .output("model", IoKind::Model)
    }

    /// models in, one model out.
    pub fn aggregate(name: &str) -> Self {
        Self::new(name, FunctionCategory::Aggregate)
            .input("models", IoKind::Model, false, true)
            .output("model", IoKind::Model)
    }

    /// opener + data samples + model in, one performance out.
    pub fn metric(name: &str) -> Self {
        Self::new(name, FunctionCategory::Metric)
            .input("opener", IoKind::DataManager, false, false)
            .input("datasamples", IoKind::DataSample, false, true)
            .input("model", IoKind::Model, false, false)
            .output("performance", IoKind::Performance)
    }

    pub fn input(mut self, id: &str, kind: IoKind, optional: bool, multiple: bool) -> Self {
        self.inputs.insert(
            id.to_string(),
            FunctionInput {
                kind,
                optional,
                multiple,
            },
        );
        self
    }

    pub fn output(mut self, id: &str, kind: IoKind) -> Self {
        self.outputs.insert(
            id.to_string(),
            FunctionOutput {
                kind,
                multiple: false,
            },
        );
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self, root: &Path) -> FunctionRequest {
        let dir = root.join("functions").join(&self.name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("Dockerfile"),
            format!(
                "FROM python:3.11\nENTRYPOINT [\"python3\", \"algo.py\", \"--function-name\", \"{}\"]\n",
                self.name
            ),
        )
        .unwrap();
        std::fs::write(dir.join("algo.py"), "print('hello')\n").unwrap();
        FunctionRequest {
            key: None,
            name: self.name,
            category: self.category,
            archive: dir,
            description: None,
            inputs: self.inputs,
            outputs: self.outputs,
            permissions: Permissions::public(),
            metadata: self.metadata,
        }
    }
}

/// Builder for one compute plan batch entry.
pub struct PlanTaskBuilder {
    task: ComputePlanTaskRequest,
}

impl PlanTaskBuilder {
    pub fn new(task_id: &str, function_key: &str) -> Self {
        Self {
            task: ComputePlanTaskRequest {
                task_id: task_id.to_string(),
                function_key: function_key.to_string(),
                worker: ORG.to_string(),
                inputs: Vec::new(),
                outputs: BTreeMap::new(),
                metadata: Metadata::new(),
                tag: String::new(),
            },
        }
    }

    pub fn worker(mut self, worker: &str) -> Self {
        self.task.worker = worker.to_string();
        self
    }

    pub fn asset(mut self, identifier: &str, key: &str) -> Self {
        self.task.inputs.push(InputRef::asset(identifier, key));
        self
    }

    pub fn parent(mut self, identifier: &str, parent: &str, output: &str) -> Self {
        self.task
            .inputs
            .push(InputRef::parent_output(identifier, parent, output));
        self
    }

    pub fn output(self, identifier: &str) -> Self {
        self.output_with(identifier, Permissions::public())
    }

    pub fn output_with(mut self, identifier: &str, permissions: Permissions) -> Self {
        self.task.outputs.insert(
            identifier.to_string(),
            ComputeTaskOutputRequest {
                permissions,
                transient: false,
            },
        );
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.task.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> ComputePlanTaskRequest {
        self.task
    }
}
