use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use fedplan::errors::{FedplanError, Result};
use fedplan::exec::spawner::VOLUME_OUTPUTS;
use fedplan::exec::{SpawnRequest, Spawner};

/// How a scripted call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Build,
    Execution,
}

/// A fake spawner that:
/// - records every request it receives
/// - writes each declared output itself, so no process is ever started:
///   outputs whose identifier contains `perf` get the configured performance
///   value, every other output gets deterministic model bytes
/// - can be told to fail on the N-th call (1-based).
#[derive(Default)]
pub struct FakeSpawner {
    requests: Arc<Mutex<Vec<SpawnRequest>>>,
    performance: Mutex<f64>,
    failures: Mutex<BTreeMap<usize, FakeFailure>>,
    skip_outputs: Mutex<bool>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            performance: Mutex::new(0.5),
            ..Default::default()
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Value written to performance outputs.
    pub fn set_performance(&self, value: f64) {
        *self.performance.lock().unwrap() = value;
    }

    pub fn fail_on_call(&self, call: usize, failure: FakeFailure) {
        self.failures.lock().unwrap().insert(call, failure);
    }

    /// Exit successfully without writing any output file.
    pub fn skip_outputs(&self) {
        *self.skip_outputs.lock().unwrap() = true;
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Value following `flag` in the request's argument template.
    pub fn arg(request: &SpawnRequest, flag: &str) -> Option<String> {
        let mut args = request.command_template.iter();
        args.find(|a| a.as_str() == flag)?;
        args.next().cloned()
    }

    /// `TASK_KEY` from the request environment.
    pub fn task_key(request: &SpawnRequest) -> Option<String> {
        request
            .envs
            .as_ref()?
            .iter()
            .find_map(|e| e.strip_prefix("TASK_KEY=").map(str::to_string))
    }

    fn handle(&self, request: SpawnRequest) -> Result<String> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };

        match self.failures.lock().unwrap().get(&call) {
            Some(FakeFailure::Build) => {
                return Err(FedplanError::BuildError {
                    name: request.name.clone(),
                    message: "scripted build failure".to_string(),
                });
            }
            Some(FakeFailure::Execution) => {
                return Err(FedplanError::ExecutionError {
                    name: request.name.clone(),
                    exit_code: Some(1),
                    logs: "scripted execution failure".to_string(),
                });
            }
            None => {}
        }

        if *self.skip_outputs.lock().unwrap() {
            return Ok(String::new());
        }

        let rank = Self::arg(&request, "--rank").unwrap_or_default();
        let outputs = Self::arg(&request, "--outputs").unwrap_or_else(|| "[]".to_string());
        let outputs: Vec<serde_json::Value> =
            serde_json::from_str(&outputs).map_err(FedplanError::from)?;
        let performance = *self.performance.lock().unwrap();

        for output in outputs {
            let id = output["id"].as_str().unwrap_or_default();
            let value = output["value"].as_str().unwrap_or_default();
            let path = PathBuf::from(value.replace(
                VOLUME_OUTPUTS,
                &request.volumes.outputs.to_string_lossy(),
            ));
            let contents = if id.contains("perf") {
                performance.to_string()
            } else {
                format!("model {id} rank={rank}")
            };
            std::fs::write(&path, contents)?;
        }

        Ok(format!("fake run of {}", request.name))
    }
}

impl Spawner for FakeSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move { self.handle(request) })
    }
}
