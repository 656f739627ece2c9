//! In-memory driver for manager/GC unit tests. Records every call so tests
//! can assert on what the core asked the driver to do, without a daemon.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    ContainerSpec, ContainerState, ContainerStatusInfo, Driver, DriverError, ImagePullPolicy,
    RuntimeInstance,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    labels: HashMap<String, String>,
    state: ContainerState,
    endpoint: Option<String>,
}

#[derive(Default)]
struct FakeDriverState {
    containers: HashMap<String, FakeContainer>,
    volumes: HashMap<String, HashMap<String, String>>,
    networks: Vec<String>,
    next_id: u64,
}

/// Fake driver for unit testing. Records all method calls for assertion.
pub struct FakeDriver {
    state: Mutex<FakeDriverState>,
    pub create_calls: Mutex<Vec<String>>,
    pub start_calls: Mutex<Vec<String>>,
    pub stop_calls: Mutex<Vec<String>>,
    pub destroy_calls: Mutex<Vec<String>>,
    pub create_volume_calls: Mutex<Vec<String>>,
    pub delete_volume_calls: Mutex<Vec<String>>,
    pub fail_next_create: Mutex<bool>,
    pub fail_next_start: Mutex<bool>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeDriverState::default()),
            create_calls: Mutex::new(Vec::new()),
            start_calls: Mutex::new(Vec::new()),
            stop_calls: Mutex::new(Vec::new()),
            destroy_calls: Mutex::new(Vec::new()),
            create_volume_calls: Mutex::new(Vec::new()),
            delete_volume_calls: Mutex::new(Vec::new()),
            fail_next_create: Mutex::new(false),
            fail_next_start: Mutex::new(false),
        }
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn create(
        &self,
        spec: &ContainerSpec,
        labels: HashMap<String, String>,
        _pull_policy: ImagePullPolicy,
    ) -> Result<String, DriverError> {
        if std::mem::take(&mut *self.fail_next_create.lock().unwrap()) {
            return Err(DriverError::Backend("forced create failure".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer { labels, state: ContainerState::Created, endpoint: None },
        );
        self.create_calls.lock().unwrap().push(spec.name.clone());
        Ok(id)
    }

    async fn start(&self, container_id: &str, runtime_port: u16) -> Result<String, DriverError> {
        if std::mem::take(&mut *self.fail_next_start.lock().unwrap()) {
            return Err(DriverError::NoEndpoint(container_id.to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::ContainerNotFound(container_id.to_string()))?;
        let endpoint = format!("http://fake-host:{runtime_port}");
        container.state = ContainerState::Running;
        container.endpoint = Some(endpoint.clone());
        self.start_calls.lock().unwrap().push(container_id.to_string());
        Ok(endpoint)
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        self.stop_calls.lock().unwrap().push(container_id.to_string());
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(container_id) {
            c.state = ContainerState::Exited;
            c.endpoint = None;
        }
        Ok(())
    }

    async fn destroy(&self, container_id: &str) -> Result<(), DriverError> {
        self.destroy_calls.lock().unwrap().push(container_id.to_string());
        self.state.lock().unwrap().containers.remove(container_id);
        Ok(())
    }

    async fn status(
        &self,
        container_id: &str,
        _runtime_port: Option<u16>,
    ) -> Result<ContainerStatusInfo, DriverError> {
        let state = self.state.lock().unwrap();
        match state.containers.get(container_id) {
            Some(c) => Ok(ContainerStatusInfo { state: c.state, endpoint: c.endpoint.clone(), exit_code: None }),
            None => Ok(ContainerStatusInfo { state: ContainerState::NotFound, endpoint: None, exit_code: None }),
        }
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<(), DriverError> {
        self.state.lock().unwrap().volumes.insert(name.to_string(), labels);
        self.create_volume_calls.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), DriverError> {
        self.state.lock().unwrap().volumes.remove(name);
        self.delete_volume_calls.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, DriverError> {
        Ok(self.state.lock().unwrap().volumes.contains_key(name))
    }

    async fn create_network(&self, session_id: &str) -> Result<String, DriverError> {
        let name = format!("fake-net-{session_id}");
        self.state.lock().unwrap().networks.push(name.clone());
        Ok(name)
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), DriverError> {
        self.state.lock().unwrap().networks.retain(|n| n != network_id);
        Ok(())
    }

    async fn list_runtime_instances(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<RuntimeInstance>, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .map(|(id, c)| RuntimeInstance {
                id: id.clone(),
                name: id.clone(),
                labels: c.labels.clone(),
                state: format!("{:?}", c.state).to_lowercase(),
            })
            .collect())
    }

    async fn destroy_runtime_instance(&self, id: &str) -> Result<(), DriverError> {
        self.destroy_calls.lock().unwrap().push(id.to_string());
        self.state.lock().unwrap().containers.remove(id);
        Ok(())
    }
}
