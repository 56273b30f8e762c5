// Install session bookkeeping
//
// The resource list is the only input to rollback: a resource is recorded the moment the
// runtime confirms it exists, before the next step runs.

use crate::models::responses::Resource;
use crate::models::state::InstallState;

#[derive(Debug)]
pub struct InstallSession {
    id: String,
    state: InstallState,
    /// Step currently being attempted, reported as the failed step on error.
    current_step: InstallState,
    created: Vec<Resource>,
}

impl InstallSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: InstallState::Validating,
            current_step: InstallState::Validating,
            created: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn current_step(&self) -> InstallState {
        self.current_step
    }

    pub fn begin(&mut self, step: InstallState) {
        self.current_step = step;
    }

    pub fn reach(&mut self, state: InstallState) {
        self.state = state;
        self.current_step = state;
    }

    pub fn record(&mut self, resource: Resource) {
        if !self.created.contains(&resource) {
            self.created.push(resource);
        }
    }

    pub fn resources(&self) -> &[Resource] {
        &self.created
    }

    /// Resources in teardown order (newest first).
    pub fn teardown_order(&self) -> Vec<Resource> {
        self.created.iter().rev().cloned().collect()
    }
}

impl Default for InstallSession {
    fn default() -> Self {
        Self::new()
    }
}
