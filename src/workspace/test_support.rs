//! Recording test doubles for the external collaborators.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::github::{BranchService, RepoInfo};
use super::models::ExistingBranch;
use super::sandbox::{
    CreatedInstance, InstanceRequest, InstanceStatus, SandboxService, SandboxStatus,
};
use crate::errors::ServiceError;

/// Serve `router` on an ephemeral local port; returns its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn existing(names: &[&str]) -> Vec<ExistingBranch> {
    names
        .iter()
        .map(|name| ExistingBranch {
            name: name.to_string(),
            updated_at: None,
        })
        .collect()
}

pub fn forbidden() -> ServiceError {
    ServiceError::Api {
        status: 403,
        message: "Resource not accessible by integration".into(),
    }
}

pub struct MockBranchService {
    create_delay: Duration,
    /// `None` echoes the requested branch name.
    create_result: Option<Result<String, ServiceError>>,
    list_delay: Duration,
    list_result: Result<Vec<ExistingBranch>, ServiceError>,
    pub create_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub requested: Mutex<Vec<(String, String)>>,
}

impl MockBranchService {
    pub fn new() -> Self {
        Self {
            create_delay: Duration::from_millis(50),
            create_result: None,
            list_delay: Duration::ZERO,
            list_result: Ok(existing(&["main", "feature-x"])),
            create_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_create_result(mut self, result: Result<String, ServiceError>) -> Self {
        self.create_result = Some(result);
        self
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    pub fn with_list_result(mut self, result: Result<Vec<ExistingBranch>, ServiceError>) -> Self {
        self.list_result = result;
        self
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BranchService for MockBranchService {
    async fn get_repo_info(&self, _owner: &str, _repo: &str) -> Result<RepoInfo, ServiceError> {
        Ok(RepoInfo {
            default_branch: "main".into(),
        })
    }

    async fn create_branch(
        &self,
        _owner: &str,
        _repo: &str,
        from_ref: &str,
        branch: &str,
    ) -> Result<String, ServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .push((from_ref.to_string(), branch.to_string()));
        tokio::time::sleep(self.create_delay).await;
        match &self.create_result {
            Some(result) => result.clone(),
            None => Ok(branch.to_string()),
        }
    }

    async fn list_branches(
        &self,
        _owner: &str,
        _repo: &str,
    ) -> Result<Vec<ExistingBranch>, ServiceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.list_delay).await;
        self.list_result.clone()
    }
}

pub fn status(status: SandboxStatus, url: Option<&str>) -> Result<InstanceStatus, ServiceError> {
    Ok(InstanceStatus {
        status,
        url: url.map(str::to_string),
        error: None,
    })
}

pub struct MockSandboxService {
    create_delay: Duration,
    create_status: SandboxStatus,
    create_url: Option<String>,
    create_error: Option<ServiceError>,
    /// Popped one per status call; `Pending` once drained.
    statuses: Mutex<VecDeque<Result<InstanceStatus, ServiceError>>>,
    destroy_error: Option<ServiceError>,
    pub create_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub requests: Mutex<Vec<InstanceRequest>>,
    pub destroyed: Mutex<Vec<String>>,
}

impl MockSandboxService {
    pub fn new() -> Self {
        Self {
            create_delay: Duration::from_millis(10),
            create_status: SandboxStatus::Pending,
            create_url: None,
            create_error: None,
            statuses: Mutex::new(VecDeque::new()),
            destroy_error: None,
            create_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_created(mut self, status: SandboxStatus, url: Option<&str>) -> Self {
        self.create_status = status;
        self.create_url = url.map(str::to_string);
        self
    }

    pub fn with_create_error(mut self, err: ServiceError) -> Self {
        self.create_error = Some(err);
        self
    }

    pub fn with_statuses(
        self,
        statuses: impl IntoIterator<Item = Result<InstanceStatus, ServiceError>>,
    ) -> Self {
        self.statuses.lock().unwrap().extend(statuses);
        self
    }

    pub fn with_destroy_error(mut self, err: ServiceError) -> Self {
        self.destroy_error = Some(err);
        self
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxService for MockSandboxService {
    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, ServiceError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.create_delay).await;
        if let Some(err) = &self.create_error {
            return Err(err.clone());
        }
        Ok(CreatedInstance {
            id: format!("sb-{}", n),
            status: self.create_status,
            url: self.create_url.clone(),
            error: None,
        })
    }

    async fn get_status(&self, _remote_id: &str) -> Result<InstanceStatus, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| status(SandboxStatus::Pending, None))
    }

    async fn destroy_instance(&self, remote_id: &str) -> Result<(), ServiceError> {
        self.destroyed.lock().unwrap().push(remote_id.to_string());
        match &self.destroy_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
