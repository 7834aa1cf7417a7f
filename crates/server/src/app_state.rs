/// 应用全局状态

use std::sync::Arc;

use agent::DeploymentService;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 部署服务（内部持有检查点协调器）
    pub service: Arc<DeploymentService>,
}

impl AppState {
    pub fn new(service: DeploymentService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    /// 获取部署服务
    pub fn service(&self) -> Arc<DeploymentService> {
        self.service.clone()
    }
}
