/// DokWin - Server
///
/// 部署核心的 HTTP 入口，只做请求转发

mod api;
mod app_state;
mod config;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use agent::{AgentConfig, DeploymentService};

use crate::app_state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
        )
        .init();

    info!("🚀 启动 DokWin Server...");

    // 加载配置
    let cfg = config::Config::from_env()?;
    let agent_cfg = AgentConfig::from_env()?;
    info!(
        "✅ 配置加载成功 (存储根目录: {}, 输出目录: {}, 日志级别: {})",
        agent_cfg.storage_root.display(),
        agent_cfg.output_dir.display(),
        cfg.log_level
    );

    let app_state = AppState::new(DeploymentService::new(agent_cfg));
    let app = build_router(app_state);

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(app_state: AppState) -> Router {
    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root_handler() -> &'static str {
    "DokWin Server API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(tmp: &tempfile::TempDir) -> Router {
        let config = AgentConfig {
            storage_root: tmp.path().join("storage"),
            output_dir: tmp.path().join("output"),
            checkpoint_dir: tmp.path().join("checkpoints"),
            ..AgentConfig::default()
        };
        build_router(AppState::new(DeploymentService::new(config)))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn deployment(network: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "name": "t1",
            "version": "11",
            "credentials": { "username": "Docker", "password": "pa$$ word" },
            "resources": { "cpu_cores": 2, "ram_gb": 4, "disk_gb": 64 },
            "network": network
        })
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = tempfile::tempdir().unwrap();
        let response = app(&tmp)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_generate_writes_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let response = app(&tmp)
            .oneshot(post_json(
                "/api/deployments/generate",
                deployment(serde_json::json!({ "mode": "static", "address": "192.168.5.10", "gateway": "192.168.5.1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["descriptor"]["container_name"], "t1");
        assert_eq!(body["descriptor"]["environment"]["IP"], "192.168.5.10");
        assert_eq!(body["warnings"], serde_json::json!([]));
        assert_eq!(body["files"].as_array().unwrap().len(), 3);
        assert!(tmp.path().join("output/t1-network-setup.sh").exists());
    }

    #[tokio::test]
    async fn test_validate_returns_warnings_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut req = deployment(serde_json::json!({ "mode": "bridge" }));
        req["credentials"]["password"] = serde_json::json!("abc");

        let response = app(&tmp)
            .oneshot(post_json("/api/deployments/validate", req))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["valid"], true);
        assert_eq!(body["warnings"].as_array().unwrap().len(), 1);
        assert!(!tmp.path().join("output").exists());
    }

    #[tokio::test]
    async fn test_topology_error_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let response = app(&tmp)
            .oneshot(post_json(
                "/api/deployments/generate",
                deployment(serde_json::json!({ "mode": "macvlan", "subnet": "192.168.10.0/24" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["error"], "NETWORK_TOPOLOGY_ERROR");
        assert_eq!(body["detail"]["field"], "network.gateway");
        assert!(!tmp.path().join("output").exists());
    }

    #[tokio::test]
    async fn test_port_conflict_is_409() {
        let tmp = tempfile::tempdir().unwrap();
        let mut req = deployment(serde_json::json!({ "mode": "bridge" }));
        req["rdp_port"] = serde_json::json!(8006);
        req["vnc_port"] = serde_json::json!(8006);

        let response = app(&tmp)
            .oneshot(post_json("/api/deployments/generate", req))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["detail"]["field"], "vnc_port");
    }

    #[tokio::test]
    async fn test_unknown_checkpoint_and_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp);

        let response = app
            .clone()
            .oneshot(post_json("/api/checkpoints/missing/confirm", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/deployments/t1/descriptor").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/deployments/t1/checkpoint").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/checkpoints?days=7").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!([]));

        let response = app
            .oneshot(Request::builder().uri("/api/checkpoints?days=-3").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
