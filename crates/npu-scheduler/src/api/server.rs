use std::sync::Arc;

use error_stack::{Report, ResultExt};
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::{Endpoint, EndpointExt, Server};
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::errors::ApiError;
use super::routes::RouteTable;
use crate::context::SchedulerContext;
use crate::lifecycle::Lifecycle;

/// HTTP extender server in front of a [`SchedulerContext`]
pub struct ExtenderServer {
    context: Arc<SchedulerContext>,
    listen_addr: String,
}

/// The extender routes bound to `context`.
///
/// # Errors
///
/// - [`ApiError::Routes`] if the route table cannot be built
pub fn app(context: Arc<SchedulerContext>) -> Result<impl Endpoint, Report<ApiError>> {
    let table = RouteTable::standard().change_context(ApiError::Routes {
        message: "cannot build the extender routes".to_string(),
    })?;
    Ok(table.into_route().data(context).with(Tracing))
}

impl ExtenderServer {
    pub fn new(context: Arc<SchedulerContext>, listen_addr: String) -> Self {
        Self {
            context,
            listen_addr,
        }
    }

    /// Serve until the server fails or `shutdown_rx` fires.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the daemon is already started or the
    ///   server fails to bind to the address
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), Report<ApiError>> {
        let lifecycle = self.context.lifecycle();
        lifecycle
            .begin_start()
            .change_context(ApiError::ServerError {
                message: "scheduler cannot start".to_string(),
            })?;

        let app = match app(Arc::clone(&self.context)) {
            Ok(app) => app,
            Err(err) => {
                settle("abort start", lifecycle.abort_start());
                return Err(err);
            }
        };

        info!("Starting extender server on {}", self.listen_addr);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);
        settle("mark running", lifecycle.mark_running());

        let result = tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("extender server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("extender server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = &mut shutdown_rx => {
                info!("extender server shutdown requested");
                Ok(())
            }
        };

        stop(lifecycle);
        result
    }
}

/// Bring a running daemon back to idle.
fn stop(lifecycle: &Lifecycle) {
    settle("begin stop", lifecycle.begin_stop());
    settle("mark stopped", lifecycle.mark_stopped());
}

/// Log a lifecycle transition the server cannot recover from. Returns
/// whether it applied.
fn settle(step: &'static str, transition: crate::error::Result<()>) -> bool {
    match transition {
        Ok(()) => true,
        Err(err) => {
            warn!(step, error = %err.current_context(), "lifecycle transition failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::{annotations, JobSpec, TaskSpec};
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use serde_json::json;

    use super::*;
    use crate::lifecycle::LifecycleState;

    fn running_context() -> Arc<SchedulerContext> {
        let context = Arc::new(SchedulerContext::default());
        context.lifecycle().begin_start().unwrap();
        context.lifecycle().mark_running().unwrap();
        context
    }

    #[tokio::test]
    async fn healthz_follows_lifecycle() {
        let context = Arc::new(SchedulerContext::default());
        let cli = TestClient::new(app(Arc::clone(&context)).unwrap());

        cli.get("/healthz")
            .send()
            .await
            .assert_status(StatusCode::SERVICE_UNAVAILABLE);

        context.lifecycle().begin_start().unwrap();
        context.lifecycle().mark_running().unwrap();
        let resp = cli.get("/healthz").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("running").await;
    }

    #[tokio::test]
    async fn node_then_job_then_bind_over_http() {
        let context = running_context();
        let cli = TestClient::new(app(Arc::clone(&context)).unwrap());

        cli.post("/nodes")
            .body_json(&json!({
                "name": "n1",
                "annotations": {
                    (annotations::FAMILY): "ascend910",
                    (annotations::FREE): "0,1,2,3,4,5,6,7",
                },
            }))
            .send()
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let job = JobSpec {
            id: "j".to_string(),
            family: "ascend910".to_string(),
            tasks: vec![TaskSpec {
                name: "w0".to_string(),
                npu: 2,
                vnpu_ratio: None,
                exclusive: false,
            }],
            sp_block: None,
        };
        let resp = cli.post("/validate").body_json(&job).send().await;
        resp.assert_status_is_ok();
        resp.assert_json(json!({"pass": true, "reason": "", "message": ""}))
            .await;

        let task = json!({"job": "j", "task": "w0"});
        let resp = cli
            .post("/score")
            .body_json(&json!({"task": task, "nodes": ["n1"]}))
            .send()
            .await;
        resp.assert_status_is_ok();
        let priorities: serde_json::Value = resp.json().await.value().deserialize();
        assert_eq!(priorities[0]["host"], "n1");
        assert!(priorities[0]["score"].as_f64().unwrap() < 64.0);

        let resp = cli
            .post("/bind")
            .body_json(&json!({"task": task, "node": "n1"}))
            .send()
            .await;
        resp.assert_status_is_ok();
        let bound: serde_json::Value = resp.json().await.value().deserialize();
        assert_eq!(bound["devices"], json!([0, 1]));
        assert!(bound["error"].is_null());
    }

    #[tokio::test]
    async fn engine_errors_carry_status() {
        let context = running_context();
        let cli = TestClient::new(app(context).unwrap());

        cli.post("/jobs/start")
            .body_json(&json!({"job": "ghost"}))
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);

        cli.post("/nodes")
            .body_json(&json!({"name": "n1", "annotations": {}}))
            .send()
            .await
            .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let context = Arc::new(SchedulerContext::default());
        let server = ExtenderServer::new(Arc::clone(&context), "127.0.0.1:0".to_string());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        shutdown_tx.send(()).unwrap();

        server.run(shutdown_rx).await.unwrap();

        assert_eq!(context.lifecycle().state(), LifecycleState::Idle);
    }

    #[test]
    fn rejected_transitions_are_reported_not_dropped() {
        let lifecycle = Lifecycle::new();

        assert!(!settle("begin stop", lifecycle.begin_stop()));
        stop(&lifecycle);
        assert_eq!(lifecycle.state(), LifecycleState::Idle);

        lifecycle.begin_start().unwrap();
        assert!(settle("mark running", lifecycle.mark_running()));
        stop(&lifecycle);
        assert_eq!(lifecycle.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_running() {
        let context = running_context();
        let server = ExtenderServer::new(context, "127.0.0.1:0".to_string());
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();

        let err = server.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err.current_context(), ApiError::ServerError { .. }));
    }
}
