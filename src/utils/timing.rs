use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug)]
pub struct ActionTimer {
    action: String,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl ActionTimer {
    pub fn start(action: &str) -> Self {
        let timer = ActionTimer {
            action: action.to_string(),
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "success".to_string(),
            detail: None,
            completed: false,
        };
        info!(
            target: "studio.timing",
            "event=action_received action={} received_at={}",
            timer.action,
            timer.started_at.to_rfc3339()
        );
        timer
    }

    pub fn complete(&mut self, status: &str, detail: Option<String>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.status = status.to_string();
        self.detail = detail;
        let completed_at = Utc::now();
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: "studio.timing",
            "event=action_completed action={} started_at={} completed_at={} duration_s={:.3} status={} detail={}",
            self.action,
            self.started_at.to_rfc3339(),
            completed_at.to_rfc3339(),
            duration,
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

pub async fn log_llm_timing<T, F, Fut>(
    model: &str,
    operation: &str,
    call: F,
) -> Result<T, crate::error::StudioError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, crate::error::StudioError>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    info!(
        target: "studio.timing",
        "event=llm_request provider=gemini model={} operation={} started_at={}",
        model,
        operation,
        started_at.to_rfc3339()
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    let completed_at = Utc::now();
    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: "studio.timing",
        "event=llm_response provider=gemini model={} operation={} completed_at={} duration_s={:.3} status={}",
        model,
        operation,
        completed_at.to_rfc3339(),
        duration,
        status
    );

    result
}
