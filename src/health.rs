use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
#[cfg(target_os = "linux")]
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let sessions = state.sessions.counts_by_state();
    let providers = state.providers.statuses();
    let any_available = providers.iter().any(|provider| provider.available);

    HttpResponse::Ok().json(json!({
        "status": if any_available { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "speech-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "total": state.sessions.len(),
            "by_state": sessions,
            "busy": session_load(&state)
        },
        "providers": providers,
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let finished = metrics.pipelines_completed
        + metrics.pipelines_degraded
        + metrics.pipelines_rejected
        + metrics.pipelines_timed_out
        + metrics.pipelines_cancelled
        + metrics.pipelines_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "opened": metrics.sessions_opened,
            "closed": metrics.sessions_closed,
            "open": state.sessions.len()
        },
        "frames": {
            "inbound": metrics.frames_in,
            "outbound": metrics.frames_out
        },
        "pipelines": {
            "started": metrics.pipelines_started,
            "completed": metrics.pipelines_completed,
            "degraded": metrics.pipelines_degraded,
            "rejected": metrics.pipelines_rejected,
            "timed_out": metrics.pipelines_timed_out,
            "cancelled": metrics.pipelines_cancelled,
            "failed": metrics.pipelines_failed,
            "success_rate": if finished > 0 {
                (metrics.pipelines_completed + metrics.pipelines_degraded) as f64 / finished as f64
            } else {
                0.0
            },
            "pipelines_per_minute": if uptime_seconds > 0 {
                metrics.pipelines_started as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "memory": get_memory_info()
    }))
}

/// How many live sessions currently have a pipeline running.
fn session_load(state: &AppState) -> usize {
    state
        .sessions
        .snapshot()
        .iter()
        .filter(|session| session.state().is_live() && session.pipeline_in_flight())
        .count()
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|value| value.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::providers::ProviderRegistry;
    use crate::state::RelayMetrics;
    use actix_web::{test, App};

    fn app_state() -> web::Data<AppState> {
        let config = AppConfig::default();
        let providers = ProviderRegistry::from_config(&config).unwrap();
        web::Data::new(AppState::new(config, providers))
    }

    #[actix_web::test]
    async fn test_health_reports_providers_and_sessions() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["service"]["name"], "speech-relay");
        assert_eq!(body["sessions"]["total"], 0);
        let providers = body["providers"].as_array().unwrap();
        assert_eq!(providers.len(), 2);
        assert!(providers.iter().all(|provider| provider["pool"].is_object()));
        // no credentials in the default config
        assert_eq!(body["status"], "degraded");
    }

    #[actix_web::test]
    async fn test_metrics_report_pipeline_counters() {
        let state = app_state();
        RelayMetrics::incr(&state.metrics.pipelines_started);
        RelayMetrics::incr(&state.metrics.pipelines_completed);

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["pipelines"]["started"], 1);
        assert_eq!(body["pipelines"]["completed"], 1);
        assert_eq!(body["pipelines"]["success_rate"], 1.0);
        assert_eq!(body["frames"]["inbound"], 0);
    }
}
