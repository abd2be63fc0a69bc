use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "***";

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        REDACTED
    }
}

/// The effective configuration with every credential masked.
pub fn redacted_config(config: &AppConfig) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(config)?;

    let providers = &config.providers;
    value["providers"]["microsoft"]["subscription_key"] = json!(redact(&providers.microsoft.subscription_key));
    value["providers"]["microsoft"]["translator_key"] = json!(redact(&providers.microsoft.translator_key));
    value["providers"]["openai"]["api_key"] = json!(redact(&providers.openai.api_key));

    Ok(value)
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted_config(&config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_masked() {
        let mut config = AppConfig::default();
        config.providers.microsoft.subscription_key = "azure-secret".to_string();
        config.providers.openai.api_key = "sk-secret".to_string();

        let value = redacted_config(&config).unwrap();
        let text = value.to_string();

        assert!(!text.contains("azure-secret"));
        assert!(!text.contains("sk-secret"));
        assert_eq!(value["providers"]["microsoft"]["subscription_key"], REDACTED);
        // unset keys stay visibly unset
        assert_eq!(value["providers"]["microsoft"]["translator_key"], "");
        assert_eq!(value["session"]["idle_timeout_secs"], 600);
        assert_eq!(value["pool"]["max_total"], config.pool.max_total);
    }
}
