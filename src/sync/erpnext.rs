// 🌐 ERPNext client - external ledger over the ERPNext REST API
//
// - update / delete → whitelisted server methods addressed by correlation key
// - create          → POST /api/resource/{doctype} with the correlation key attached
//
// A logical error in an update/delete response ({"message": {"error": ...}})
// means the record does not exist on the ERP side.

use super::{DeleteOutcome, ExternalError, ExternalLedger, UpdateOutcome};
use crate::entities::{CorrelationKey, EntrySnapshot, OwnerKind};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_UPDATE_METHOD: &str = "stamp_ledger.api.update_by_correlation_key";
pub const DEFAULT_DELETE_METHOD: &str = "stamp_ledger.api.delete_by_correlation_key";

#[derive(Debug, Clone)]
pub struct ErpNextConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub timeout: Duration,
    pub update_method: String,
    pub delete_method: String,
}

impl ErpNextConfig {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Self {
        ErpNextConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            timeout: Duration::from_secs(10),
            update_method: DEFAULT_UPDATE_METHOD.to_string(),
            delete_method: DEFAULT_DELETE_METHOD.to_string(),
        }
    }
}

pub struct ErpNextClient {
    client: Client,
    config: ErpNextConfig,
}

impl ErpNextClient {
    pub fn new(config: ErpNextConfig) -> Result<Self, ExternalError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExternalError::Transport(e.to_string()))?;

        Ok(ErpNextClient { client, config })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/api/method/{}", self.config.base_url, method)
    }

    fn resource_url(&self, kind: OwnerKind) -> String {
        format!(
            "{}/api/resource/{}",
            self.config.base_url,
            urlencoding::encode(kind.doctype())
        )
    }

    async fn post(&self, url: &str, body: &Value) -> Result<(u16, Value), ExternalError> {
        debug!(url, "ERPNext request");

        let response = self
            .client
            .post(url)
            .header(
                "Authorization",
                format!("token {}:{}", self.config.api_key, self.config.api_secret),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| ExternalError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ExternalError::Transport(e.to_string()))?;

        // Error pages are not always JSON; keep the raw text for the alert
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, body))
    }
}

#[async_trait::async_trait]
impl ExternalLedger for ErpNextClient {
    async fn update(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) -> Result<UpdateOutcome, ExternalError> {
        let body = json!({
            "stamp_type": key.kind.doctype(),
            "correlation_key": key.to_string(),
            "data": erp_payload(snapshot),
        });
        let (status, response) = self.post(&self.method_url(&self.config.update_method), &body).await?;
        classify_update_response(status, &response)
    }

    async fn create(&self, key: &CorrelationKey, snapshot: &EntrySnapshot) -> Result<(), ExternalError> {
        let mut body = erp_payload(snapshot);
        body["correlation_key"] = Value::String(key.to_string());

        let (status, response) = self.post(&self.resource_url(key.kind), &body).await?;
        classify_create_response(status, &response)
    }

    async fn delete(&self, key: &CorrelationKey) -> Result<DeleteOutcome, ExternalError> {
        let body = json!({
            "stamp_type": key.kind.doctype(),
            "correlation_key": key.to_string(),
        });
        let (status, response) = self.post(&self.method_url(&self.config.delete_method), &body).await?;
        classify_delete_response(status, &response)
    }
}

// ============================================================================
// PAYLOAD & RESPONSE MAPPING
// ============================================================================

fn money(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Field layout of the "Stamp Calculation" / "Expected Stamp" doctypes
pub fn erp_payload(snapshot: &EntrySnapshot) -> Value {
    let owner_field = match snapshot.kind {
        OwnerKind::Company => "company",
        OwnerKind::Sector => "sector",
    };

    let mut payload = json!({
        "correlation_key": snapshot.correlation_key().to_string(),
        "version": snapshot.version,
        "user": snapshot.recorded_by,
        "value_of_work_a": money(snapshot.claim_value),
        "invoice_copies_b": snapshot.copies,
        "invoice_date": snapshot.invoice_date.map(|d| d.format("%Y-%m-%d").to_string()),
        "stamp_rate_c": money(snapshot.rate),
        "exchange_rate": money(snapshot.exchange_rate),
        "total_stamp_duty_d1": money(snapshot.own_duty),
        "total_past_years": money(snapshot.past_total),
        "total_stamp": money(snapshot.running_total),
        "note": snapshot.note.clone().unwrap_or_default(),
        "created_at": snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    payload[owner_field] = Value::String(snapshot.owner_name.clone());
    payload
}

fn logical_error(body: &Value) -> Option<&Value> {
    body.get("message")
        .and_then(|m| m.get("error"))
        .filter(|e| !e.is_null() && *e != &Value::Bool(false))
}

fn status_error(status: u16, body: &Value) -> ExternalError {
    let body = match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ExternalError::Status { status, body }
}

pub fn classify_update_response(status: u16, body: &Value) -> Result<UpdateOutcome, ExternalError> {
    if status == 404 {
        return Ok(UpdateOutcome::NotFound);
    }
    if !(200..300).contains(&status) {
        return Err(status_error(status, body));
    }
    if logical_error(body).is_some() {
        return Ok(UpdateOutcome::NotFound);
    }
    Ok(UpdateOutcome::Updated)
}

pub fn classify_delete_response(status: u16, body: &Value) -> Result<DeleteOutcome, ExternalError> {
    if status == 404 {
        return Ok(DeleteOutcome::NotFound);
    }
    if !(200..300).contains(&status) {
        return Err(status_error(status, body));
    }
    if logical_error(body).is_some() {
        return Ok(DeleteOutcome::NotFound);
    }
    Ok(DeleteOutcome::Deleted)
}

pub fn classify_create_response(status: u16, body: &Value) -> Result<(), ExternalError> {
    // 409: a record with this correlation key already exists
    if status == 409 {
        return Ok(());
    }
    if !(200..300).contains(&status) {
        return Err(status_error(status, body));
    }
    if let Some(err) = logical_error(body) {
        return Err(ExternalError::Rejected(err.to_string()));
    }
    Ok(())
}
