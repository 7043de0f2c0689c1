//! Tenant/customer directory client.
//!
//! Resolves the human-readable customer reference the extractor found into
//! a stable customer identifier plus its withholding-eligibility
//! classification.

use async_trait::async_trait;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::models::CustomerProfile;

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn resolve(
        &self,
        tenant_id: Uuid,
        customer_ref: &str,
    ) -> Result<CustomerProfile, AppError>;
}

/// HTTP client for the directory service.
pub struct HttpCustomerDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCustomerDirectory {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
        Ok(Self { base_url, client })
    }
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    customer_id: Uuid,
    name: String,
    withholding_eligible: bool,
}

#[async_trait]
impl CustomerDirectory for HttpCustomerDirectory {
    async fn resolve(
        &self,
        tenant_id: Uuid,
        customer_ref: &str,
    ) -> Result<CustomerProfile, AppError> {
        let url = format!("{}/tenants/{}/customers/resolve", self.base_url, tenant_id);

        let response = self
            .client
            .get(&url)
            .query(&[("reference", customer_ref)])
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("Directory unreachable: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Unknown customer reference '{}'",
                customer_ref
            )));
        }

        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "Directory error {}",
                response.status()
            )));
        }

        let parsed: ResolveResponse = response
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("Bad directory response: {}", e)))?;

        Ok(CustomerProfile {
            customer_id: parsed.customer_id,
            name: parsed.name,
            withholding_eligible: parsed.withholding_eligible,
        })
    }
}

/// Static in-process directory for tests and local runs.
#[derive(Default)]
pub struct StaticCustomerDirectory {
    customers: Mutex<HashMap<String, CustomerProfile>>,
}

impl StaticCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, customer_ref: impl Into<String>, profile: CustomerProfile) {
        self.customers
            .lock()
            .expect("directory mutex poisoned")
            .insert(customer_ref.into(), profile);
    }
}

#[async_trait]
impl CustomerDirectory for StaticCustomerDirectory {
    async fn resolve(
        &self,
        _tenant_id: Uuid,
        customer_ref: &str,
    ) -> Result<CustomerProfile, AppError> {
        self.customers
            .lock()
            .expect("directory mutex poisoned")
            .get(customer_ref)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Unknown customer reference '{}'",
                    customer_ref
                ))
            })
    }
}
