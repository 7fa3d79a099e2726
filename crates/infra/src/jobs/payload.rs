//! Per-type job payloads.
//!
//! Each `JobType` carries exactly one payload shape. Stores persist the type tag
//! and the payload body separately; `decode` dispatches on the tag to get the
//! typed value back.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use flyerq_core::{FlyerId, PageId, StoreId};

use super::types::JobType;

/// Scrape the current flyer of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScrapeFlyerPayload {
    pub store_id: StoreId,
}

/// Extract products and prices from one flyer page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractPagePayload {
    pub page_id: PageId,
}

/// Match the extracted items of one flyer against the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchProductsPayload {
    pub flyer_id: FlyerId,
}

/// Tagged job payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    ScrapeFlyer(ScrapeFlyerPayload),
    ExtractPage(ExtractPagePayload),
    MatchProducts(MatchProductsPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::ScrapeFlyer(_) => JobType::ScrapeFlyer,
            JobPayload::ExtractPage(_) => JobType::ExtractPage,
            JobPayload::MatchProducts(_) => JobType::MatchProducts,
        }
    }

    /// Name of the external resource this job touches, used as a lock key.
    ///
    /// Two jobs with the same resource key must not run concurrently.
    pub fn resource_key(&self) -> String {
        match self {
            JobPayload::ScrapeFlyer(p) => format!("store:{}", p.store_id),
            JobPayload::ExtractPage(p) => format!("page:{}", p.page_id),
            JobPayload::MatchProducts(p) => format!("flyer:{}", p.flyer_id),
        }
    }

    /// Encode the payload body (without the tag).
    pub fn encode(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            JobPayload::ScrapeFlyer(p) => serde_json::to_value(p),
            JobPayload::ExtractPage(p) => serde_json::to_value(p),
            JobPayload::MatchProducts(p) => serde_json::to_value(p),
        }
    }

    /// Decode a payload body stored under `job_type`.
    pub fn decode(job_type: JobType, body: JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match job_type {
            JobType::ScrapeFlyer => JobPayload::ScrapeFlyer(serde_json::from_value(body)?),
            JobType::ExtractPage => JobPayload::ExtractPage(serde_json::from_value(body)?),
            JobType::MatchProducts => JobPayload::MatchProducts(serde_json::from_value(body)?),
        })
    }
}

impl From<ScrapeFlyerPayload> for JobPayload {
    fn from(value: ScrapeFlyerPayload) -> Self {
        JobPayload::ScrapeFlyer(value)
    }
}

impl From<ExtractPagePayload> for JobPayload {
    fn from(value: ExtractPagePayload) -> Self {
        JobPayload::ExtractPage(value)
    }
}

impl From<MatchProductsPayload> for JobPayload {
    fn from(value: MatchProductsPayload) -> Self {
        JobPayload::MatchProducts(value)
    }
}
