//! Invoice draft, line item and financial breakdown models.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::batch::TaxTreatment;

/// A tax rate applied to a line. Withholding rates subtract from the total
/// instead of adding to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedTaxRate {
    pub name: String,
    pub rate: Decimal,
    pub withholding: bool,
}

/// Line item on an invoice draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// When set, `unit_price` already contains the primary tax and the
    /// exclusive price is backed out before accumulation.
    pub tax_inclusive: bool,
    pub taxes: Vec<AppliedTaxRate>,
}

/// One aggregated tax amount in a breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxLine {
    pub name: String,
    pub amount: Decimal,
    pub withholding: bool,
}

/// Derived totals. Never persisted as source of truth; always recomputed
/// from the line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialBreakdown {
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub withheld_total: Decimal,
    pub discount: Decimal,
    pub grand_total: Decimal,
    pub taxes: Vec<TaxLine>,
}

/// Both treatment variants, computed before the operator commits to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentComparison {
    pub withholding: FinancialBreakdown,
    pub no_withholding: FinancialBreakdown,
}

/// Fully-allocated draft handed to the submission queue. The folio is fixed
/// here; nothing downstream may change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub series: String,
    pub folio: i64,
    pub treatment: TaxTreatment,
    pub line_items: Vec<LineItem>,
    pub breakdown: FinancialBreakdown,
}

/// Directory resolution result for a customer reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: Uuid,
    pub name: String,
    pub withholding_eligible: bool,
}

/// Artifact rendition formats offered by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionFormat {
    Pdf,
    Xml,
}

impl RenditionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionFormat::Pdf => "pdf",
            RenditionFormat::Xml => "xml",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl std::str::FromStr for RenditionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pdf" => Ok(RenditionFormat::Pdf),
            "xml" => Ok(RenditionFormat::Xml),
            _ => Err(format!("Invalid rendition format: {}", s)),
        }
    }
}
