//! Financial calculator: pure breakdown computation over line items.
//!
//! Rounding happens once, on the final aggregated sums, never per line.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{
    AppliedTaxRate, ExtractedFields, FinancialBreakdown, LineItem, TaxLine, TreatmentComparison,
};

/// Tax rates used to expand a bare extracted amount into a line item.
#[derive(Debug, Clone)]
pub struct TaxProfile {
    pub standard: AppliedTaxRate,
    pub withholdings: Vec<AppliedTaxRate>,
}

impl Default for TaxProfile {
    fn default() -> Self {
        Self {
            standard: AppliedTaxRate {
                name: "IVA".to_string(),
                rate: Decimal::new(16, 2),
                withholding: false,
            },
            withholdings: vec![
                AppliedTaxRate {
                    name: "RET IVA".to_string(),
                    // Two-thirds of the standard rate, the statutory fraction.
                    rate: Decimal::new(106667, 6),
                    withholding: true,
                },
                AppliedTaxRate {
                    name: "RET ISR".to_string(),
                    rate: Decimal::new(10, 2),
                    withholding: true,
                },
            ],
        }
    }
}

/// Build a single tax-inclusive line from extractor output. Withholding
/// rates are attached only for customers the directory marks eligible; the
/// treatment flag decides later whether they count.
pub fn line_from_fields(
    fields: &ExtractedFields,
    profile: &TaxProfile,
    withholding_eligible: bool,
) -> LineItem {
    let mut taxes = vec![profile.standard.clone()];
    if withholding_eligible {
        taxes.extend(profile.withholdings.iter().cloned());
    }

    LineItem {
        description: if fields.order_ref.is_empty() {
            "Servicios".to_string()
        } else {
            fields.order_ref.clone()
        },
        quantity: Decimal::ONE,
        unit_price: fields.amount,
        tax_inclusive: true,
        taxes,
    }
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute the breakdown for a set of lines.
///
/// Tax-inclusive lines back the exclusive price out as
/// `price / (1 + primary_rate)` where the primary rate is the line's first
/// non-withholding rate. Withholding-flagged rates accumulate into the
/// withheld total only when `apply_withholding` is set.
pub fn compute_breakdown(
    lines: &[LineItem],
    apply_withholding: bool,
    discount: Decimal,
) -> FinancialBreakdown {
    let mut subtotal = Decimal::ZERO;
    let mut tax_total = Decimal::ZERO;
    let mut withheld_total = Decimal::ZERO;
    let mut taxes: Vec<TaxLine> = Vec::new();

    for line in lines {
        let primary_rate = line
            .taxes
            .iter()
            .find(|t| !t.withholding)
            .map(|t| t.rate)
            .unwrap_or(Decimal::ZERO);

        let exclusive_price = if line.tax_inclusive {
            line.unit_price / (Decimal::ONE + primary_rate)
        } else {
            line.unit_price
        };

        let line_subtotal = exclusive_price * line.quantity;
        subtotal += line_subtotal;

        for rate in &line.taxes {
            if rate.withholding && !apply_withholding {
                continue;
            }

            let amount = line_subtotal * rate.rate;
            if rate.withholding {
                withheld_total += amount;
            } else {
                tax_total += amount;
            }

            match taxes
                .iter_mut()
                .find(|t| t.name == rate.name && t.withholding == rate.withholding)
            {
                Some(entry) => entry.amount += amount,
                None => taxes.push(TaxLine {
                    name: rate.name.clone(),
                    amount,
                    withholding: rate.withholding,
                }),
            }
        }
    }

    let grand_total = subtotal + tax_total - withheld_total - discount;

    for tax in &mut taxes {
        tax.amount = round2(tax.amount);
    }

    FinancialBreakdown {
        subtotal: round2(subtotal),
        tax_total: round2(tax_total),
        withheld_total: round2(withheld_total),
        discount: round2(discount),
        grand_total: round2(grand_total),
        taxes,
    }
}

/// Compute both treatment variants so the operator can compare them before
/// committing. Required by the confirmation flow, not an optimization.
pub fn compare_treatments(lines: &[LineItem], discount: Decimal) -> TreatmentComparison {
    TreatmentComparison {
        withholding: compute_breakdown(lines, true, discount),
        no_withholding: compute_breakdown(lines, false, discount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().expect("valid decimal literal")
    }

    fn inclusive_line(price: &str) -> LineItem {
        LineItem {
            description: "Consulting".to_string(),
            quantity: Decimal::ONE,
            unit_price: dec(price),
            tax_inclusive: true,
            taxes: vec![
                AppliedTaxRate {
                    name: "IVA".to_string(),
                    rate: dec("0.16"),
                    withholding: false,
                },
                AppliedTaxRate {
                    name: "RET ISR".to_string(),
                    rate: dec("0.10"),
                    withholding: true,
                },
            ],
        }
    }

    #[test]
    fn backs_out_exclusive_price_from_inclusive_line() {
        let breakdown = compute_breakdown(&[inclusive_line("116.00")], false, Decimal::ZERO);

        assert_eq!(breakdown.subtotal, dec("100.00"));
        assert_eq!(breakdown.tax_total, dec("16.00"));
        assert_eq!(breakdown.withheld_total, dec("0.00"));
        assert_eq!(breakdown.grand_total, dec("116.00"));
    }

    #[test]
    fn inclusive_back_out_within_tolerance() {
        // P / (1 + r) and P - subtotal, both within 0.01 of the breakdown.
        let price = dec("137.45");
        let breakdown = compute_breakdown(
            &[inclusive_line("137.45")],
            false,
            Decimal::ZERO,
        );

        let expected_subtotal = price / dec("1.16");
        assert!((breakdown.subtotal - expected_subtotal).abs() < dec("0.01"));
        assert!((breakdown.tax_total - (price - expected_subtotal)).abs() < dec("0.01"));
    }

    #[test]
    fn withholding_subtracts_from_grand_total() {
        let breakdown = compute_breakdown(&[inclusive_line("116.00")], true, Decimal::ZERO);

        assert_eq!(breakdown.subtotal, dec("100.00"));
        assert_eq!(breakdown.tax_total, dec("16.00"));
        assert_eq!(breakdown.withheld_total, dec("10.00"));
        assert_eq!(breakdown.grand_total, dec("106.00"));

        let withheld_lines: Vec<_> = breakdown.taxes.iter().filter(|t| t.withholding).collect();
        assert_eq!(withheld_lines.len(), 1);
        assert_eq!(withheld_lines[0].amount, dec("10.00"));
    }

    #[test]
    fn both_treatments_computed_from_same_lines() {
        let lines = vec![inclusive_line("116.00"), inclusive_line("232.00")];
        let comparison = compare_treatments(&lines, Decimal::ZERO);

        assert_eq!(comparison.no_withholding.grand_total, dec("348.00"));
        assert_eq!(comparison.withholding.withheld_total, dec("30.00"));
        assert_eq!(comparison.withholding.grand_total, dec("318.00"));
        // Subtotals agree; only the withheld side differs.
        assert_eq!(
            comparison.withholding.subtotal,
            comparison.no_withholding.subtotal
        );
    }

    #[test]
    fn rounding_applies_to_aggregates_not_lines() {
        // Three lines whose raw subtotals each carry a long fraction; per-line
        // rounding would lose a cent against aggregate rounding.
        let lines = vec![
            inclusive_line("10.01"),
            inclusive_line("10.01"),
            inclusive_line("10.01"),
        ];
        let breakdown = compute_breakdown(&lines, false, Decimal::ZERO);

        // 30.03 / 1.16 = 25.8879..., aggregated before rounding.
        assert_eq!(breakdown.subtotal, dec("25.89"));
        // Per-line rounding (8.63 * 3) would give 25.89 too, but the tax side
        // distinguishes: 30.03 - 25.8879... = 4.1420... -> 4.14.
        assert_eq!(breakdown.tax_total, dec("4.14"));
    }

    #[test]
    fn discount_reduces_grand_total() {
        let breakdown = compute_breakdown(&[inclusive_line("116.00")], false, dec("16.00"));
        assert_eq!(breakdown.grand_total, dec("100.00"));
        assert_eq!(breakdown.discount, dec("16.00"));
    }

    #[test]
    fn line_from_fields_attaches_withholding_only_when_eligible() {
        let fields = ExtractedFields {
            customer_ref: "ACME".to_string(),
            order_ref: "PO-42".to_string(),
            amount: dec("116.00"),
            confidence: 90,
        };
        let profile = TaxProfile::default();

        let eligible = line_from_fields(&fields, &profile, true);
        assert_eq!(eligible.taxes.len(), 3);

        let ineligible = line_from_fields(&fields, &profile, false);
        assert_eq!(ineligible.taxes.len(), 1);
        assert!(ineligible.taxes.iter().all(|t| !t.withholding));
    }
}
