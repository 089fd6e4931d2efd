use rust_decimal::Decimal;

use crate::decode::ParsedOrder;
use crate::errors::ValidationError;

pub const COMPANY_ID_LEN: usize = 10;

/// Business-rule checks applied to every decoded order. Stateless; a failure
/// condemns only the offending record.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderValidator;

impl OrderValidator {
    pub fn validate(&self, order: &ParsedOrder) -> std::result::Result<(), ValidationError> {
        if order.order_id.trim().is_empty() {
            return Err(ValidationError::EmptyOrderId);
        }
        if order.company_id.trim().is_empty() {
            return Err(ValidationError::EmptyCompanyId);
        }
        if order.company_id.chars().count() != COMPANY_ID_LEN {
            return Err(ValidationError::CompanyIdLength {
                expected: COMPANY_ID_LEN,
                actual: order.company_id.chars().count(),
            });
        }
        if order.customer_name.trim().is_empty() {
            return Err(ValidationError::EmptyCustomerName);
        }
        match order.total_amount {
            None => return Err(ValidationError::MissingAmount),
            Some(amount) if amount < Decimal::ZERO => {
                return Err(ValidationError::NegativeAmount(amount));
            }
            Some(_) => {}
        }
        if order.status.trim().is_empty() {
            return Err(ValidationError::EmptyStatus);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_order() -> ParsedOrder {
        ParsedOrder {
            order_id: "ORDER001".to_string(),
            company_id: "COMP000001".to_string(),
            customer_name: "John Doe".to_string(),
            total_amount: Some(Decimal::new(10000, 2)),
            status: "PENDING".to_string(),
        }
    }

    #[test]
    fn accepts_valid_order() {
        assert!(OrderValidator.validate(&valid_order()).is_ok());
    }

    #[test]
    fn company_id_must_be_exactly_ten_characters() {
        for bad in ["COMP1", "COMP0000001", "C"] {
            let mut order = valid_order();
            order.company_id = bad.to_string();
            let err = OrderValidator.validate(&order).unwrap_err();
            assert_eq!(
                err,
                ValidationError::CompanyIdLength {
                    expected: COMPANY_ID_LEN,
                    actual: bad.chars().count(),
                }
            );
        }
    }

    #[test]
    fn negative_amount_fails_zero_passes() {
        let mut order = valid_order();
        order.total_amount = Some(Decimal::new(-1, 2));
        assert_eq!(
            OrderValidator.validate(&order).unwrap_err(),
            ValidationError::NegativeAmount(Decimal::new(-1, 2))
        );

        order.total_amount = Some(Decimal::ZERO);
        assert!(OrderValidator.validate(&order).is_ok());
    }

    #[test]
    fn missing_amount_fails() {
        let mut order = valid_order();
        order.total_amount = None;
        assert_eq!(
            OrderValidator.validate(&order).unwrap_err(),
            ValidationError::MissingAmount
        );
    }

    #[test]
    fn empty_required_fields_fail() {
        let mut order = valid_order();
        order.order_id = String::new();
        assert_eq!(
            OrderValidator.validate(&order).unwrap_err(),
            ValidationError::EmptyOrderId
        );

        let mut order = valid_order();
        order.customer_name = "  ".to_string();
        assert_eq!(
            OrderValidator.validate(&order).unwrap_err(),
            ValidationError::EmptyCustomerName
        );

        let mut order = valid_order();
        order.status = String::new();
        assert_eq!(
            OrderValidator.validate(&order).unwrap_err(),
            ValidationError::EmptyStatus
        );
    }
}
