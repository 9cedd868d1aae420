//! Receipt lifecycle controller.
//!
//! uploaded -> parsing -> parsed -> extracting -> extracted | review_required -> approved -> posted
//!
//! `failed` is reachable from every non-terminal state. `posted` has no way out.
//! Every transition is a single status-gated UPDATE carrying the payload or error
//! that caused it.

use sqlx::postgres::PgExecutor;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{self, ReceiptUpdate};
use crate::error::AppError;
use crate::models::{Receipt, ReceiptStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("receipt is already {from}; no transition to {to} allowed")]
    Terminal { from: ReceiptStatus, to: ReceiptStatus },

    #[error("illegal transition {from} -> {to}")]
    Illegal { from: ReceiptStatus, to: ReceiptStatus },

    #[error("receipt {receipt_id} is no longer {expected}")]
    Stale { receipt_id: Uuid, expected: ReceiptStatus },
}

/// Legal edges, including the two re-entry edges out of `failed`
pub fn can_transition(from: ReceiptStatus, to: ReceiptStatus) -> bool {
    use ReceiptStatus::*;
    match (from, to) {
        (Posted, _) => false,
        (Uploaded, Parsing) => true,
        (Parsing, Parsed) => true,
        (Parsed, Extracting) => true,
        (Extracting, Extracted | ReviewRequired) => true,
        (Extracted, ReviewRequired | Approved | Posted) => true,
        (ReviewRequired, Approved | Posted) => true,
        (Approved, Posted) => true,
        // automatic retry claim, manual retry
        (Failed, Parsing | Uploaded) => true,
        (Failed, Failed) => false,
        (_, Failed) => true,
        _ => false,
    }
}

pub fn check_transition(from: ReceiptStatus, to: ReceiptStatus) -> Result<(), TransitionError> {
    if from == ReceiptStatus::Posted {
        return Err(TransitionError::Terminal { from, to });
    }
    if !can_transition(from, to) {
        return Err(TransitionError::Illegal { from, to });
    }
    Ok(())
}

/// Validate the edge, then persist status and payload in one write.
/// Fails with a conflict when the row moved away from `from` in the meantime.
pub async fn transition<'e, E>(
    executor: E,
    receipt_id: Uuid,
    from: ReceiptStatus,
    to: ReceiptStatus,
    update: &ReceiptUpdate,
) -> Result<Receipt, AppError>
where
    E: PgExecutor<'e>,
{
    check_transition(from, to)?;
    match db::update_receipt(executor, receipt_id, from, to, update).await? {
        Some(receipt) => {
            tracing::debug!(receipt_id = %receipt_id, from = %from, to = %to, "receipt transitioned");
            Ok(receipt)
        }
        None => Err(TransitionError::Stale {
            receipt_id,
            expected: from,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReceiptStatus::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [Uploaded, Parsing, Parsed, Extracting, Extracted, Approved, Posted];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(can_transition(Extracting, ReviewRequired));
        assert!(can_transition(Extracted, ReviewRequired));
        assert!(can_transition(ReviewRequired, Posted));
    }

    #[test]
    fn test_nothing_leaves_posted() {
        for to in ReceiptStatus::ALL {
            assert!(!can_transition(Posted, to));
            assert_eq!(
                check_transition(Posted, to),
                Err(TransitionError::Terminal { from: Posted, to })
            );
        }
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for from in ReceiptStatus::ALL {
            if from.is_terminal() {
                continue;
            }
            assert!(can_transition(from, Failed), "{} -> failed", from);
        }
    }

    #[test]
    fn test_failed_reenters_only_through_retry_edges() {
        assert!(can_transition(Failed, Uploaded));
        assert!(can_transition(Failed, Parsing));
        assert!(!can_transition(Failed, Extracted));
        assert!(!can_transition(Failed, Posted));
    }

    #[test]
    fn test_backward_and_skipping_edges_are_illegal() {
        assert_eq!(
            check_transition(Extracted, Parsing),
            Err(TransitionError::Illegal { from: Extracted, to: Parsing })
        );
        assert!(!can_transition(Uploaded, Extracted));
        assert!(!can_transition(Parsing, Posted));
        assert!(!can_transition(Approved, ReviewRequired));
    }
}
