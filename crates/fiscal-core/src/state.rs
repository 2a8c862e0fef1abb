//! # Invoice State Machine
//!
//! ```text
//!                 ┌──────────── success ─────────────┐
//!                 │                                  ▼
//!  ┌─────────┐  submit  ┌──────┐  success   ┌─────────────┐
//!  │ pending │─────────►│ sent │───────────►│  confirmed  │ (terminal)
//!  └────┬────┘          └──┬───┘            └─────────────┘
//!       │ transient        │ transient             ▲
//!       ▼                  ▼                       │ success
//!  ┌─────────┐◄────────────┘                       │
//!  │  retry  │─────────────────────────────────────┘
//!  └────┬────┘◄──┐ transient, attempts < max
//!       │        │
//!       ├────────┘
//!       │ permanent, or attempts ≥ max
//!       ▼
//!  ┌─────────┐
//!  │ failed  │ (terminal)      pending/sent ── permanent ──► failed
//!  └─────────┘
//! ```
//!
//! Persistence enforces these transitions with compare-and-set updates
//! whose `WHERE status IN (…)` lists come from [`sources_of`] and
//! [`reopenable`].

use crate::types::InvoiceStatus;

/// Targets reachable from `from`.
pub const fn allowed_targets(from: InvoiceStatus) -> &'static [InvoiceStatus] {
    use InvoiceStatus::*;
    match from {
        Pending => &[Sent, Confirmed, Failed, Retry],
        Sent => &[Confirmed, Failed, Retry],
        Retry => &[Confirmed, Failed, Retry],
        Confirmed | Failed => &[],
    }
}

/// Returns true if `from → to` is in the transition table.
///
/// ```rust
/// use fiscal_core::state::can_transition;
/// use fiscal_core::types::InvoiceStatus::*;
///
/// assert!(can_transition(Pending, Sent));
/// assert!(can_transition(Retry, Retry));
/// assert!(!can_transition(Confirmed, Retry));
/// ```
pub fn can_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Statuses from which `to` may be reached, in [`InvoiceStatus::ALL`] order.
///
/// ```rust
/// use fiscal_core::state::sources_of;
/// use fiscal_core::types::InvoiceStatus::*;
///
/// assert_eq!(sources_of(Sent), vec![Pending]);
/// assert_eq!(sources_of(Confirmed), vec![Pending, Sent, Retry]);
/// ```
pub fn sources_of(to: InvoiceStatus) -> Vec<InvoiceStatus> {
    InvoiceStatus::ALL
        .into_iter()
        .filter(|from| can_transition(*from, to))
        .collect()
}

/// Result class of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    Transient,
    Permanent,
}

/// Manual resync is the only way out of `failed`: an operator reopens the
/// invoice as `retry` with its attempt count kept. Automatic processing
/// never leaves a terminal state.
pub const fn can_reopen(status: InvoiceStatus) -> bool {
    matches!(status, InvoiceStatus::Failed)
}

/// Statuses a manual resync may reopen.
pub fn reopenable() -> Vec<InvoiceStatus> {
    InvoiceStatus::ALL.into_iter().filter(|s| can_reopen(*s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvoiceStatus::*;

    const ALL: [InvoiceStatus; 5] = InvoiceStatus::ALL;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in ALL {
            assert!(!can_transition(Confirmed, to));
            assert!(!can_transition(Failed, to));
        }
    }

    #[test]
    fn test_nothing_returns_to_pending() {
        for from in ALL {
            assert!(!can_transition(from, Pending));
        }
    }

    #[test]
    fn test_retry_cannot_go_back_to_sent() {
        assert!(!can_transition(Retry, Sent));
        assert!(can_transition(Sent, Retry));
    }

    #[test]
    fn test_only_failed_reopens() {
        assert!(can_reopen(Failed));
        for status in [Pending, Sent, Confirmed, Retry] {
            assert!(!can_reopen(status));
        }
    }

    #[test]
    fn test_sources_of_each_target() {
        assert!(sources_of(Pending).is_empty());
        assert_eq!(sources_of(Sent), vec![Pending]);
        // Every attempt outcome can land from every live state
        for to in [Confirmed, Failed, Retry] {
            assert_eq!(sources_of(to), vec![Pending, Sent, Retry]);
        }
        assert_eq!(reopenable(), vec![Failed]);
    }
}
