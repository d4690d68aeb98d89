//! Outcomes of lifecycle operations.
//!
//! A provider refusing to charge is not an engine failure. Missing payment
//! methods, pending 3-D Secure challenges, and declined cards all come back
//! as successful returns carrying a [`RequiredAction`], so callers can route
//! the customer to the right next step instead of handling opaque errors.

use serde::{Deserialize, Serialize};

/// Why the operation could not complete payment, and what unblocks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredActionKind {
    /// No payment method on file; the customer must add one (usually via a
    /// hosted checkout session).
    PaymentMethodRequired,
    /// The charge needs strong customer authentication (3-D Secure).
    ScaRequired,
    /// The charge was attempted and declined.
    PaymentFailed,
}

/// A deferred payment step. The subscription state is parked (pending or
/// past-due) until the corresponding confirmation callback arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredAction {
    pub kind: RequiredActionKind,
    /// Where to send the customer: checkout URL, 3DS challenge URL, or a
    /// hosted invoice page for retrying a failed payment.
    pub payment_url: Option<String>,
}

impl RequiredAction {
    #[must_use]
    pub fn checkout(url: impl Into<String>) -> Self {
        Self {
            kind: RequiredActionKind::PaymentMethodRequired,
            payment_url: Some(url.into()),
        }
    }

    #[must_use]
    pub fn sca(url: impl Into<String>) -> Self {
        Self {
            kind: RequiredActionKind::ScaRequired,
            payment_url: Some(url.into()),
        }
    }

    #[must_use]
    pub fn payment_failed(url: Option<String>) -> Self {
        Self {
            kind: RequiredActionKind::PaymentFailed,
            payment_url: url,
        }
    }
}

/// Payment state reported by the provider after a charge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Paid,
    /// Nothing was due (free product, trial, 100% discount).
    NoPaymentRequired,
    RequiresPaymentMethod,
    RequiresAction { redirect_url: Option<String> },
    Failed { hosted_invoice_url: Option<String> },
}

impl PaymentState {
    /// Map a provider payment state onto the action the caller must surface.
    /// `Paid` and `NoPaymentRequired` need none.
    #[must_use]
    pub fn required_action(&self) -> Option<RequiredAction> {
        match self {
            Self::Paid | Self::NoPaymentRequired => None,
            Self::RequiresPaymentMethod => Some(RequiredAction {
                kind: RequiredActionKind::PaymentMethodRequired,
                payment_url: None,
            }),
            Self::RequiresAction { redirect_url } => Some(RequiredAction {
                kind: RequiredActionKind::ScaRequired,
                payment_url: redirect_url.clone(),
            }),
            Self::Failed { hosted_invoice_url } => {
                Some(RequiredAction::payment_failed(hosted_invoice_url.clone()))
            }
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::NoPaymentRequired)
    }
}
