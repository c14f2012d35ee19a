//! Error taxonomy for the valuation core.

use thiserror::Error;

use crate::data::CustomerId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CltvError {
    #[error("No transactions to aggregate")]
    EmptyInput,

    #[error("Customer {customer_id}: {reason}")]
    InvalidSummary { customer_id: CustomerId, reason: String },

    #[error("History #{index}: {reason}")]
    InvalidHistory { index: usize, reason: String },

    #[error(
        "Customer {customer_id}: monetary model needs frequency >= 1 and monetary > 0, \
         got frequency={frequency}, monetary={monetary}"
    )]
    InvalidMonetary {
        customer_id: CustomerId,
        frequency: f64,
        monetary: f64,
    },

    #[error("{model}: {customers} eligible customers, at least {required} required")]
    InsufficientData {
        model: &'static str,
        customers: usize,
        required: usize,
    },

    #[error("{model}: optimizer did not converge after {iterations} iterations")]
    NotConverged { model: &'static str, iterations: usize },

    #[error("{model}: ill-conditioned likelihood ({reason})")]
    IllConditioned { model: &'static str, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Churn rate is zero (every customer purchased more than once); \
         historical CLTV is undefined"
    )]
    DegenerateChurn,
}

pub type CltvResult<T> = Result<T, CltvError>;
