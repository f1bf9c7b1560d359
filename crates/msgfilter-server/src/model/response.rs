//! HTTP response bodies for the distinct API

use serde::{Deserialize, Serialize};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_DUPLICATE: &str = "duplicate";
pub const RESULT_FAILURE: &str = "failure";

/// Body of `POST /distinct/`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistinctRequest {
    #[serde(default)]
    pub payload: Option<String>,
}

/// Answer for an accepted payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinctResult {
    pub result: String,
    pub payload: String,
}

impl DistinctResult {
    pub fn success(payload: String) -> Self {
        Self {
            result: RESULT_SUCCESS.to_string(),
            payload,
        }
    }

    pub fn duplicate(payload: String) -> Self {
        Self {
            result: RESULT_DUPLICATE.to_string(),
            payload,
        }
    }
}

/// Answer for a request that could not be checked
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub result: String,
    pub error: String,
}

impl ErrorResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: RESULT_FAILURE.to_string(),
            error: error.into(),
        }
    }
}
