//! Shared request/response types for the `Add` demos.
//!
//! Field names match the wire JSON (`{"X":2,"Y":3}` -> `{"Z":5}`).
use serde::{Deserialize, Serialize};

/// Method name the server registers.
pub const ADD_METHOD: &str = "Add";

/// Request to add two numbers.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddRequest {
    #[serde(rename = "X")]
    pub x: i64,
    #[serde(rename = "Y")]
    pub y: i64,
}

/// Response containing the sum.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddResponse {
    #[serde(rename = "Z")]
    pub z: i64,
}
