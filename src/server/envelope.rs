use axum::Json;
use serde::{Serialize, Deserialize};

/// Success
pub const ERR_OK: i32 = 0;

/// Request payload could not be decoded
pub const ERR_DATA: i32 = 1000;

/// Required request parameter missing or mistyped
pub const ERR_INPUT: i32 = 1001;

/// Repository write failed
pub const ERR_DB: i32 = 2000;

/// Uniform response body of both HTTP surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonResult<T> {
    pub err: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> JsonResult<T> {
    pub fn ok(data: Option<T>) -> Self {
        Self {
            err: ERR_OK,
            msg: None,
            data,
        }
    }

    pub fn error(err: i32, msg: impl Into<String>) -> Self {
        Self {
            err,
            msg: Some(msg.into()),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err == ERR_OK
    }
}

impl<T: Serialize> JsonResult<T> {
    /// Wrap for an axum handler return
    pub fn into_json(self) -> Json<Self> {
        Json(self)
    }
}
