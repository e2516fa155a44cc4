//! Server faults.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable classification of a server fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The session identifier was rejected.
    SessionInvalid,
    /// The credentials were rejected.
    AuthenticationFailed,
    /// The contacted host is not the pool coordinator.
    NotCoordinator,
    /// The referenced object does not exist.
    ObjectNotFound,
    /// The caller lacks the required role.
    PermissionDenied,
    /// The object is not in a state that allows the call.
    InvalidState,
    /// A host involved in the call cannot be reached.
    HostUnreachable,
    /// Anything else.
    Other,
}

/// A fault reported by the server: a code plus string parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Fault code, e.g. `HANDLE_INVALID`.
    pub code: String,
    /// Code-specific parameters.
    pub params: Vec<String>,
}

impl Fault {
    /// Session identifier rejected.
    pub const SESSION_INVALID: &'static str = "SESSION_INVALID";
    /// Bad credentials.
    pub const SESSION_AUTHENTICATION_FAILED: &'static str = "SESSION_AUTHENTICATION_FAILED";
    /// Contacted host is not the coordinator; the parameter is the coordinator address.
    pub const HOST_IS_SLAVE: &'static str = "HOST_IS_SLAVE";
    /// Unknown object reference.
    pub const HANDLE_INVALID: &'static str = "HANDLE_INVALID";
    /// Role-based access check failed.
    pub const RBAC_PERMISSION_DENIED: &'static str = "RBAC_PERMISSION_DENIED";
    /// Another operation holds the object.
    pub const OTHER_OPERATION_IN_PROGRESS: &'static str = "OTHER_OPERATION_IN_PROGRESS";
    /// Host is down.
    pub const HOST_OFFLINE: &'static str = "HOST_OFFLINE";
    /// Host cannot be contacted.
    pub const HOST_UNREACHABLE: &'static str = "HOST_UNREACHABLE";
    /// Unknown method.
    pub const MESSAGE_METHOD_UNKNOWN: &'static str = "MESSAGE_METHOD_UNKNOWN";

    /// Creates a fault.
    pub fn new<I, S>(code: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code: code.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a fault without parameters.
    pub fn code(code: impl Into<String>) -> Self {
        Self::new(code, Vec::<String>::new())
    }

    /// Interprets a wire error description: an array whose first element is
    /// the code and whose remaining elements are parameters.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let items = value.as_array().ok_or(ProtocolError::UnexpectedShape {
            expected: "fault description array",
        })?;
        let (code, params) = items.split_first().ok_or(ProtocolError::UnexpectedShape {
            expected: "non-empty fault description",
        })?;
        let code = code.as_text().ok_or(ProtocolError::UnexpectedShape {
            expected: "fault code text",
        })?;
        let params = params
            .iter()
            .map(|p| match p {
                Value::Text(s) => s.clone(),
                Value::Ref(r) => r.to_string(),
                other => format!("{other:?}"),
            })
            .collect::<Vec<_>>();
        Ok(Self::new(code, params))
    }

    /// Converts to the wire form.
    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::from(self.code.clone())];
        items.extend(self.params.iter().cloned().map(Value::from));
        Value::Array(items)
    }

    /// Classifies the fault.
    pub fn kind(&self) -> FaultKind {
        match self.code.as_str() {
            Self::SESSION_INVALID => FaultKind::SessionInvalid,
            Self::SESSION_AUTHENTICATION_FAILED => FaultKind::AuthenticationFailed,
            Self::HOST_IS_SLAVE => FaultKind::NotCoordinator,
            Self::HANDLE_INVALID => FaultKind::ObjectNotFound,
            Self::RBAC_PERMISSION_DENIED => FaultKind::PermissionDenied,
            Self::HOST_OFFLINE | Self::HOST_UNREACHABLE => FaultKind::HostUnreachable,
            Self::OTHER_OPERATION_IN_PROGRESS => FaultKind::InvalidState,
            code if code.ends_with("_INVALID_STATE") || code.ends_with("_BAD_POWER_STATE") => {
                FaultKind::InvalidState
            }
            _ => FaultKind::Other,
        }
    }

    /// Returns the coordinator address carried by a `HOST_IS_SLAVE` fault.
    pub fn redirect_address(&self) -> Option<&str> {
        if self.kind() == FaultKind::NotCoordinator {
            self.params.first().map(String::as_str)
        } else {
            None
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{} [{}]", self.code, self.params.join(", "))
        }
    }
}
