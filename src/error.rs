//! Error taxonomy for the interop layer.
//!
//! Every failure that can surface to script code is one of these variants.
//! Signature and marshalling errors are always raised before control is
//! transferred to native code; native faults come from the memory probes
//! that guard every dereference performed on script's behalf.

use thiserror::Error;

use crate::runtime::value::ScriptValue;

#[derive(Debug, Error)]
pub enum InteropError {
    /// Malformed or unsupported signature text.
    #[error("signature error at offset {offset} in '{text}': {message}")]
    Signature {
        text: String,
        offset: usize,
        message: String,
    },

    /// Type mismatch, out-of-range conversion or disallowed by-value aggregate.
    #[error("marshalling error: {0}")]
    Marshal(String),

    /// Invalid memory access detected before it happened.
    #[error("native memory fault: {0}")]
    NativeFault(String),

    /// Library, symbol, named type or module could not be found.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Calling convention or platform feature that is not implemented here.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// An exception thrown by script code, carried across a native call.
    #[error("script exception: {0}")]
    Thrown(ScriptValue),
}

impl InteropError {
    pub fn signature(text: &str, offset: usize, message: impl Into<String>) -> Self {
        InteropError::Signature {
            text: text.to_string(),
            offset,
            message: message.into(),
        }
    }

    pub fn marshal(message: impl Into<String>) -> Self {
        InteropError::Marshal(message.into())
    }

    pub fn fault(message: impl Into<String>) -> Self {
        InteropError::NativeFault(message.into())
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        InteropError::Resolution(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        InteropError::Unsupported(message.into())
    }

    /// Convenience for script functions that want to throw a string.
    pub fn thrown(message: &str) -> Self {
        InteropError::Thrown(ScriptValue::string(message))
    }

    pub fn is_signature(&self) -> bool {
        matches!(self, InteropError::Signature { .. })
    }

    pub fn is_marshal(&self) -> bool {
        matches!(self, InteropError::Marshal(_))
    }

    pub fn is_resolution(&self) -> bool {
        matches!(self, InteropError::Resolution(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, InteropError::NativeFault(_))
    }
}

pub type InteropResult<T> = Result<T, InteropError>;
