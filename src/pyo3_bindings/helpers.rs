//! Conversions between Python objects and store types

use pyo3::exceptions::{PyRuntimeError, PyTimeoutError, PyTypeError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyString};

use crate::codec::Value;
use crate::error::FoehnError;

/// A key or value copied out of a Python `str` or `bytes`.
///
/// Copying lets blocking calls run without holding the GIL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedValue {
  Text(String),
  Raw(Vec<u8>),
}

impl OwnedValue {
  pub fn as_value(&self) -> Value<'_> {
    match self {
      OwnedValue::Text(text) => Value::Text(text),
      OwnedValue::Raw(bytes) => Value::Raw(bytes),
    }
  }
}

/// Accept `str` or `bytes`; anything else is `InvalidValueType`.
pub fn extract_value(obj: &Bound<'_, PyAny>) -> Result<OwnedValue, FoehnError> {
  if let Ok(bytes) = obj.downcast::<PyBytes>() {
    return Ok(OwnedValue::Raw(bytes.as_bytes().to_vec()));
  }
  if let Ok(text) = obj.downcast::<PyString>() {
    return text
      .to_str()
      .map(|text| OwnedValue::Text(text.to_string()))
      .map_err(|error| FoehnError::Encoding(format!("str is not valid UTF-8: {error}")));
  }

  let type_name = obj
    .get_type()
    .name()
    .map(|name| name.to_string())
    .unwrap_or_else(|_| "unknown".to_string());
  Err(FoehnError::InvalidValueType(type_name))
}

/// Map store errors onto the Python exceptions hosts expect.
pub fn to_pyerr(error: FoehnError) -> PyErr {
  let message = error.to_string();
  match error {
    FoehnError::Timeout { .. } => PyTimeoutError::new_err(message),
    FoehnError::AlreadyRegistered
    | FoehnError::FabricUnavailable(_)
    | FoehnError::InvalidValueType(_)
    | FoehnError::TypeMismatch { .. }
    | FoehnError::FetchFailed { .. } => PyTypeError::new_err(message),
    _ => PyRuntimeError::new_err(message),
  }
}

#[cfg(all(test, feature = "python"))]
mod tests {
  use super::*;
  use crate::fabric::FabricStatus;
  use pyo3::types::PyList;

  #[test]
  fn errors_map_to_host_exceptions() {
    pyo3::prepare_freethreaded_python();
    Python::with_gil(|py| {
      let timeout = to_pyerr(FoehnError::Timeout {
        key: "k".to_string(),
      });
      assert!(timeout.is_instance_of::<PyTimeoutError>(py));

      let type_errors = [
        FoehnError::AlreadyRegistered,
        FoehnError::FabricUnavailable(FabricStatus::Unreachable),
        FoehnError::InvalidValueType("int".to_string()),
        FoehnError::TypeMismatch {
          key: "k".to_string(),
          found: "uint32",
        },
        FoehnError::FetchFailed {
          key: "k".to_string(),
          status: FabricStatus::Error,
        },
      ];
      for error in type_errors {
        assert!(to_pyerr(error).is_instance_of::<PyTypeError>(py));
      }

      let runtime_errors = [
        FoehnError::NotInitialized,
        FoehnError::Encoding("empty key".to_string()),
        FoehnError::NullValue {
          key: "k".to_string(),
        },
        FoehnError::CommitFailed {
          key: "k".to_string(),
          status: FabricStatus::Error,
        },
      ];
      for error in runtime_errors {
        let err = to_pyerr(error);
        assert!(err.is_instance_of::<PyRuntimeError>(py));
        assert!(!err.is_instance_of::<PyTypeError>(py));
      }
    });
  }

  #[test]
  fn extract_accepts_str_and_bytes_only() {
    pyo3::prepare_freethreaded_python();
    Python::with_gil(|py| {
      let text = PyString::new(py, "addr/0");
      assert_eq!(
        extract_value(text.as_any()).expect("str"),
        OwnedValue::Text("addr/0".to_string())
      );

      let raw = PyBytes::new(py, &[0u8, 1, 0]);
      assert_eq!(
        extract_value(raw.as_any()).expect("bytes"),
        OwnedValue::Raw(vec![0, 1, 0])
      );

      let list = PyList::empty(py);
      let err = extract_value(list.as_any()).expect_err("list");
      assert!(matches!(&err, FoehnError::InvalidValueType(found) if found == "list"));
      assert!(to_pyerr(err).is_instance_of::<PyTypeError>(py));
    });
  }
}
