//! Python bindings
//!
//! Exposes the rendezvous store as `foehn._core.FabricStore`. The fabric is
//! reached over TCP using the `FOEHN_*` environment a launcher exports.

pub mod helpers;

use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyList};

use crate::config::StoreOptions;
use crate::fabric::TcpFabric;
use crate::lifecycle::LifecycleGuard;
use crate::store::RendezvousStore;

use helpers::{extract_value, to_pyerr, OwnedValue};

#[pyclass(name = "FabricStore", module = "foehn._core")]
pub struct PyFabricStore {
  inner: RendezvousStore,
}

#[pymethods]
impl PyFabricStore {
  /// Register this process with the fabric. Only one store may be created
  /// per process.
  #[new]
  #[pyo3(signature = (timeout = 30))]
  pub fn new(py: Python<'_>, timeout: u64) -> PyResult<Self> {
    let fabric = TcpFabric::from_env().map_err(to_pyerr)?;
    let options = StoreOptions::new().timeout_secs(timeout);
    let inner = py
      .allow_threads(|| RendezvousStore::open(LifecycleGuard::global(), Arc::new(fabric), options))
      .map_err(to_pyerr)?;
    Ok(Self { inner })
  }

  pub fn get_rank(&self) -> PyResult<u32> {
    self.inner.rank().map_err(to_pyerr)
  }

  /// Job size, or 4294967295 when the fabric does not know it.
  pub fn get_world(&self, py: Python<'_>) -> u32 {
    py.allow_threads(|| self.inner.group_size())
  }

  pub fn set(
    &self,
    py: Python<'_>,
    key: &Bound<'_, PyAny>,
    value: &Bound<'_, PyAny>,
  ) -> PyResult<()> {
    let key = extract_value(key).map_err(to_pyerr)?;
    let value = extract_value(value).map_err(to_pyerr)?;
    py.allow_threads(|| self.inner.put(key.as_value(), value.as_value()))
      .map_err(to_pyerr)
  }

  pub fn get<'py>(&self, py: Python<'py>, key: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyBytes>> {
    let key = extract_value(key).map_err(to_pyerr)?;
    let bytes = py
      .allow_threads(|| self.inner.get(key.as_value()))
      .map_err(to_pyerr)?;
    Ok(PyBytes::new(py, &bytes))
  }

  /// Block until every key exists. `timeout` (seconds) bounds each key and
  /// overrides the store's timeout for this call.
  #[pyo3(signature = (keys, timeout = None))]
  pub fn wait(&self, py: Python<'_>, keys: &Bound<'_, PyList>, timeout: Option<u64>) -> PyResult<()> {
    let keys = keys
      .iter()
      .map(|key| extract_value(&key))
      .collect::<Result<Vec<OwnedValue>, _>>()
      .map_err(to_pyerr)?;

    py.allow_threads(|| {
      let keys = keys.iter().map(OwnedValue::as_value);
      match timeout {
        Some(secs) => self
          .inner
          .wait_for_keys_within(keys, std::time::Duration::from_secs(secs)),
        None => self.inner.wait_for_keys(keys),
      }
    })
    .map_err(to_pyerr)
  }

  /// Leave the fabric now instead of at interpreter exit.
  pub fn finalize(&self) {
    self.inner.lifecycle().finalize();
  }
}

#[pymodule]
pub fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
  m.add_class::<PyFabricStore>()?;
  Ok(())
}
