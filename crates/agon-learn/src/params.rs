//! The single parameter store shared by all three phase optimizers.

use std::collections::HashMap;
use std::sync::MutexGuard;

use agon_core::AgonError;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

/// Prefix of the encoder/decoder variables.
pub const MODEL_PREFIX: &str = "model.";
/// Prefix of the classifier variables.
pub const CLASSIFIER_PREFIX: &str = "classifier.";

/// Named trainable variables of one model.
///
/// Built once by the orchestrator; every optimizer receives clones of the
/// same [`Var`]s, so an update made by one phase is seen by the next.
pub struct ParameterStore {
    var_map: VarMap,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self {
            var_map: VarMap::new(),
        }
    }
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("vars", &self.var_map.all_vars().len())
            .finish()
    }
}

impl ParameterStore {
    /// Creates an empty store. Pass [`ParameterStore::var_map`] to the model
    /// constructor to populate it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already populated map.
    pub fn from_var_map(var_map: VarMap) -> Self {
        Self { var_map }
    }

    /// The underlying map.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Every trainable variable.
    pub fn all_vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>, AgonError> {
        self.var_map
            .data()
            .lock()
            .map_err(|e| AgonError::internal("ParameterStore::lock", e))
    }

    /// Variables whose name starts with `prefix`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] if the map's lock is poisoned.
    pub fn vars_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Var)>, AgonError> {
        let data = self.lock()?;
        let mut out: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Current values of the variables under `prefix`, keyed by full name.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] if the map's lock is poisoned.
    pub fn named_tensors(&self, prefix: &str) -> Result<HashMap<String, Tensor>, AgonError> {
        Ok(self
            .vars_with_prefix(prefix)?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().detach()))
            .collect())
    }

    /// Overwrites variables with `tensors`. Every stored variable under
    /// `prefix` must be present with a matching shape; extra entries are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Checkpoint`] on a missing, unknown or misshapen
    /// entry.
    pub fn assign(&self, prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<(), AgonError> {
        let vars = self.vars_with_prefix(prefix)?;
        if let Some(unknown) = tensors.keys().find(|k| !vars.iter().any(|(n, _)| n == *k)) {
            return Err(AgonError::Checkpoint {
                message: format!("unknown parameter {unknown}"),
            });
        }
        for (name, var) in &vars {
            let value = tensors.get(name).ok_or_else(|| AgonError::Checkpoint {
                message: format!("missing parameter {name}"),
            })?;
            if value.dims() != var.dims() {
                return Err(AgonError::Checkpoint {
                    message: format!("parameter {name}: expected shape {:?}, got {:?}", var.dims(), value.dims()),
                });
            }
            value
                .to_device(var.device())
                .and_then(|v| v.to_dtype(var.dtype()))
                .and_then(|v| var.set(&v))
                .map_err(|e| AgonError::internal("ParameterStore::assign", e))?;
        }
        Ok(())
    }

    /// Total number of scalar parameters.
    pub fn element_count(&self) -> usize {
        self.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}
