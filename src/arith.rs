//! Built-in arithmetic provider.
//!
//! Operands are the numeric entries under `arg/` in path order; arrays
//! contribute their numeric items. The result is written to
//! `result/value`.

use async_trait::async_trait;
use serde_json::Value;

use std::sync::Arc;

use crate::core::{Deployment, Exertion, Signature};
use crate::service::{Provisioner, Service};
use crate::{Error, Result};

pub const SERVICE_TYPE: &str = "Arithmetic";
pub const RESULT_PATH: &str = "result/value";
const ARG_PREFIX: &str = "arg/";

#[derive(Debug, Clone)]
pub struct Arithmetic {
    name: String,
}

impl Default for Arithmetic {
    fn default() -> Self {
        Self::new("Arithmetic")
    }
}

impl Arithmetic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn operands(task: &Exertion) -> Vec<f64> {
        let mut operands = Vec::new();
        for (path, value) in &task.context.entries {
            if !path.starts_with(ARG_PREFIX) {
                continue;
            }
            match value {
                Value::Array(items) => operands.extend(items.iter().filter_map(Value::as_f64)),
                other => operands.extend(other.as_f64()),
            }
        }
        operands
    }

    pub fn compute(selector: &str, operands: &[f64]) -> Result<f64> {
        let Some((first, rest)) = operands.split_first() else {
            return Err(Error::ServiceCall(format!("{}: no operands", selector)));
        };
        match selector {
            "add" => Ok(operands.iter().sum()),
            "subtract" => Ok(rest.iter().fold(*first, |acc, x| acc - x)),
            "multiply" => Ok(operands.iter().product()),
            "divide" => rest.iter().try_fold(*first, |acc, x| {
                if *x == 0.0 {
                    Err(Error::ServiceCall("divide: division by zero".to_string()))
                } else {
                    Ok(acc / x)
                }
            }),
            "average" => Ok(operands.iter().sum::<f64>() / operands.len() as f64),
            other => Err(Error::ServiceCall(format!("unknown selector '{}'", other))),
        }
    }
}

#[async_trait]
impl Service for Arithmetic {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, signature: &Signature) -> bool {
        signature.service_type == SERVICE_TYPE
            && matches!(
                signature.selector.as_str(),
                "add" | "subtract" | "multiply" | "divide" | "average"
            )
    }

    async fn service(&self, mut task: Exertion) -> Result<Exertion> {
        let selector = task
            .signature()
            .map(|s| s.selector.clone())
            .unwrap_or_default();
        let value = Self::compute(&selector, &Self::operands(&task))?;
        task.context.put(RESULT_PATH, value);
        task.trace(format!("{} {} = {}", self.name, selector, value));
        Ok(task)
    }
}

/// Deploys an [`Arithmetic`] instance named after each requested deployment.
#[derive(Debug, Default)]
pub struct ArithmeticDeployer;

#[async_trait]
impl Provisioner for ArithmeticDeployer {
    async fn provision(&self, deployment: &Deployment) -> Result<Arc<dyn Service>> {
        if deployment.service_type != SERVICE_TYPE {
            return Err(Error::ServiceCall(format!(
                "cannot deploy {}: only {} is available",
                deployment, SERVICE_TYPE
            )));
        }
        Ok(Arc::new(Arithmetic::new(&deployment.name)))
    }
}
