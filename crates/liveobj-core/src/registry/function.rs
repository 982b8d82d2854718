//! Native function table entries and argument access.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{LiveObjError, Result};
use crate::server::CallContext;
use crate::value::{Object, Value};

pub type NativeFuture = BoxFuture<'static, Result<Value>>;

/// A registered function: receives the call context, the decoded receiver
/// and the decoded arguments.
pub type NativeFn = Arc<dyn Fn(CallContext, Value, Args) -> NativeFuture + Send + Sync>;

pub(crate) struct FunctionEntry {
    pub(crate) qualified_name: String,
    pub(crate) func: NativeFn,
}

static NULL: Value = Value::Null;

/// Decoded call arguments. Missing trailing arguments read as `Null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&NULL)
    }

    pub fn str(&self, index: usize) -> Result<&str> {
        self.get(index)
            .as_str()
            .ok_or_else(|| expected(index, "a string"))
    }

    pub fn f64(&self, index: usize) -> Result<f64> {
        self.get(index)
            .as_f64()
            .ok_or_else(|| expected(index, "a number"))
    }

    pub fn i64(&self, index: usize) -> Result<i64> {
        self.get(index)
            .as_i64()
            .ok_or_else(|| expected(index, "an integer"))
    }

    pub fn object(&self, index: usize) -> Result<&Object> {
        self.get(index)
            .as_object()
            .ok_or_else(|| expected(index, "an object"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

fn expected(index: usize, what: &str) -> LiveObjError {
    LiveObjError::invalid_params(format!("argument {} must be {}", index, what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_args_read_as_null() {
        let args = Args::new(vec![Value::from(1)]);
        assert_eq!(args.i64(0).unwrap(), 1);
        assert!(args.get(5).is_null());
    }

    #[test]
    fn test_type_mismatch() {
        let args = Args::new(vec![Value::from("x")]);
        match args.f64(0) {
            Err(LiveObjError::InvalidParams { message }) => {
                assert_eq!(message, "argument 0 must be a number")
            }
            other => panic!("Expected InvalidParams, got {:?}", other),
        }
    }
}
