//! Built-in transformers.

use crate::bool_property;
use rhi_quarry::{
    Component, ComponentDescriptor, ComponentError, Dictionary, InputRow, PropertyDescriptor,
    PropertyKind, Provided, RunContext, Transformer, Value,
};
use std::sync::Arc;

/// Trims surrounding whitespace; one output per input.
#[derive(Debug, Clone, Default)]
pub struct TrimTransformer;

impl TrimTransformer {
    pub const ID: &'static str = "transformer.trim";

    pub fn new() -> Self {
        Self
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::transformer(Self::ID).description("Trim whitespace from text values")
    }
}

impl Component for TrimTransformer {}

impl Transformer for TrimTransformer {
    fn transform(&mut self, _row: &InputRow, values: &[Value]) -> Result<Vec<Value>, ComponentError> {
        Ok(values
            .iter()
            .map(|value| match value {
                Value::String(s) => Value::from(s.trim()),
                other => other.clone(),
            })
            .collect())
    }
}

/// First input with a value; a single output.
#[derive(Debug, Clone)]
pub struct CoalesceTransformer {
    empty_is_null: bool,
}

impl CoalesceTransformer {
    pub const ID: &'static str = "transformer.coalesce";

    pub fn new() -> Self {
        Self { empty_is_null: true }
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::transformer(Self::ID)
            .description("Pick the first non-null of several columns")
            .property(
                PropertyDescriptor::new("consider_empty_string_as_null", PropertyKind::Bool)
                    .default_value(true),
            )
    }
}

impl Default for CoalesceTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for CoalesceTransformer {
    fn configure(&mut self, name: &str, value: &Value) -> Result<(), ComponentError> {
        match name {
            "consider_empty_string_as_null" => {
                self.empty_is_null = bool_property(name, value)?;
                Ok(())
            }
            other => Err(ComponentError::UnknownProperty(other.to_string())),
        }
    }
}

impl Transformer for CoalesceTransformer {
    fn transform(&mut self, _row: &InputRow, values: &[Value]) -> Result<Vec<Value>, ComponentError> {
        let first = values
            .iter()
            .find(|v| !v.is_null() && !(self.empty_is_null && v.as_str() == Some("")))
            .cloned()
            .unwrap_or_default();
        Ok(vec![first])
    }
}

/// Whether each input's text is in a reference dictionary; one boolean
/// output per input, null for null inputs.
#[derive(Default)]
pub struct DictionaryMatcherTransformer {
    dictionary: Option<Arc<dyn Dictionary>>,
}

impl DictionaryMatcherTransformer {
    pub const ID: &'static str = "transformer.dictionary-matcher";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::transformer(Self::ID)
            .description("Flag values found in a reference dictionary")
            .property(PropertyDescriptor::new("dictionary", PropertyKind::Dictionary).required())
    }
}

impl Component for DictionaryMatcherTransformer {
    fn provide(&mut self, name: &str, resource: Provided) -> Result<(), ComponentError> {
        match (name, resource) {
            ("dictionary", Provided::Dictionary(dictionary)) => {
                self.dictionary = Some(dictionary);
                Ok(())
            }
            (other, _) => Err(ComponentError::UnknownProperty(other.to_string())),
        }
    }

    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        if self.dictionary.is_none() {
            return Err(ComponentError::MissingResource("dictionary".into()));
        }
        Ok(())
    }

    fn close(&mut self, _success: bool) -> Result<(), ComponentError> {
        self.dictionary = None;
        Ok(())
    }
}

impl Transformer for DictionaryMatcherTransformer {
    fn transform(&mut self, _row: &InputRow, values: &[Value]) -> Result<Vec<Value>, ComponentError> {
        let dictionary = self
            .dictionary
            .as_ref()
            .ok_or_else(|| ComponentError::MissingResource("dictionary".into()))?;
        Ok(values
            .iter()
            .map(|value| {
                if value.is_null() {
                    Value::Null
                } else {
                    Value::Bool(dictionary.contains(&value.to_string()))
                }
            })
            .collect())
    }
}
