//! Built-in components for Quarry.
//!
//! - Filters: [`MaxRowsFilter`], [`EqualsFilter`], [`NullCheckFilter`],
//!   [`DictionaryFilter`]. All but the dictionary filter can be pushed into
//!   the source query.
//! - Transformers: [`TrimTransformer`], [`CoalesceTransformer`],
//!   [`DictionaryMatcherTransformer`].
//! - Analyzers: [`StringAnalyzer`], [`ValueDistributionAnalyzer`],
//!   [`RowCollectorAnalyzer`].

mod analyzers;
mod filters;
mod transformers;

pub use analyzers::{RowCollectorAnalyzer, StringAnalyzer, ValueDistributionAnalyzer};
pub use filters::{
    DictionaryFilter, EqualsFilter, INVALID, MaxRowsFilter, NOT_NULL, NULL, NullCheckFilter, VALID,
};
pub use transformers::{CoalesceTransformer, DictionaryMatcherTransformer, TrimTransformer};

use rhi_quarry::{ComponentError, Registry, Value};

/// Register every built-in component with the registry.
pub fn register_all(registry: &mut Registry) {
    registry.register_filter(MaxRowsFilter::descriptor(), MaxRowsFilter::new);
    registry.register_filter(EqualsFilter::descriptor(), EqualsFilter::new);
    registry.register_filter(NullCheckFilter::descriptor(), NullCheckFilter::new);
    registry.register_filter(DictionaryFilter::descriptor(), DictionaryFilter::new);

    registry.register_transformer(TrimTransformer::descriptor(), TrimTransformer::new);
    registry.register_transformer(CoalesceTransformer::descriptor(), CoalesceTransformer::new);
    registry.register_transformer(
        DictionaryMatcherTransformer::descriptor(),
        DictionaryMatcherTransformer::new,
    );

    registry.register_analyzer(StringAnalyzer::descriptor(), StringAnalyzer::new);
    registry.register_analyzer(ValueDistributionAnalyzer::descriptor(), ValueDistributionAnalyzer::new);
    registry.register_analyzer(RowCollectorAnalyzer::descriptor(), RowCollectorAnalyzer::new);

    tracing::debug!(components = registry.len(), "registered built-in components");
}

pub(crate) fn u64_property(name: &str, value: &Value) -> Result<u64, ComponentError> {
    let n = value
        .as_i64()
        .ok_or_else(|| ComponentError::invalid_property(name, "expected an integer"))?;
    u64::try_from(n).map_err(|_| ComponentError::invalid_property(name, "must not be negative"))
}

pub(crate) fn bool_property(name: &str, value: &Value) -> Result<bool, ComponentError> {
    value
        .as_bool()
        .ok_or_else(|| ComponentError::invalid_property(name, "expected a boolean"))
}

pub(crate) fn string_list_property(name: &str, value: &Value) -> Result<Vec<String>, ComponentError> {
    value
        .as_string_list()
        .map(|items| items.into_iter().map(str::to_string).collect())
        .ok_or_else(|| ComponentError::invalid_property(name, "expected a list of strings"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhi_quarry::ComponentKind;

    #[test]
    fn test_register_all() {
        let mut registry = Registry::new();
        register_all(&mut registry);

        assert_eq!(registry.len(), 10);
        assert_eq!(registry.descriptors_of(ComponentKind::Filter).count(), 4);
        assert!(registry.create(MaxRowsFilter::ID).is_some());
        assert!(registry.get_decl(MaxRowsFilter::ID).unwrap().is_always_optimizable());
        assert!(!registry.get_decl(DictionaryFilter::ID).unwrap().is_query_optimizable());
    }

    #[test]
    fn test_property_helpers() {
        assert_eq!(u64_property("n", &Value::from(5i64)), Ok(5));
        assert!(u64_property("n", &Value::from(-1i64)).is_err());
        assert!(bool_property("b", &Value::from("yes")).is_err());
        assert_eq!(
            string_list_property("l", &Value::from(vec!["a", "b"])),
            Ok(vec!["a".to_string(), "b".to_string()])
        );
    }
}
