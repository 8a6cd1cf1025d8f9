//! Ambient correlation context for published envelopes.
//!
//! A request-scoped [`CorrelationScope`] can be installed around any async
//! block; envelopes built inside the scope inherit its identifiers unless the
//! caller supplies its own metadata for the same keys.

use std::future::Future;

use serde_json::{Map, Value};

tokio::task_local! {
    static SCOPE: CorrelationScope;
}

/// Correlation identifiers propagated from the active request scope into
/// envelope metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationScope {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl CorrelationScope {
    /// Merge the scope into an envelope metadata map. Caller-supplied keys
    /// win over ambient values.
    pub(crate) fn merge_into(&self, metadata: &mut Map<String, Value>) {
        let fields = [
            ("trace_id", &self.trace_id),
            ("span_id", &self.span_id),
            ("parent_span_id", &self.parent_span_id),
            ("correlation_id", &self.correlation_id),
            ("causation_id", &self.causation_id),
            ("user_id", &self.user_id),
            ("tenant_id", &self.tenant_id),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                if !metadata.contains_key(key) {
                    metadata.insert(key.to_string(), Value::String(v.clone()));
                }
            }
        }
    }
}

/// Run a future with the given correlation scope installed.
pub async fn with_scope<F: Future>(scope: CorrelationScope, f: F) -> F::Output {
    SCOPE.scope(scope, f).await
}

/// The currently installed scope, if any.
pub fn current() -> Option<CorrelationScope> {
    SCOPE.try_with(|s| s.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_is_visible_inside_and_absent_outside() {
        assert!(current().is_none());

        let scope = CorrelationScope {
            trace_id: Some("t-1".into()),
            correlation_id: Some("c-1".into()),
            ..Default::default()
        };
        with_scope(scope.clone(), async {
            assert_eq!(current(), Some(scope));
        })
        .await;

        assert!(current().is_none());
    }

    #[test]
    fn caller_metadata_wins() {
        let scope = CorrelationScope {
            trace_id: Some("ambient".into()),
            user_id: Some("u-9".into()),
            ..Default::default()
        };
        let mut metadata = Map::new();
        metadata.insert("trace_id".into(), Value::String("explicit".into()));
        scope.merge_into(&mut metadata);

        assert_eq!(metadata["trace_id"], Value::String("explicit".into()));
        assert_eq!(metadata["user_id"], Value::String("u-9".into()));
    }
}
