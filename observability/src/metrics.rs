//! Operation metrics of the session manager, recorded against the global
//! OpenTelemetry meter. The host application installs the exporter.
use crate::metrics_names::{TAG_CHAIN_ID, TAG_ERROR, TAG_OPERATION};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};
use std::any::Any;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_METRICS_PREFIX: &str = "fhevm_session";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error("Metric tag {0} has an empty value")]
    EmptyTag(&'static str),
}

fn tag(key: &'static str, value: impl Into<String>) -> Result<KeyValue, MetricError> {
    let value = value.into();
    if value.is_empty() {
        return Err(MetricError::EmptyTag(key));
    }
    Ok(KeyValue::new(key, value))
}

#[derive(Debug)]
pub struct CoreMetrics {
    operations: Counter<u64>,
    errors: Counter<u64>,
    wallet_prompts: Counter<u64>,
    cache_hits: Counter<u64>,
    duration: Histogram<f64>,
    batch_size: Histogram<u64>,
    /// Keeps the non-blocking log writer alive for the lifetime of the process.
    trace_guard: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_PREFIX)
    }
}

impl CoreMetrics {
    pub fn new(prefix: &str) -> Self {
        let meter = global::meter("fhevm_session");

        let operations = meter
            .u64_counter(format!("{prefix}_operations"))
            .with_description("Session operations started")
            .with_unit("operations")
            .build();
        // Exported from the start, even before the first operation.
        operations.add(0, &[]);

        let errors = meter
            .u64_counter(format!("{prefix}_operation_errors"))
            .with_description("Session operations that failed, by error kind")
            .with_unit("errors")
            .build();
        errors.add(0, &[]);

        let wallet_prompts = meter
            .u64_counter(format!("{prefix}_wallet_prompts"))
            .with_description("Typed-data signing prompts sent to the wallet")
            .with_unit("prompts")
            .build();
        wallet_prompts.add(0, &[]);

        let cache_hits = meter
            .u64_counter(format!("{prefix}_authorization_cache_hits"))
            .with_description("Decryption authorizations served from the store")
            .with_unit("hits")
            .build();

        let duration = meter
            .f64_histogram(format!("{prefix}_operation_duration_ms"))
            .with_description("Duration of session operations")
            .with_unit("milliseconds")
            .build();

        let batch_size = meter
            .u64_histogram(format!("{prefix}_batch_size"))
            .with_description("Values per encryption or handles per decryption")
            .with_unit("items")
            .build();

        Self {
            operations,
            errors,
            wallet_prompts,
            cache_hits,
            duration,
            batch_size,
            trace_guard: Mutex::new(None),
        }
    }

    pub fn set_trace_guard(&self, guard: Box<dyn Any + Send + Sync>) {
        if let Ok(mut trace_guard) = self.trace_guard.lock() {
            *trace_guard = Some(guard);
        }
    }

    pub fn increment_request_counter(&self, operation: &str) -> Result<(), MetricError> {
        self.operations.add(1, &[tag(TAG_OPERATION, operation)?]);
        Ok(())
    }

    pub fn increment_error_counter(&self, operation: &str, error: &str) -> Result<(), MetricError> {
        self.errors.add(
            1,
            &[tag(TAG_OPERATION, operation)?, tag(TAG_ERROR, error)?],
        );
        Ok(())
    }

    pub fn increment_wallet_prompt_counter(&self, chain_id: u64) -> Result<(), MetricError> {
        self.wallet_prompts
            .add(1, &[tag(TAG_CHAIN_ID, chain_id.to_string())?]);
        Ok(())
    }

    pub fn increment_cache_hit_counter(&self, operation: &str) -> Result<(), MetricError> {
        self.cache_hits.add(1, &[tag(TAG_OPERATION, operation)?]);
        Ok(())
    }

    pub fn observe_batch_size(&self, operation: &str, size: usize) -> Result<(), MetricError> {
        self.batch_size
            .record(size as u64, &[tag(TAG_OPERATION, operation)?]);
        Ok(())
    }

    /// Starts building a guard that records the duration of `operation` when dropped.
    pub fn time_operation(&self, operation: &str) -> Result<DurationGuardBuilder<'_>, MetricError> {
        Ok(DurationGuardBuilder {
            metrics: self,
            tags: vec![tag(TAG_OPERATION, operation)?],
        })
    }
}

#[derive(Debug)]
pub struct DurationGuardBuilder<'a> {
    metrics: &'a CoreMetrics,
    tags: Vec<KeyValue>,
}

impl<'a> DurationGuardBuilder<'a> {
    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Result<Self, MetricError> {
        self.tags.push(tag(key, value)?);
        Ok(self)
    }

    pub fn start(self) -> DurationGuard<'a> {
        DurationGuard {
            metrics: self.metrics,
            tags: self.tags,
            start: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct DurationGuard<'a> {
    metrics: &'a CoreMetrics,
    tags: Vec<KeyValue>,
    start: Instant,
}

impl Drop for DurationGuard<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.duration.record(elapsed_ms, &self.tags);
    }
}

lazy_static::lazy_static! {
    pub static ref METRICS: CoreMetrics = CoreMetrics::default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_names::{ERR_TYPE_MISMATCH, OP_ENCRYPT, OP_USER_DECRYPT};

    #[test]
    fn empty_tag_values_are_rejected() {
        let metrics = CoreMetrics::default();
        metrics.increment_request_counter(OP_ENCRYPT).unwrap();
        metrics
            .increment_error_counter(OP_ENCRYPT, ERR_TYPE_MISMATCH)
            .unwrap();
        metrics.increment_wallet_prompt_counter(31337).unwrap();
        assert_eq!(
            metrics.increment_request_counter(""),
            Err(MetricError::EmptyTag(TAG_OPERATION))
        );
        assert_eq!(
            metrics.increment_error_counter(OP_ENCRYPT, ""),
            Err(MetricError::EmptyTag(TAG_ERROR))
        );
    }

    #[test]
    fn duration_guard() {
        let metrics = CoreMetrics::new("test");
        let guard = metrics
            .time_operation(OP_USER_DECRYPT)
            .and_then(|b| b.tag(TAG_CHAIN_ID, "31337"))
            .map(|b| b.start());
        assert!(guard.is_ok());
        assert!(metrics
            .time_operation(OP_USER_DECRYPT)
            .and_then(|b| b.tag(TAG_CHAIN_ID, ""))
            .is_err());
    }
}
