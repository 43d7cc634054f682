//! AWS-backed implementations of the queue, object-store and metrics-sink
//! capabilities.

use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use aws_sdk_s3::primitives::ByteStream;
use nimbus_common::{
    MetricsSink, ObjectStore, OutcomeStatus, QueueClient, QueueError, QueueMessage, Runtime,
    StoreError,
};
use tracing::{debug, warn};

use crate::config::SqsConfig;

pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    wait_time_seconds: i32,
    max_messages: i32,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, config: &SqsConfig) -> Self {
        Self {
            client,
            queue_url: config.queue_url.clone(),
            wait_time_seconds: config.wait_time_seconds as i32,
            max_messages: config.max_number_of_messages as i32,
        }
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .wait_time_seconds(self.wait_time_seconds)
            .max_number_of_messages(self.max_messages)
            .send()
            .await
            .map_err(|e| QueueError(format!("receive: {e}")))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                let body = m.body()?.to_string();
                let receipt_handle = m.receipt_handle()?.to_string();
                Some(QueueMessage {
                    body,
                    receipt_handle,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError(format!("delete: {e}")))?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError(format!("change visibility: {e}")))?;
        Ok(())
    }
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StoreError::NotFound(format!("s3://{bucket}/{key}"))
                } else {
                    StoreError::Transport(format!("get s3://{bucket}/{key}: {e}"))
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transport(format!("read s3://{bucket}/{key}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("put s3://{bucket}/{key}: {e}")))?;
        Ok(())
    }
}

const METRIC_NAMESPACE: &str = "Nimbus/Agent";
const METRIC_PEAK_MEMORY: &str = "function_peak_memory_bytes";
const METRIC_FUNCTION_EXIT: &str = "function_exit";

/// CloudWatch metrics sink. Delivery failures are logged and swallowed:
/// losing a data point never affects a job.
pub struct CloudWatchSink {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchSink {
    pub fn new(client: aws_sdk_cloudwatch::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsSink for CloudWatchSink {
    async fn record_peak_memory(&self, function_id: &str, runtime: Runtime, bytes: u64) {
        let datum = MetricDatum::builder()
            .metric_name(METRIC_PEAK_MEMORY)
            .dimensions(
                Dimension::builder()
                    .name("function_id")
                    .value(function_id)
                    .build(),
            )
            .dimensions(
                Dimension::builder()
                    .name("runtime")
                    .value(runtime.as_str())
                    .build(),
            )
            .value(bytes as f64)
            .unit(StandardUnit::Bytes)
            .build();

        match self
            .client
            .put_metric_data()
            .namespace(METRIC_NAMESPACE)
            .metric_data(datum)
            .send()
            .await
        {
            Ok(_) => debug!(%function_id, bytes, "peak memory metric published"),
            Err(e) => warn!(error = %e, "failed to publish peak memory metric"),
        }
    }

    async fn record_exit(&self, status: OutcomeStatus) {
        let datum = MetricDatum::builder()
            .metric_name(METRIC_FUNCTION_EXIT)
            .dimensions(
                Dimension::builder()
                    .name("status")
                    .value(status.as_str())
                    .build(),
            )
            .value(1.0)
            .unit(StandardUnit::Count)
            .build();

        if let Err(e) = self
            .client
            .put_metric_data()
            .namespace(METRIC_NAMESPACE)
            .metric_data(datum)
            .send()
            .await
        {
            warn!(error = %e, "failed to publish exit counter");
        }
    }
}
