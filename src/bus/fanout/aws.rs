//! AWS SNS/SQS implementation of [`FanoutClient`].
//!
//! Works against AWS or LocalStack (`endpoint_url`). Service errors that the
//! relay treats specially are mapped to `FanoutError::NotFound` and
//! `FanoutError::QueueAlreadyExists`; everything else is a transport error.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use tracing::{debug, info};

use super::{FanoutClient, FanoutError, ReceivedMessage, SubscriptionInfo};

/// Connection settings for SNS/SQS.
#[derive(Clone, Debug, Default)]
pub struct AwsFanoutConfig {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

/// SNS/SQS client pair.
#[derive(Clone)]
pub struct AwsFanoutClient {
    sns: SnsClient,
    sqs: SqsClient,
}

fn transport(context: &str, err: impl std::fmt::Display) -> FanoutError {
    FanoutError::Transport(format!("{}: {}", context, err))
}

impl AwsFanoutClient {
    /// Load AWS config and build both clients.
    pub async fn connect(config: &AwsFanoutConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS SNS/SQS"
        );

        Self::from_clients(SnsClient::new(&aws_config), SqsClient::new(&aws_config))
    }

    pub fn from_clients(sns: SnsClient, sqs: SqsClient) -> Self {
        Self { sns, sqs }
    }
}

#[async_trait]
impl FanoutClient for AwsFanoutClient {
    async fn topic_exists(&self, topic_arn: &str) -> Result<(), FanoutError> {
        match self
            .sns
            .get_topic_attributes()
            .topic_arn(topic_arn)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found_exception() {
                    Err(FanoutError::NotFound(topic_arn.to_string()))
                } else {
                    Err(transport("Failed to get topic attributes", service_error))
                }
            }
        }
    }

    async fn create_topic(&self, name: &str) -> Result<String, FanoutError> {
        let output = self
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| transport("Failed to create SNS topic", e))?;
        output
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| FanoutError::Transport("SNS create_topic returned no ARN".to_string()))
    }

    async fn create_queue(&self, name: &str) -> Result<String, FanoutError> {
        match self.sqs.create_queue().queue_name(name).send().await {
            Ok(output) => output.queue_url().map(str::to_string).ok_or_else(|| {
                FanoutError::Transport("SQS create_queue returned no URL".to_string())
            }),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_queue_name_exists() {
                    Err(FanoutError::QueueAlreadyExists(name.to_string()))
                } else {
                    Err(transport("Failed to create SQS queue", service_error))
                }
            }
        }
    }

    async fn queue_url(&self, name: &str) -> Result<String, FanoutError> {
        match self.sqs.get_queue_url().queue_name(name).send().await {
            Ok(output) => output
                .queue_url()
                .map(str::to_string)
                .ok_or_else(|| FanoutError::NotFound(name.to_string())),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_queue_does_not_exist() {
                    Err(FanoutError::NotFound(name.to_string()))
                } else {
                    Err(transport("Failed to get queue URL", service_error))
                }
            }
        }
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String, FanoutError> {
        let output = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| transport("Failed to get queue ARN", e))?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| FanoutError::NotFound(format!("ARN of {}", queue_url)))
    }

    async fn list_subscriptions(
        &self,
        topic_arn: &str,
    ) -> Result<Vec<SubscriptionInfo>, FanoutError> {
        let mut subscriptions = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .sns
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| transport("Failed to list subscriptions", e))?;

            subscriptions.extend(output.subscriptions().iter().filter_map(|s| {
                Some(SubscriptionInfo {
                    subscription_arn: s.subscription_arn()?.to_string(),
                    protocol: s.protocol()?.to_string(),
                    endpoint: s.endpoint()?.to_string(),
                })
            }));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(subscriptions)
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, FanoutError> {
        let output = self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| transport("Failed to subscribe queue to topic", e))?;

        debug!(endpoint = %endpoint, topic_arn = %topic_arn, "Subscribed endpoint to topic");
        output
            .subscription_arn()
            .map(str::to_string)
            .ok_or_else(|| FanoutError::Transport("SNS subscribe returned no ARN".to_string()))
    }

    async fn set_queue_policy(&self, queue_url: &str, policy: &str) -> Result<(), FanoutError> {
        self.sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .attributes(QueueAttributeName::Policy, policy)
            .send()
            .await
            .map_err(|e| transport("Failed to set queue policy", e))?;
        Ok(())
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<String, FanoutError> {
        let output = self
            .sns
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .set_subject(subject.map(str::to_string))
            .send()
            .await
            .map_err(|e| transport("Failed to publish to SNS", e))?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>, FanoutError> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_secs)
            .send()
            .await
            .map_err(|e| transport("Failed to receive messages", e))?;

        Ok(output
            .messages()
            .iter()
            .filter_map(|m| {
                Some(ReceivedMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    receipt_handle: m.receipt_handle()?.to_string(),
                    body: m.body()?.to_string(),
                })
            })
            .collect())
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), FanoutError> {
        self.sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| transport("Failed to delete message", e))?;
        Ok(())
    }
}
