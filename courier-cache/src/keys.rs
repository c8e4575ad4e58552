//! Cache key layout.
//!
//! Entity keys: `entity:<prefix>:e=<environment>:<id parts>`.
//! Query scopes: `query:<prefix>:e=<environment>:<id parts>`, whose members
//! live at `<scope>#query#<discriminator>`.

use courier_core::ids::{EnvironmentId, JobId, NotificationId, SubscriberId, TemplateId};

/// Separates a query scope from the discriminator of one cached query
pub const QUERY_SEPARATOR: &str = "#query#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyType {
    Entity,
    Query,
}

impl CacheKeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Query => "query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyPrefix {
    Subscriber,
    Feed,
    MessageCount,
    Notification,
    Job,
    WorkflowTemplate,
}

impl CacheKeyPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscriber => "subscriber",
            Self::Feed => "feed",
            Self::MessageCount => "message_count",
            Self::Notification => "notification",
            Self::Job => "job",
            Self::WorkflowTemplate => "workflow_template",
        }
    }
}

fn build_key(key_type: CacheKeyType, prefix: CacheKeyPrefix, environment_id: &EnvironmentId, parts: &[(&str, &str)]) -> String {
    let mut key = format!("{}:{}:e={}", key_type.as_str(), prefix.as_str(), environment_id);
    for (name, value) in parts {
        key.push(':');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

pub fn subscriber_key(environment_id: &EnvironmentId, subscriber_id: &SubscriberId) -> String {
    build_key(
        CacheKeyType::Entity,
        CacheKeyPrefix::Subscriber,
        environment_id,
        &[("s", subscriber_id.as_str())],
    )
}

pub fn notification_key(environment_id: &EnvironmentId, notification_id: &NotificationId) -> String {
    build_key(
        CacheKeyType::Entity,
        CacheKeyPrefix::Notification,
        environment_id,
        &[("n", notification_id.as_str())],
    )
}

pub fn job_key(environment_id: &EnvironmentId, job_id: &JobId) -> String {
    build_key(CacheKeyType::Entity, CacheKeyPrefix::Job, environment_id, &[("j", job_id.as_str())])
}

pub fn workflow_template_key(environment_id: &EnvironmentId, template_id: &TemplateId) -> String {
    build_key(
        CacheKeyType::Entity,
        CacheKeyPrefix::WorkflowTemplate,
        environment_id,
        &[("t", template_id.as_str())],
    )
}

/// Query scope holding every cached feed page of one subscriber
pub fn feed_scope(environment_id: &EnvironmentId, subscriber_id: &SubscriberId) -> String {
    build_key(
        CacheKeyType::Query,
        CacheKeyPrefix::Feed,
        environment_id,
        &[("s", subscriber_id.as_str())],
    )
}

/// Query scope holding cached unseen/unread counters of one subscriber
pub fn message_count_scope(environment_id: &EnvironmentId, subscriber_id: &SubscriberId) -> String {
    build_key(
        CacheKeyType::Query,
        CacheKeyPrefix::MessageCount,
        environment_id,
        &[("s", subscriber_id.as_str())],
    )
}

/// Every entity key of one kind inside an environment
pub fn entity_pattern(prefix: CacheKeyPrefix, environment_id: &EnvironmentId) -> String {
    format!("{}:{}:e={}:*", CacheKeyType::Entity.as_str(), prefix.as_str(), environment_id)
}

pub fn query_key(scope: &str, discriminator: &str) -> String {
    format!("{scope}{QUERY_SEPARATOR}{discriminator}")
}

/// Split a query key into `(scope, discriminator)`.
pub fn split_query_key(key: &str) -> Option<(&str, &str)> {
    let (scope, discriminator) = key.split_once(QUERY_SEPARATOR)?;
    (!scope.is_empty() && !discriminator.is_empty()).then_some((scope, discriminator))
}
