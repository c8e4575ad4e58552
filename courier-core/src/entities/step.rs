use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    InApp,
    Email,
    Sms,
    Chat,
    Push,
    Digest,
    Delay,
    Trigger,
}

impl StepType {
    /// Delivery channel for channel steps, `None` for action steps.
    pub fn channel(&self) -> Option<ChannelType> {
        match self {
            Self::InApp => Some(ChannelType::InApp),
            Self::Email => Some(ChannelType::Email),
            Self::Sms => Some(ChannelType::Sms),
            Self::Chat => Some(ChannelType::Chat),
            Self::Push => Some(ChannelType::Push),
            Self::Digest | Self::Delay | Self::Trigger => None,
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self, Self::Digest)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Chat => "chat",
            Self::Push => "push",
            Self::Digest => "digest",
            Self::Delay => "delay",
            Self::Trigger => "trigger",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delivery channel a provider integration is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    InApp,
    Email,
    Sms,
    Chat,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    pub fn duration(&self, amount: u64) -> Duration {
        let secs = match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 60 * 60,
            Self::Days => 60 * 60 * 24,
            Self::Weeks => 60 * 60 * 24 * 7,
        };
        Duration::from_secs(amount.saturating_mul(secs))
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seconds" => Ok(Self::Seconds),
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            "weeks" => Ok(Self::Weeks),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}

/// Digest window settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestMetadata {
    pub amount: u64,
    pub unit: TimeUnit,
    /// Payload field that splits one subscriber's digest into separate windows
    pub digest_key: Option<String>,
}

impl DigestMetadata {
    pub fn new(amount: u64, unit: TimeUnit) -> Self {
        Self {
            amount,
            unit,
            digest_key: None,
        }
    }

    pub fn with_digest_key(mut self, key: impl Into<String>) -> Self {
        self.digest_key = Some(key.into());
        self
    }

    pub fn window(&self) -> Duration {
        self.unit.duration(self.amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepMetadata {
    Digest(DigestMetadata),
    Delay { amount: u64, unit: TimeUnit },
}

impl StepMetadata {
    /// How long a job for this step waits in the queue before running.
    pub fn delay(&self) -> Duration {
        match self {
            Self::Digest(digest) => digest.window(),
            Self::Delay { amount, unit } => unit.duration(*amount),
        }
    }
}

/// Where a filter condition reads its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    Payload,
    Subscriber,
    /// Evaluated by calling a customer webhook; may be unavailable and retried
    Webhook,
    IsOnline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub on: FilterSource,
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepFilter {
    pub is_negated: bool,
    pub children: Vec<FilterCondition>,
}

impl StepFilter {
    pub fn new(children: Vec<FilterCondition>) -> Self {
        Self {
            is_negated: false,
            children,
        }
    }

    pub fn is_webhook_gated(&self) -> bool {
        self.children.iter().any(|c| c.on == FilterSource::Webhook)
    }
}

/// Reference to the message template a step renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplateRef {
    pub id: String,
    pub step_type: StepType,
}

/// One step of a workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub name: Option<String>,
    pub step_type: StepType,
    pub active: bool,
    pub should_stop_on_fail: bool,
    pub template: Option<MessageTemplateRef>,
    pub filters: Vec<StepFilter>,
    pub metadata: Option<StepMetadata>,
}

impl StepDefinition {
    /// An active step with a template of the same type attached
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            template: Some(MessageTemplateRef {
                id: format!("tpl-{id}"),
                step_type,
            }),
            id,
            name: None,
            step_type,
            active: true,
            should_stop_on_fail: false,
            filters: Vec::new(),
            metadata: None,
        }
    }

    pub fn digest(id: impl Into<String>, metadata: DigestMetadata) -> Self {
        Self::new(id, StepType::Digest).with_metadata(StepMetadata::Digest(metadata))
    }

    pub fn delay(id: impl Into<String>, amount: u64, unit: TimeUnit) -> Self {
        Self::new(id, StepType::Delay).with_metadata(StepMetadata::Delay { amount, unit })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn stop_on_fail(mut self) -> Self {
        self.should_stop_on_fail = true;
        self
    }

    pub fn without_template(mut self) -> Self {
        self.template = None;
        self
    }

    pub fn with_filter(mut self, filter: StepFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_metadata(mut self, metadata: StepMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn digest_metadata(&self) -> Option<&DigestMetadata> {
        match &self.metadata {
            Some(StepMetadata::Digest(digest)) => Some(digest),
            _ => None,
        }
    }

    /// Whether failures of this step should be retried with the webhook backoff
    pub fn has_webhook_filter(&self) -> bool {
        self.filters.iter().any(StepFilter::is_webhook_gated)
    }

    /// Queue delay for jobs of this step (digest window or explicit delay)
    pub fn queue_delay(&self) -> Option<Duration> {
        match self.step_type {
            StepType::Digest | StepType::Delay => self.metadata.as_ref().map(StepMetadata::delay),
            _ => None,
        }
    }
}
