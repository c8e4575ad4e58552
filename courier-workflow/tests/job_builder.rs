//! Job builder behaviour with the in-memory repositories.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use courier_core::prelude::*;
use courier_workflow::prelude::*;

/// Replaces the digest tail with a single renamed digest step and remembers
/// what it was given.
#[derive(Default)]
struct CollapsingFilter {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl DigestFilter for CollapsingFilter {
    async fn filter(&self, _notification: &NotificationEntity, steps: Vec<StepDefinition>) -> CourierResult<Vec<StepDefinition>> {
        *self.seen.lock() = steps.iter().map(|step| step.id.clone()).collect();
        let mut merged = steps[0].clone();
        merged.id = format!("{}-merged", merged.id);
        Ok(vec![merged])
    }
}

fn fixture() -> (EnvironmentId, OrganizationId, Subscriber) {
    let env = EnvironmentId::new();
    let org = OrganizationId::new();
    let subscriber = Subscriber::new("subscriber-1", env.clone(), org.clone());
    (env, org, subscriber)
}

fn digest_step(id: &str) -> StepDefinition {
    StepDefinition::digest(id, DigestMetadata::new(10, TimeUnit::Minutes).with_digest_key("thread"))
}

/// B1. Inactive steps are skipped and the digest filter output replaces the digest tail
#[tokio::test]
async fn inactive_steps_are_skipped_and_digest_output_is_kept_in_order() {
    // Arrange
    let (env, org, subscriber) = fixture();
    let repositories = Repositories::in_memory();
    let filter = Arc::new(CollapsingFilter::default());
    let builder = NotificationJobBuilder::new(repositories.notifications.clone(), filter.clone());
    let template = WorkflowTemplate::new(
        "Comments",
        "comment-added",
        vec![
            StepDefinition::new("A", StepType::InApp),
            StepDefinition::new("B", StepType::Sms).inactive(),
            digest_step("C"),
        ],
    );
    let request = TriggerRequest::new(env, org, json!({"thread": "t-1"}));

    // Act
    let (notification, jobs) = builder
        .build(&request, &template, &subscriber, &HashMap::new())
        .await
        .unwrap();

    // Assert
    let ids: Vec<&str> = jobs.iter().map(|job| job.step.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "C-merged"]);
    assert_eq!(*filter.seen.lock(), vec!["C".to_string()]);
    assert_eq!(jobs[0].parent_id, None);
    assert_eq!(jobs[1].parent_id.as_ref(), Some(&jobs[0].id));
    assert!(jobs.iter().all(|job| job.notification_id == notification.id));
    assert!(jobs.iter().all(|job| job.transaction_id == request.transaction_id));
}

/// B2. A second trigger merges into the pending digest window
#[tokio::test]
async fn second_trigger_merges_into_pending_digest() {
    // Arrange
    let (env, org, subscriber) = fixture();
    let repositories = Repositories::in_memory();
    let filter = Arc::new(MergingDigestFilter::new(repositories.jobs.clone()));
    let builder = NotificationJobBuilder::new(repositories.notifications.clone(), filter);
    let template = WorkflowTemplate::new(
        "Comments",
        "comment-added",
        vec![
            StepDefinition::new("in-app", StepType::InApp),
            digest_step("digest"),
            StepDefinition::new("email", StepType::Email),
        ],
    );
    let request = TriggerRequest::new(env, org, json!({"thread": "t-1"}));

    let (_, first) = builder
        .build(&request, &template, &subscriber, &HashMap::new())
        .await
        .unwrap();
    repositories.jobs.store_jobs(first.clone()).await.unwrap();

    // Act
    let (_, second) = builder
        .build(&request, &template, &subscriber, &HashMap::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(first.len(), 3);
    let ids: Vec<&str> = second.iter().map(|job| job.step.id.as_str()).collect();
    assert_eq!(ids, vec!["in-app"]);
}

/// B3. A different digest key opens its own window
#[tokio::test]
async fn different_digest_key_opens_new_window() {
    // Arrange
    let (env, org, subscriber) = fixture();
    let repositories = Repositories::in_memory();
    let filter = Arc::new(MergingDigestFilter::new(repositories.jobs.clone()));
    let builder = NotificationJobBuilder::new(repositories.notifications.clone(), filter);
    let template = WorkflowTemplate::new(
        "Comments",
        "comment-added",
        vec![digest_step("digest"), StepDefinition::new("email", StepType::Email)],
    );

    let first_request = TriggerRequest::new(env.clone(), org.clone(), json!({"thread": "t-1"}));
    let (_, first) = builder
        .build(&first_request, &template, &subscriber, &HashMap::new())
        .await
        .unwrap();
    repositories.jobs.store_jobs(first).await.unwrap();

    // Act
    let other_request = TriggerRequest::new(env, org, json!({"thread": "t-2"}));
    let (_, other) = builder
        .build(&other_request, &template, &subscriber, &HashMap::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(other.len(), 2);
}

/// B4. Only the first digest step is handed to the filter
#[tokio::test]
async fn only_first_digest_step_is_filtered() {
    // Arrange
    let (env, org, subscriber) = fixture();
    let repositories = Repositories::in_memory();
    let filter = Arc::new(CollapsingFilter::default());
    let builder = NotificationJobBuilder::new(repositories.notifications.clone(), filter.clone());
    let template = WorkflowTemplate::new(
        "Two digests",
        "two-digests",
        vec![
            StepDefinition::new("A", StepType::Email),
            digest_step("D1"),
            digest_step("D2"),
        ],
    );
    let request = TriggerRequest::new(env, org, json!({}));

    // Act
    let (_, jobs) = builder
        .build(&request, &template, &subscriber, &HashMap::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(*filter.seen.lock(), vec!["D1".to_string(), "D2".to_string()]);
    let ids: Vec<&str> = jobs.iter().map(|job| job.step.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "D1-merged"]);
}
