use chrono::Utc;
use serde_json::json;

use courier_core::entities::{DigestMetadata, TimeUnit};
use courier_core::prelude::*;
use courier_core::repository::MemoryJobRepository;

fn notification() -> NotificationEntity {
    NotificationEntity {
        id: NotificationId::new(),
        environment_id: EnvironmentId::from("env"),
        organization_id: OrganizationId::from("org"),
        subscriber_id: SubscriberId::from("sub"),
        template_id: TemplateId::from("tpl"),
        transaction_id: TransactionId::new(),
        channels: vec![StepType::Email],
        payload: json!({ "project": "apollo" }),
        created_at: Utc::now(),
    }
}

fn chain(notification: &NotificationEntity, steps: Vec<StepDefinition>) -> Vec<JobEntity> {
    let mut jobs: Vec<JobEntity> = steps.into_iter().map(|s| JobEntity::for_step(notification, s)).collect();
    for i in 1..jobs.len() {
        jobs[i].parent_id = Some(jobs[i - 1].id.clone());
    }
    jobs
}

/// R1. Missing jobs are reported as not found, not as validation failures
#[tokio::test]
async fn missing_job_is_not_found() {
    let repo = MemoryJobRepository::new();

    let err = repo
        .find_by_id(&EnvironmentId::from("env"), &JobId::from("nope"))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(CourierError::from(err).kind(), ErrorKind::NotFound);
}

/// R2. Jobs are scoped to their environment
#[tokio::test]
async fn jobs_are_environment_scoped() {
    let repo = MemoryJobRepository::new();
    let n = notification();
    let jobs = repo.store_jobs(chain(&n, vec![StepDefinition::new("a", StepType::Email)])).await.unwrap();

    let other_env = EnvironmentId::from("other");
    assert!(repo.find_by_id(&other_env, &jobs[0].id).await.is_err());
    assert!(repo.update_status(&other_env, &jobs[0].id, JobStatus::Running).await.is_err());
    assert!(repo.find_by_id(&n.environment_id, &jobs[0].id).await.is_ok());
}

/// R3. Storing the same job twice is a validation error
#[tokio::test]
async fn duplicate_jobs_are_rejected() {
    let repo = MemoryJobRepository::new();
    let n = notification();
    let jobs = chain(&n, vec![StepDefinition::new("a", StepType::Sms)]);

    repo.store_jobs(jobs.clone()).await.unwrap();
    let err = repo.store_jobs(jobs).await.unwrap_err();

    assert!(matches!(err, RepositoryError::Validation { .. }));
}

/// R4. find_next follows the parent link and skips finished children
#[tokio::test]
async fn find_next_follows_parent_link() {
    let repo = MemoryJobRepository::new();
    let n = notification();
    let jobs = repo
        .store_jobs(chain(
            &n,
            vec![
                StepDefinition::new("a", StepType::InApp),
                StepDefinition::new("b", StepType::Email),
            ],
        ))
        .await
        .unwrap();

    let next = repo.find_next(&n.environment_id, &jobs[0].id).await.unwrap().unwrap();
    assert_eq!(next.id, jobs[1].id);

    repo.update_status(&n.environment_id, &jobs[1].id, JobStatus::Completed).await.unwrap();
    assert!(repo.find_next(&n.environment_id, &jobs[0].id).await.unwrap().is_none());
    assert!(repo.find_next(&n.environment_id, &jobs[1].id).await.unwrap().is_none());
}

/// R5. record_failure stores the error and counts the attempt
#[tokio::test]
async fn record_failure_counts_attempts() {
    let repo = MemoryJobRepository::new();
    let n = notification();
    let jobs = repo.store_jobs(chain(&n, vec![StepDefinition::new("a", StepType::Chat)])).await.unwrap();

    repo.record_failure(&n.environment_id, &jobs[0].id, "provider timeout").await.unwrap();
    repo.record_failure(&n.environment_id, &jobs[0].id, "provider timeout again").await.unwrap();

    let job = repo.find_by_id(&n.environment_id, &jobs[0].id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error.as_deref(), Some("provider timeout again"));
}

/// R6. Pending digests are matched by subscriber, template and digest key
#[tokio::test]
async fn pending_digest_lookup_uses_digest_key() {
    let repo = MemoryJobRepository::new();
    let n = notification();
    let digest = StepDefinition::digest("d", DigestMetadata::new(10, TimeUnit::Minutes).with_digest_key("project"));
    repo.store_jobs(chain(&n, vec![digest])).await.unwrap();

    let found = repo
        .find_pending_digest(&n.environment_id, &n.subscriber_id, &n.template_id, Some("apollo"))
        .await
        .unwrap();
    assert!(found.is_some());

    let other_key = repo
        .find_pending_digest(&n.environment_id, &n.subscriber_id, &n.template_id, Some("gemini"))
        .await
        .unwrap();
    assert!(other_key.is_none());
}
