pub mod execution_detail;
pub mod job;
pub mod notification;
pub mod step;

pub use execution_detail::{ExecutionDetail, ExecutionDetailSource, ExecutionDetailStatus};
pub use job::{JobEntity, JobStatus};
pub use notification::{NotificationEntity, Subscriber, WorkflowTemplate};
pub use step::{
    ChannelType, DigestMetadata, FilterCondition, FilterSource, MessageTemplateRef, StepDefinition, StepFilter,
    StepMetadata, StepType, TimeUnit,
};
