use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue topics. One stream per topic, namespaced by the configured name so
/// several deployments can share one Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicType {
    ScheduleProcessing,
    PostComment,
    SimulateView,
}

impl TopicType {
    /// Bare topic name; the queue backend prefixes the configured namespace
    /// when it builds Redis keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicType::ScheduleProcessing => "schedule-processing",
            TopicType::PostComment => "post-comment",
            TopicType::SimulateView => "simulate-view",
        }
    }
}

/// One tick of a schedule: run the sleep check, select accounts, create the
/// comment rows and fan out `PostCommentJob`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessScheduleJob {
    pub schedule_id: i64,
    #[serde(default = "default_run_id")]
    pub run_id: Uuid,
}

impl ProcessScheduleJob {
    pub fn new(schedule_id: i64) -> Self {
        Self {
            schedule_id,
            run_id: Uuid::new_v4(),
        }
    }
}

/// One comment-post attempt against the upstream API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCommentJob {
    pub comment_id: i64,
    pub schedule_id: i64,
    #[serde(default = "default_run_id")]
    pub run_id: Uuid,
}

impl PostCommentJob {
    pub fn new(comment_id: i64, schedule_id: i64) -> Self {
        Self {
            comment_id,
            schedule_id,
            run_id: Uuid::new_v4(),
        }
    }

    /// Queue dedup key; guarantees at most one enqueued job per comment row.
    pub fn job_id(&self) -> String {
        format!("post-comment-{}", self.comment_id)
    }
}

/// One probabilistic watch-session request for the viewer service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateViewJob {
    pub view_schedule_id: i64,
    pub video_id: String,
    #[serde(default = "default_run_id")]
    pub run_id: Uuid,
}

impl SimulateViewJob {
    pub fn new(view_schedule_id: i64, video_id: String) -> Self {
        Self {
            view_schedule_id,
            video_id,
            run_id: Uuid::new_v4(),
        }
    }
}

fn default_run_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_queue_contract() {
        assert_eq!(TopicType::ScheduleProcessing.as_str(), "schedule-processing");
        assert_eq!(TopicType::PostComment.as_str(), "post-comment");
        assert_eq!(TopicType::SimulateView.as_str(), "simulate-view");
    }

    #[test]
    fn post_job_id_is_stable_per_comment() {
        let a = PostCommentJob::new(42, 7);
        let b = PostCommentJob::new(42, 7);
        assert_eq!(a.job_id(), b.job_id());
    }
}
