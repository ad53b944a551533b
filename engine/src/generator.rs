use crate::llm::LlmClient;
use crate::repository::ScheduleRepository;
use crate::upstream::PlatformClient;
use common::model::entity::{ScheduleModel, TargetVideo};
use errors::{Result, ScheduleError};
use log::{info, warn};
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Used when both the LLM path and the template pool come up empty.
const FALLBACK_COMMENT: &str = "Great video, really enjoyed it!";

/// Comment-text source: a uniform template pick, or a one-shot LLM
/// synthesis from the video title with the templates as fallback.
pub struct CommentGenerator {
    repo: Arc<ScheduleRepository>,
    platform: Arc<PlatformClient>,
    llm: Option<Arc<LlmClient>>,
    direct: reqwest::Client,
}

/// Pure template pick, factored for tests.
pub fn pick_template<R: rand::Rng>(templates: &[String], rng: &mut R) -> Option<String> {
    templates.choose(rng).cloned()
}

impl CommentGenerator {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        platform: Arc<PlatformClient>,
        llm: Option<Arc<LlmClient>>,
        direct: reqwest::Client,
    ) -> Self {
        Self {
            repo,
            platform,
            llm,
            direct,
        }
    }

    pub async fn generate(
        &self,
        schedule: &ScheduleModel,
        video: &TargetVideo,
        metadata_api_key: Option<&str>,
    ) -> Result<String> {
        let templates = schedule.templates();

        if !schedule.use_ai {
            return pick_template(&templates, &mut rand::thread_rng())
                .ok_or_else(|| ScheduleError::NoTemplates.into());
        }

        match self.generate_with_ai(schedule, video, metadata_api_key).await {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(
                    "AI generation failed for schedule {}: {}; falling back",
                    schedule.id, e
                );
                Ok(pick_template(&templates, &mut rand::thread_rng())
                    .unwrap_or_else(|| FALLBACK_COMMENT.to_string()))
            }
        }
    }

    async fn generate_with_ai(
        &self,
        schedule: &ScheduleModel,
        video: &TargetVideo,
        metadata_api_key: Option<&str>,
    ) -> Result<String> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| errors::GeneratorError::LlmFailed("llm not configured".into()))?;

        let title = match &video.title {
            Some(title) if !title.is_empty() => title.clone(),
            _ => {
                let key = metadata_api_key
                    .ok_or_else(|| errors::GeneratorError::MetadataFailed("no api key".into()))?;
                self.platform
                    .video_title(&self.direct, key, &video.video_id)
                    .await?
            }
        };

        let prompt = format!(
            "Write one short, enthusiastic comment for a video titled \"{}\". \
             Reply with the comment text only.",
            title
        );
        let text = llm.complete(&prompt).await?;

        // Grow the pool so repeated runs have curated material even when
        // the LLM is down.
        if let Err(e) = self.repo.append_comment_template(schedule.id, &text).await {
            warn!("Could not persist generated template: {}", e);
        } else {
            info!("Schedule {} learned a new template", schedule.id);
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn pick_template_is_uniform_over_pool() {
        let templates: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(pick_template(&templates, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn pick_template_empty_pool_is_none() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(pick_template(&[], &mut rng), None);
    }
}
