use crate::broker::Broker;
use crate::dispatch::BatchDispatcher;
use crate::driver::ScheduleDriver;
use crate::generator::CommentGenerator;
use crate::llm::LlmClient;
use crate::maintenance::Maintenance;
use crate::post_worker::PostWorker;
use crate::repository::ScheduleRepository;
use crate::schedule_worker::ScheduleWorker;
use crate::selector::AccountSelector;
use crate::sleep::SleepController;
use crate::upstream::PlatformClient;
use crate::views::{HttpViewerService, LogOnlyViewerService, ViewScheduler, ViewWorker, ViewerService};
use chrono_tz::Tz;
use common::model::message::TopicType;
use common::State;
use errors::Result;
use log::{error, info, warn};
use queue::testing::MemoryJobQueue;
use queue::{JobQueue, QueueManager, RedisJobQueue, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Wires the whole posting engine together and owns its lifecycle. No
/// work starts before `start` and everything winds down in `shutdown`;
/// construction has no side effects.
pub struct Engine {
    pub state: Arc<State>,
    pub queue_manager: Arc<QueueManager>,
    driver: Arc<ScheduleDriver>,
    view_scheduler: Arc<ViewScheduler>,
    schedule_worker: Arc<ScheduleWorker>,
    post_worker: Arc<PostWorker>,
    view_worker: Arc<ViewWorker>,
    maintenance: Arc<Maintenance>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub async fn new(state: Arc<State>) -> Result<Arc<Self>> {
        let config = state.config.read().await.clone();

        let quota_tz: Tz = match config.quota.reset_timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(
                    "Unknown quota timezone {:?}, falling back to UTC",
                    config.quota.reset_timezone
                );
                chrono_tz::UTC
            }
        };

        let backend: Arc<dyn JobQueue> = match &state.queue_pool {
            Some(pool) => {
                let settings = queue::redis::QueueSettings {
                    lease: Duration::from_secs(config.workers.lease_secs),
                    ..Default::default()
                };
                RedisJobQueue::new(pool.clone(), &config.name, settings)
            }
            None => {
                warn!("No Redis configured; using the in-memory job queue");
                MemoryJobQueue::new()
            }
        };
        let queue_manager = Arc::new(QueueManager::new(backend.clone()));

        let repo = Arc::new(ScheduleRepository::new(state.db.clone()));
        let platform = Arc::new(PlatformClient::new(config.upstream.clone()));
        let broker = Arc::new(Broker::new(
            repo.clone(),
            platform.clone(),
            config.upstream.clone(),
        )?);

        let llm = match &config.llm {
            Some(llm_config) => Some(Arc::new(LlmClient::new(llm_config.clone())?)),
            None => None,
        };
        let generator = Arc::new(CommentGenerator::new(
            repo.clone(),
            platform.clone(),
            llm,
            broker.direct_client(),
        ));

        let selector = Arc::new(AccountSelector::new(repo.clone(), state.cache.clone()));
        let sleep = Arc::new(SleepController::new(repo.clone()));
        let driver = Arc::new(ScheduleDriver::new(
            repo.clone(),
            queue_manager.clone(),
            state.cache.clone(),
        ));
        let dispatcher = Arc::new(BatchDispatcher::new(
            repo.clone(),
            queue_manager.clone(),
            state.cache.clone(),
            selector.clone(),
            generator,
        ));

        let schedule_worker = Arc::new(ScheduleWorker::new(
            repo.clone(),
            driver.clone(),
            sleep,
            dispatcher,
            state.cache.clone(),
            state.locker.clone(),
        ));
        let post_worker = Arc::new(PostWorker::new(
            repo.clone(),
            broker.clone(),
            state.cache.clone(),
            quota_tz,
        ));

        let viewer: Arc<dyn ViewerService> = match &config.viewer {
            Some(viewer_config) => Arc::new(HttpViewerService::new(viewer_config)?),
            None => Arc::new(LogOnlyViewerService),
        };
        let view_scheduler = Arc::new(ViewScheduler::new(
            repo.clone(),
            queue_manager.clone(),
            state.cache.clone(),
        ));
        let view_worker = Arc::new(ViewWorker::new(repo.clone(), broker, viewer));

        let (shutdown_tx, _) = broadcast::channel(4);
        let maintenance = Maintenance::new(
            repo,
            queue_manager.clone(),
            driver.clone(),
            selector,
            quota_tz,
        );

        Ok(Arc::new(Self {
            state,
            queue_manager,
            driver,
            view_scheduler,
            schedule_worker,
            post_worker,
            view_worker,
            maintenance,
            shutdown_tx,
        }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.state.config.read().await.clone();
        info!("Starting posting engine ({})", config.name);

        let backend = self.queue_manager.backend();
        let lease = Duration::from_secs(config.workers.lease_secs);

        // schedule-processing worker
        {
            let rx = self
                .queue_manager
                .subscribe(TopicType::ScheduleProcessing, 1024)
                .await?;
            let worker = Worker::new(
                "schedule-processing",
                config.workers.schedule_concurrency,
                lease,
                backend.clone(),
                self.shutdown_tx.subscribe(),
            );
            let handler = self.schedule_worker.clone();
            tokio::spawn(worker.run(rx, move |job: common::model::message::ProcessScheduleJob| {
                let handler = handler.clone();
                async move { handler.handle(job).await }
            }));
        }

        // post-comment worker, globally rate limited
        {
            let rx = self
                .queue_manager
                .subscribe(TopicType::PostComment, 4096)
                .await?;
            let worker = Worker::new(
                "post-comment",
                config.workers.post_concurrency,
                lease,
                backend.clone(),
                self.shutdown_tx.subscribe(),
            )
            .with_rate_per_sec(config.workers.post_rate_per_sec);
            let handler = self.post_worker.clone();
            tokio::spawn(worker.run(rx, move |job: common::model::message::PostCommentJob| {
                let handler = handler.clone();
                async move { handler.handle(job).await }
            }));
        }

        // simulate-view worker
        {
            let rx = self
                .queue_manager
                .subscribe(TopicType::SimulateView, 1024)
                .await?;
            let worker = Worker::new(
                "simulate-view",
                config.workers.view_concurrency,
                lease,
                backend.clone(),
                self.shutdown_tx.subscribe(),
            );
            let handler = self.view_worker.clone();
            tokio::spawn(worker.run(rx, move |job: common::model::message::SimulateViewJob| {
                let handler = handler.clone();
                async move { handler.handle(job).await }
            }));
        }

        self.maintenance.spawn_all(&self.shutdown_tx);

        // Restart resume: re-materialise every active plan from persisted
        // state before accepting new work.
        if let Err(e) = self.driver.resume_active().await {
            error!("Schedule resume failed: {}", e);
        }
        if let Err(e) = self.view_scheduler.resume_active().await {
            error!("View schedule resume failed: {}", e);
        }

        info!("Engine started");
        Ok(())
    }

    /// Re-materialise (or drop) jobs after an external mutation; the HTTP
    /// API layer calls this after every schedule write.
    pub async fn refresh_schedule(self: &Arc<Self>, schedule_id: i64) -> Result<()> {
        self.driver.drop_schedule_jobs(schedule_id).await?;
        self.driver.setup_schedule_job(schedule_id).await
    }

    pub fn driver(&self) -> Arc<ScheduleDriver> {
        self.driver.clone()
    }

    pub fn view_scheduler(&self) -> Arc<ViewScheduler> {
        self.view_scheduler.clone()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        let _ = self.shutdown_tx.send(());
        self.driver.stop();
        self.view_scheduler.stop();

        let grace = {
            let config = self.state.config.read().await;
            Duration::from_secs(config.workers.shutdown_grace_secs)
        };
        // Workers drain their in-flight handlers; anything slower than the
        // grace period is recovered later by the stalled-job claimer.
        tokio::time::sleep(grace.min(Duration::from_secs(60))).await;
        info!("Engine shutdown complete");
    }
}
