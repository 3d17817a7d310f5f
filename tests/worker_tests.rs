
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use infer_queue::error::WorkerError;
use infer_queue::scheduler::JobStatus;
use infer_queue::worker::{
    ChatBackend, ResourceSampler, WorkerControl, WorkerCore, WorkerEvent, WorkerState,
};
use test_harness::{
    assert_eventually, assistant_reply, job_payload, network_error, test_worker_config,
    FnBackend, RecordingObserver, ScriptedQueue, ScriptedSampler,
};

const WAIT: Duration = Duration::from_secs(120);

struct Running {
    core: Arc<WorkerCore>,
    control: WorkerControl,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.control.shutdown();
        tokio::time::timeout(Duration::from_secs(60), self.handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}

fn spawn_core(core: WorkerCore) -> Running {
    let core = Arc::new(core);
    let control = core.control();
    let runner = Arc::clone(&core);
    let handle = tokio::spawn(async move { runner.run().await });
    Running {
        core,
        control,
        handle,
    }
}

fn core_with(
    queue: Arc<ScriptedQueue>,
    backend: Arc<dyn ChatBackend>,
    sampler: Arc<dyn ResourceSampler>,
    gpu_check: bool,
) -> WorkerCore {
    WorkerCore::with_parts(
        test_worker_config().with_gpu_check(gpu_check),
        queue,
        backend,
        sampler,
    )
}

#[tokio::test(start_paused = true)]
async fn test_busy_gpu_skips_fetch_and_resamples_after_poll_interval() {
    let queue = ScriptedQueue::new();
    let sampler = ScriptedSampler::new(vec![Some(95.0)], None);
    let observer = RecordingObserver::new();
    let core = core_with(queue.clone(), FnBackend::replying("hi"), sampler.clone(), true)
        .with_observer(observer.clone());

    let running = spawn_core(core);
    assert_eventually(
        || async { queue.fetch_count() >= 1 },
        WAIT,
        "worker should fetch once the GPU is free",
    )
    .await;
    running.stop().await;

    let samples = sampler.sample_times();
    let fetches = queue.fetch_times();
    assert!(samples.len() >= 2);
    assert_eq!(samples[1] - samples[0], Duration::from_secs(2));
    // No fetch happened during the busy cycle
    assert!(fetches[0] >= samples[1]);
    assert!(observer.states().contains(&WorkerState::GpuBusy));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_gpu_utilization_admits() {
    let queue = ScriptedQueue::new();
    let sampler = ScriptedSampler::fixed(None);
    let core = core_with(queue.clone(), FnBackend::replying("hi"), sampler.clone(), true);

    let running = spawn_core(core);
    assert_eventually(|| async { queue.fetch_count() >= 1 }, WAIT, "fetch expected").await;
    running.stop().await;

    assert_eq!(sampler.sample_times()[0], queue.fetch_times()[0]);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_retries_with_exponential_backoff() {
    let queue = ScriptedQueue::with_fetches(vec![
        Err(network_error()),
        Err(network_error()),
        Ok(Some(job_payload("job-1", "hello"))),
    ]);
    let observer = RecordingObserver::new();
    let core = core_with(
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
        false,
    )
    .with_observer(observer.clone());

    let running = spawn_core(core);
    assert_eventually(
        || async { queue.report_count() >= 1 },
        WAIT,
        "job should be reported after retries",
    )
    .await;
    running.stop().await;

    let fetches = queue.fetch_times();
    assert!(fetches.len() >= 3);
    assert_eq!(fetches[1] - fetches[0], Duration::from_secs(1));
    assert_eq!(fetches[2] - fetches[1], Duration::from_secs(2));
    assert!(observer.states().contains(&WorkerState::Retrying));

    let reports = queue.report_attempts();
    assert_eq!(reports[0].1.job_id, "job-1");
    assert_eq!(reports[0].1.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped_at_max() {
    let queue = ScriptedQueue::with_fetches((0..5).map(|_| Err(network_error())).collect());
    let core = WorkerCore::with_parts(
        test_worker_config().with_max_backoff(Duration::from_secs(3)),
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
    );

    let running = spawn_core(core);
    assert_eventually(|| async { queue.fetch_count() >= 5 }, WAIT, "five fetches").await;
    running.stop().await;

    let fetches = queue.fetch_times();
    let gaps: Vec<Duration> = fetches.windows(2).take(4).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(3)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_successful_job_is_reported_completed() {
    let queue = ScriptedQueue::with_fetches(vec![Ok(Some(job_payload("job-1", "Fun fact?")))]);
    let backend = FnBackend::new(|messages: &[Value]| {
        assert_eq!(messages[0]["content"], "Fun fact?");
        Ok(assistant_reply("Honey never spoils."))
    });
    let observer = RecordingObserver::new();
    let core = core_with(queue.clone(), backend.clone(), ScriptedSampler::fixed(None), false)
        .with_observer(observer.clone());

    let running = spawn_core(core);
    assert_eventually(|| async { queue.report_count() >= 1 }, WAIT, "report expected").await;
    let stats = running.core.stats();
    running.stop().await;

    let report = &queue.report_attempts()[0].1;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        report.result.as_ref().unwrap()["message"]["content"],
        "Honey never spoils."
    );
    assert!(report.error.is_none());
    assert_eq!(backend.calls(), 1);

    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(stats.jobs_failed, 0);
    assert!(stats.current_job_id.is_none());

    let events = observer.events();
    assert!(events.contains(&WorkerEvent::JobStarted("job-1".to_string())));
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkerEvent::JobCompleted { job_id, .. } if job_id == "job-1")));
    assert!(observer.states().contains(&WorkerState::Working));
}

async fn failure_message_for(job: Value, backend: Arc<FnBackend>) -> String {
    let queue = ScriptedQueue::with_fetches(vec![Ok(Some(job))]);
    let observer = RecordingObserver::new();
    let core = core_with(queue.clone(), backend, ScriptedSampler::fixed(None), false)
        .with_observer(observer.clone());

    let running = spawn_core(core);
    assert_eventually(|| async { queue.report_count() >= 1 }, WAIT, "report expected").await;
    let stats = running.core.stats();
    running.stop().await;

    assert_eq!(stats.jobs_failed, 1);
    assert_eq!(stats.jobs_completed, 0);

    let report = queue.report_attempts()[0].1.clone();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.result.is_none());
    let message = report.error.expect("failure carries a message");
    assert!(observer.events().contains(&WorkerEvent::JobFailed {
        job_id: report.job_id.clone(),
        message: message.clone(),
    }));
    message
}

#[tokio::test(start_paused = true)]
async fn test_backend_http_error_fails_job() {
    let backend = FnBackend::new(|_: &[Value]| {
        Err(WorkerError::Http {
            status: "404 Not Found".to_string(),
            url: "http://backend.invalid/api/chat".to_string(),
        })
    });
    let message = failure_message_for(job_payload("job-404", "hi"), backend.clone()).await;
    assert_eq!(message, "HTTP 404 Not Found from http://backend.invalid/api/chat");
    // Backend failures are not retried
    assert_eq!(backend.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_backend_response_fails_job() {
    let backend = FnBackend::new(|_: &[Value]| {
        Err(WorkerError::MalformedPayload("response missing `message`".to_string()))
    });
    let message = failure_message_for(job_payload("job-bad", "hi"), backend).await;
    assert_eq!(message, "Malformed response from model backend.");
}

#[tokio::test(start_paused = true)]
async fn test_job_without_messages_fails_without_backend_call() {
    let backend = FnBackend::replying("unused");
    let message =
        failure_message_for(json!({"job_id": "job-empty", "messages": []}), backend.clone()).await;
    assert_eq!(message, "Job processing failed without result.");
    assert_eq!(backend.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backend_panic_is_reported_and_loop_continues() {
    let queue = ScriptedQueue::with_fetches(vec![
        Ok(Some(job_payload("job-panic", "explode"))),
        Ok(Some(job_payload("job-ok", "fine"))),
    ]);
    let backend = FnBackend::new(|messages: &[Value]| {
        if messages[0]["content"] == "explode" {
            panic!("backend exploded");
        }
        Ok(assistant_reply("ok"))
    });
    let core = core_with(queue.clone(), backend, ScriptedSampler::fixed(None), false);

    let running = spawn_core(core);
    assert_eventually(|| async { queue.report_count() >= 2 }, WAIT, "two reports expected").await;
    running.stop().await;

    let reports = queue.report_attempts();
    assert_eq!(reports[0].1.job_id, "job-panic");
    assert_eq!(reports[0].1.status, JobStatus::Failed);
    let error = reports[0].1.error.as_deref().unwrap();
    assert!(error.starts_with("Unexpected error while processing job:"));
    assert!(error.contains("backend exploded"));

    assert_eq!(reports[1].1.job_id, "job-ok");
    assert_eq!(reports[1].1.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_job_without_id_is_skipped() {
    let queue = ScriptedQueue::with_fetches(vec![Ok(Some(json!({"messages": [{"role": "user", "content": "x"}]})))]);
    let backend = FnBackend::replying("unused");
    let core = core_with(queue.clone(), backend.clone(), ScriptedSampler::fixed(None), false);

    let running = spawn_core(core);
    assert_eventually(|| async { queue.fetch_count() >= 2 }, WAIT, "second fetch expected").await;
    running.stop().await;

    let fetches = queue.fetch_times();
    assert_eq!(fetches[1] - fetches[0], Duration::from_secs(2));
    assert_eq!(queue.report_count(), 0);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_report_retries_until_accepted() {
    let queue = ScriptedQueue::with_fetches(vec![Ok(Some(job_payload("job-1", "hi")))]);
    queue.script_reports(vec![Err(network_error()), Err(network_error()), Ok(())]);
    let core = core_with(
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
        false,
    );

    let running = spawn_core(core);
    assert_eventually(|| async { queue.report_count() >= 3 }, WAIT, "three report attempts").await;
    let stats = running.core.stats();
    running.stop().await;

    let attempts = queue.report_attempts();
    assert_eq!(attempts[1].0 - attempts[0].0, Duration::from_secs(1));
    assert_eq!(attempts[2].0 - attempts[1].0, Duration::from_secs(2));
    assert!(attempts.iter().all(|(_, r)| r.job_id == "job-1"));
    assert_eq!(stats.jobs_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_report_is_not_retried() {
    let queue = ScriptedQueue::with_fetches(vec![Ok(Some(job_payload("job-1", "hi")))]);
    queue.script_reports(vec![Err(WorkerError::Rejected {
        status: "404 Not Found".to_string(),
        url: "http://queue.invalid/complete_job".to_string(),
    })]);
    let core = core_with(
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
        false,
    );

    let running = spawn_core(core);
    // Worker goes back to polling after giving up on the report
    assert_eventually(|| async { queue.fetch_count() >= 2 }, WAIT, "polling resumes").await;
    running.stop().await;

    assert_eq!(queue.report_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_paused_worker_shuts_down_without_network_calls() {
    let queue = ScriptedQueue::new();
    let sampler = ScriptedSampler::fixed(Some(0.0));
    let observer = RecordingObserver::new();
    let core = core_with(queue.clone(), FnBackend::replying("hi"), sampler.clone(), true)
        .with_observer(observer.clone());
    core.pause();

    let running = spawn_core(core);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(running.core.state(), WorkerState::Paused);
    assert_eq!(queue.fetch_count(), 0);

    running.control.shutdown();
    tokio::time::timeout(Duration::from_millis(100), running.handle)
        .await
        .expect("paused worker should exit promptly")
        .unwrap();

    assert_eq!(queue.fetch_count(), 0);
    assert_eq!(queue.report_count(), 0);
    assert!(sampler.sample_times().is_empty());
    assert_eq!(queue.registrations(), 1);
    assert_eq!(queue.deregistrations(), 1);
    assert_eq!(observer.states().last(), Some(&WorkerState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_resume_releases_paused_worker() {
    let queue = ScriptedQueue::new();
    let core = core_with(
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
        false,
    );
    core.pause();

    let running = spawn_core(core);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(queue.fetch_count(), 0);

    running.core.resume();
    assert_eventually(|| async { queue.fetch_count() >= 1 }, WAIT, "fetch after resume").await;
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let queue = ScriptedQueue::with_fetches((0..100).map(|_| Err(network_error())).collect());
    let core = core_with(
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
        false,
    );

    let running = spawn_core(core);
    assert_eventually(|| async { queue.fetch_count() >= 3 }, WAIT, "retries expected").await;
    let before = queue.fetch_count();

    running.control.shutdown();
    tokio::time::timeout(Duration::from_millis(100), running.handle)
        .await
        .expect("worker should exit during backoff")
        .unwrap();
    assert_eq!(queue.fetch_count(), before);
}

#[tokio::test(start_paused = true)]
async fn test_zero_backoff_and_poll_interval_still_wait() {
    let queue = ScriptedQueue::with_fetches(
        (0..3)
            .map(|_| Err(network_error()))
            .chain(std::iter::once(Ok(None)))
            .collect(),
    );
    let core = WorkerCore::with_parts(
        test_worker_config()
            .with_max_backoff(Duration::ZERO)
            .with_poll_interval(Duration::ZERO),
        queue.clone(),
        FnBackend::replying("hi"),
        ScriptedSampler::fixed(None),
    );

    let running = spawn_core(core);
    assert_eventually(|| async { queue.fetch_count() >= 6 }, WAIT, "polling continues").await;
    running.stop().await;

    let fetches = queue.fetch_times();
    // Three failed fetches, one empty one, then idle polls
    assert!(fetches
        .windows(2)
        .take(5)
        .all(|w| w[1] - w[0] >= Duration::from_millis(10)));
    assert!(fetches[5] - fetches[0] >= Duration::from_millis(50));
}
