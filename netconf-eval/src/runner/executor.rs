//! Benchmark executor: dispatch, retry, parse, score and record

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

use crate::analysis::equivalence::EquivalenceChecker;
use crate::analysis::metrics::AggregateMetrics;
use crate::config::BenchmarkConfig;
use crate::parser::{
    extract_code, parse_conflict_answer, parse_low_level_config, parser_for, split_batch, ConflictAnswer,
    ParseResult, ParsedOutput, PolicyParser, RawOutput,
};
use crate::providers::{CompletionResponse, ModelCallError, ModelClient};
use crate::reporting::store::{ResultStore, StoreError};
use crate::tasks::{Experiment, TaskError, TaskGenerator, TaskInstance, TrialContext, TrialResult};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Instances in flight at once
    pub parallel_requests: usize,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Deadline for a single model call
    pub timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel_requests: 3,
            retry_count: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            timeout_ms: 120_000,
        }
    }
}

impl ExecutorConfig {
    pub fn from_benchmark(config: &BenchmarkConfig) -> Self {
        Self {
            parallel_requests: config.parallel_requests.max(1),
            retry_count: config.retry_count,
            retry_delay_ms: config.retry_delay_ms,
            max_retry_delay_ms: config.max_retry_delay_ms,
            timeout_ms: config.timeout_ms,
        }
    }
}

/// Where a trial is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStage {
    Pending,
    Dispatched,
    Parsed,
    Scored,
    Recorded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal trial transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TrialStage,
    pub to: TrialStage,
}

/// Lifecycle tracker for one trial
///
/// Stages only move forward. A parse failure or a failed model call goes
/// straight from `Dispatched` to `Recorded`.
#[derive(Debug, Clone)]
pub struct TrialProgress {
    stage: TrialStage,
}

impl Default for TrialProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TrialProgress {
    pub fn new() -> Self {
        Self {
            stage: TrialStage::Pending,
        }
    }

    pub fn stage(&self) -> TrialStage {
        self.stage
    }

    pub fn advance(&mut self, to: TrialStage) -> Result<(), TransitionError> {
        use TrialStage::*;
        let legal = matches!(
            (self.stage, to),
            (Pending, Dispatched) | (Dispatched, Parsed) | (Dispatched, Recorded) | (Parsed, Scored) | (Scored, Recorded)
        );
        if !legal {
            return Err(TransitionError { from: self.stage, to });
        }
        self.stage = to;
        Ok(())
    }
}

/// A (model, experiment) pairing stopped by a fatal model error
#[derive(Debug, Clone, PartialEq)]
pub struct PairingAbort {
    pub model_id: String,
    pub experiment: Experiment,
    pub reason: String,
    /// Instances that were never dispatched
    pub skipped_instances: usize,
}

/// Everything one session produced
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub metrics: AggregateMetrics,
    pub results: Vec<TrialResult>,
    pub aborted: Vec<PairingAbort>,
}

/// Progress callback for tracking execution
pub trait ProgressCallback: Send + Sync {
    fn on_instance_start(&self, instance_id: &str, model_id: &str);
    fn on_trial_recorded(&self, result: &TrialResult);
    fn on_progress(&self, completed: usize, total: usize);
}

/// Default no-op progress callback
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_instance_start(&self, _instance_id: &str, _model_id: &str) {}
    fn on_trial_recorded(&self, _result: &TrialResult) {}
    fn on_progress(&self, _completed: usize, _total: usize) {}
}

/// Console progress callback
pub struct ConsoleProgress;

impl ProgressCallback for ConsoleProgress {
    fn on_instance_start(&self, instance_id: &str, model_id: &str) {
        println!("  Starting {} on {}...", instance_id, model_id);
    }

    fn on_trial_recorded(&self, result: &TrialResult) {
        println!(
            "  {} {} (run {}) on {}",
            result.outcome.as_str(),
            result.task_id,
            result.run_index,
            result.model_id
        );
    }

    fn on_progress(&self, completed: usize, total: usize) {
        println!("Progress: {}/{} instances complete", completed, total);
    }
}

/// Shared stop signal for one pairing
#[derive(Debug, Default)]
struct AbortSignal {
    raised: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl AbortSignal {
    fn raise(&self, reason: String) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            if let Ok(mut slot) = self.reason.lock() {
                *slot = Some(reason);
            }
        }
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }
}

enum InstanceOutcome {
    Recorded(Vec<TrialResult>),
    Skipped,
}

/// Benchmark executor
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    checker: EquivalenceChecker,
    store: Arc<dyn ResultStore>,
    semaphore: Arc<Semaphore>,
    progress: Arc<dyn ProgressCallback>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, checker: EquivalenceChecker, store: Arc<dyn ResultStore>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.parallel_requests.max(1)));
        Self {
            config,
            checker,
            store,
            semaphore,
            progress: Arc::new(NoOpProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `n_runs` runs of every instance the generator yields against
    /// every client
    pub async fn run(
        &self,
        generator: &dyn TaskGenerator,
        clients: &[Arc<dyn ModelClient>],
        n_runs: u32,
    ) -> Result<SessionReport, TaskError> {
        let mut instances = Vec::new();
        for run_index in 0..n_runs {
            instances.extend(generator.instances(run_index)?);
        }
        tracing::info!(
            "Running {} instances of {} against {} models",
            instances.len(),
            generator.experiment(),
            clients.len()
        );

        let mut results = Vec::new();
        let mut aborted = Vec::new();
        for client in clients {
            let (pairing_results, abort) = self
                .run_pairing(generator.experiment(), client.clone(), &instances)
                .await;
            results.extend(pairing_results);
            aborted.extend(abort);
        }

        results.sort_by_key(TrialResult::key);
        Ok(SessionReport {
            metrics: AggregateMetrics::from_results(&results),
            results,
            aborted,
        })
    }

    async fn run_pairing(
        &self,
        experiment: Experiment,
        client: Arc<dyn ModelClient>,
        instances: &[TaskInstance],
    ) -> (Vec<TrialResult>, Option<PairingAbort>) {
        let parser: Arc<dyn PolicyParser> = Arc::from(parser_for(client.supports_native_function_calling()));
        let signal = Arc::new(AbortSignal::default());
        let completed = Arc::new(AtomicUsize::new(0));
        let total = instances.len();

        let mut handles = Vec::with_capacity(total);
        for instance in instances {
            let executor = self.clone_for_task();
            let client = client.clone();
            let parser = parser.clone();
            let signal = signal.clone();
            let completed = completed.clone();
            let instance = instance.clone();

            handles.push(tokio::spawn(async move {
                let outcome = executor
                    .run_instance(client.as_ref(), parser.as_ref(), &instance, &signal)
                    .await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                executor.progress.on_progress(done, total);
                outcome
            }));
        }

        let mut results = Vec::new();
        let mut skipped = 0;
        for handle in handles {
            match handle.await {
                Ok(InstanceOutcome::Recorded(recorded)) => results.extend(recorded),
                Ok(InstanceOutcome::Skipped) => skipped += 1,
                Err(e) => tracing::error!("Task execution panicked: {}", e),
            }
        }

        let abort = signal.is_raised().then(|| {
            let reason = signal.reason().unwrap_or_default();
            tracing::error!(
                "Aborted {} on {}: {} ({} instances not dispatched)",
                experiment,
                client.model_id(),
                reason,
                skipped
            );
            PairingAbort {
                model_id: client.model_id().to_string(),
                experiment,
                reason,
                skipped_instances: skipped,
            }
        });
        (results, abort)
    }

    async fn run_instance(
        &self,
        client: &dyn ModelClient,
        parser: &dyn PolicyParser,
        instance: &TaskInstance,
        signal: &AbortSignal,
    ) -> InstanceOutcome {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return InstanceOutcome::Skipped;
        };
        if signal.is_raised() {
            tracing::debug!("Skipping {} on {}: pairing aborted", instance.id, client.model_id());
            return InstanceOutcome::Skipped;
        }

        let mut progress: Vec<TrialProgress> = instance.requests.iter().map(|_| TrialProgress::new()).collect();
        for p in &mut progress {
            step(p, TrialStage::Dispatched, &instance.id);
        }
        self.progress.on_instance_start(&instance.id, client.model_id());

        let (response, attempts) = self.call_with_retries(client, instance, signal).await;
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                let mut recorded = Vec::with_capacity(instance.requests.len());
                let count = instance.requests.len();
                for (index, (request, p)) in instance.requests.iter().zip(&mut progress).enumerate() {
                    let ctx = context(instance, &request.id, client.model_id());
                    let result = TrialResult::model_call_failed(ctx, &error, attempts).share_of(index, count);
                    step(p, TrialStage::Recorded, &request.id);
                    recorded.extend(self.record(result).await);
                }
                return InstanceOutcome::Recorded(recorded);
            }
        };

        let raw = response.raw_output();
        let parsed = parse_response(instance, parser, &raw);

        let request_count = instance.requests.len();
        let mut recorded = Vec::with_capacity(request_count);
        for (index, ((request, p), parsed)) in instance.requests.iter().zip(&mut progress).zip(parsed).enumerate() {
            let ctx = context(instance, &request.id, client.model_id());
            let result = match parsed {
                Ok(parsed) => {
                    step(p, TrialStage::Parsed, &request.id);
                    for warning in &parsed.warnings {
                        tracing::warn!(task = %request.id, "{}", warning);
                    }
                    let verdict = self.checker.check(&parsed.value, &request.expected).await;
                    step(p, TrialStage::Scored, &request.id);
                    TrialResult::scored(ctx, verdict, parsed.warnings, &response, attempts)
                }
                Err(error) => {
                    tracing::debug!("Parse failure for {}: {}", request.id, error);
                    TrialResult::parse_failed(ctx, error, &response, attempts)
                }
            }
            .share_of(index, request_count);
            step(p, TrialStage::Recorded, &request.id);
            recorded.extend(self.record(result).await);
        }
        InstanceOutcome::Recorded(recorded)
    }

    /// Call the model until it answers, the retry budget runs out, or a
    /// fatal error stops the pairing. Returns the attempt count alongside.
    async fn call_with_retries(
        &self,
        client: &dyn ModelClient,
        instance: &TaskInstance,
        signal: &AbortSignal,
    ) -> (Result<CompletionResponse, ModelCallError>, u32) {
        let request = instance.completion_request();
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_retry_delay_ms);
        let mut last_error = ModelCallError::Transient("no attempt made".to_string());
        let mut attempts = 0;
        let mut waited = false;

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tracing::info!(
                    "Retry {} for {} (run {}) on {}...",
                    attempt,
                    instance.id,
                    instance.run_index,
                    client.model_id()
                );
                // a rate-limit wait already spaced this attempt out
                if !std::mem::take(&mut waited) {
                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }

            attempts += 1;
            let outcome = match timeout(Duration::from_millis(self.config.timeout_ms), client.complete(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ModelCallError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }),
            };

            match outcome {
                Ok(response) => return (Ok(response), attempts),
                Err(ModelCallError::RateLimited { retry_after_ms }) => {
                    tracing::warn!("Rate limited on {}, waiting {}ms", client.model_id(), retry_after_ms);
                    sleep(Duration::from_millis(retry_after_ms).min(max_delay)).await;
                    waited = true;
                    last_error = ModelCallError::RateLimited { retry_after_ms };
                }
                Err(e) if !e.is_transient() => {
                    tracing::error!("Fatal error for {} on {}: {}", instance.id, client.model_id(), e);
                    signal.raise(e.to_string());
                    return (Err(e), attempts);
                }
                Err(e) => {
                    tracing::error!("Error for {} on {}: {}", instance.id, client.model_id(), e);
                    last_error = e;
                }
            }
        }

        (Err(last_error), attempts)
    }

    /// Append to the store; a key that is already stored is not reported
    /// twice
    async fn record(&self, result: TrialResult) -> Option<TrialResult> {
        match self.store.append(&result).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                tracing::warn!(
                    "{} (run {}) on {} already recorded, keeping the stored result",
                    result.task_id,
                    result.run_index,
                    result.model_id
                );
                return None;
            }
            Err(e) => tracing::error!("Failed to store result for {}: {}", result.task_id, e),
        }
        self.progress.on_trial_recorded(&result);
        Some(result)
    }

    fn clone_for_task(&self) -> Self {
        self.clone()
    }
}

fn context(instance: &TaskInstance, request_id: &str, model_id: &str) -> TrialContext {
    TrialContext {
        task_id: request_id.to_string(),
        model_id: model_id.to_string(),
        run_index: instance.run_index,
        experiment: instance.experiment,
        batch_size: instance.batch_size,
    }
}

fn step(progress: &mut TrialProgress, to: TrialStage, id: &str) {
    if let Err(e) = progress.advance(to) {
        tracing::error!("{}: {}", id, e);
    }
}

/// One parse result per sub-request of the instance
fn parse_response(
    instance: &TaskInstance,
    parser: &dyn PolicyParser,
    raw: &RawOutput,
) -> Vec<ParseResult<ParsedOutput>> {
    let single = |result: ParseResult<ParsedOutput>| vec![result; instance.requests.len()];
    match instance.experiment {
        Experiment::Translation => split_batch(parser, raw, &instance.request_keys(), &instance.filter)
            .into_iter()
            .map(|r| r.map(|p| p.map(ParsedOutput::Policies)))
            .collect(),
        Experiment::Conflict => single(parse_conflict_answer(parser, raw, &instance.filter).map(|p| {
            p.map(|answer| match answer {
                ConflictAnswer::Conflict(reason) => ParsedOutput::ConflictReport(reason),
                ConflictAnswer::Policies(policies) => ParsedOutput::Policies(policies),
            })
        })),
        Experiment::Code => single(extract_code(raw).map(|p| p.map(ParsedOutput::Code))),
        Experiment::Config => single(parse_low_level_config(raw).map(|p| p.map(ParsedOutput::Config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::code_check::FnRunner;
    use crate::analysis::equivalence::Expected;
    use crate::parser::FunctionCall;
    use crate::policy::{Policy, PolicyFilter, PolicySet};
    use crate::providers::{CompletionRequest, Message, ModelCallResult};
    use crate::reporting::MemoryResultStore;
    use crate::runner::rate_limiter::RateLimiter;
    use crate::tasks::{SubRequest, TrialOutcome};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedClient {
        id: String,
        native: bool,
        replies: Mutex<VecDeque<ModelCallResult<CompletionResponse>>>,
        calls: AtomicUsize,
        limiter: Arc<RateLimiter>,
    }

    impl ScriptedClient {
        fn new(id: &str, replies: Vec<ModelCallResult<CompletionResponse>>) -> Self {
            Self {
                id: id.to_string(),
                native: false,
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                limiter: Arc::new(RateLimiter::unlimited()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model_id(&self) -> &str {
            &self.id
        }

        fn supports_native_function_calling(&self) -> bool {
            self.native
        }

        async fn complete(&self, _request: &CompletionRequest) -> ModelCallResult<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(text("{}")))
        }

        fn rate_limiter(&self) -> &Arc<RateLimiter> {
            &self.limiter
        }
    }

    struct FixedGenerator(Vec<TaskInstance>);

    impl TaskGenerator for FixedGenerator {
        fn experiment(&self) -> Experiment {
            Experiment::Translation
        }

        fn instances(&self, run_index: u32) -> Result<Vec<TaskInstance>, TaskError> {
            Ok(self
                .0
                .iter()
                .cloned()
                .map(|mut instance| {
                    instance.run_index = run_index;
                    instance
                })
                .collect())
        }
    }

    fn text(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            latency_ms: 5,
            ..Default::default()
        }
    }

    fn instance(id: &str, expected: Vec<Policy>) -> TaskInstance {
        let expected: PolicySet = expected.into_iter().collect();
        TaskInstance {
            id: id.to_string(),
            experiment: Experiment::Translation,
            run_index: 0,
            batch_size: 1,
            messages: vec![Message::user("translate")],
            functions: Vec::new(),
            json_mode: true,
            filter: PolicyFilter::all(),
            requests: vec![SubRequest {
                id: format!("{}-r0", id),
                keys: expected.iter().map(Policy::key).collect(),
                expected: Expected::Policies(expected),
            }],
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            parallel_requests: 1,
            retry_count: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            timeout_ms: 1_000,
        }
    }

    fn executor(store: Arc<MemoryResultStore>) -> Executor {
        let checker = EquivalenceChecker::new(Arc::new(FnRunner::new(|_, _| Err("unused".to_string()))));
        Executor::new(fast_config(), checker, store)
    }

    #[test]
    fn test_trial_stage_transitions() {
        let mut progress = TrialProgress::new();
        assert!(progress.advance(TrialStage::Parsed).is_err());
        progress.advance(TrialStage::Dispatched).unwrap();
        progress.advance(TrialStage::Parsed).unwrap();
        progress.advance(TrialStage::Scored).unwrap();
        progress.advance(TrialStage::Recorded).unwrap();
        assert_eq!(progress.stage(), TrialStage::Recorded);
        assert!(progress.advance(TrialStage::Dispatched).is_err());

        let mut shortcut = TrialProgress::new();
        shortcut.advance(TrialStage::Dispatched).unwrap();
        shortcut.advance(TrialStage::Recorded).unwrap();
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_under_same_key() {
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Err(ModelCallError::Transient("503".to_string())),
                Ok(text(r#"{"reachability": [["A", "B", true]]}"#)),
            ],
        ));
        let generator = FixedGenerator(vec![instance("t", vec![Policy::reachability("A", "B", true)])]);

        let report = executor(store.clone())
            .run(&generator, &[client.clone() as Arc<dyn ModelClient>], 1)
            .await
            .unwrap();

        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.task_id, "t-r0");
        assert_eq!(result.run_index, 0);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.outcome, TrialOutcome::Success);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_wait_replaces_backoff() {
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![
                Err(ModelCallError::RateLimited { retry_after_ms: 20 }),
                Ok(text(r#"{"reachability": [["A", "B", true]]}"#)),
            ],
        ));
        let generator = FixedGenerator(vec![instance("t", vec![Policy::reachability("A", "B", true)])]);
        let config = ExecutorConfig {
            retry_delay_ms: 2_000,
            max_retry_delay_ms: 5_000,
            ..fast_config()
        };
        let checker = EquivalenceChecker::new(Arc::new(FnRunner::new(|_, _| Err("unused".to_string()))));

        let started = std::time::Instant::now();
        let report = Executor::new(config, checker, store)
            .run(&generator, &[client as Arc<dyn ModelClient>], 1)
            .await
            .unwrap();

        assert_eq!(report.results[0].outcome, TrialOutcome::Success);
        assert_eq!(report.results[0].attempts, 2);
        assert!(started.elapsed() < Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_batch_records_split_response_tokens() {
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(ScriptedClient::new(
            "m",
            vec![Ok(CompletionResponse {
                content: r#"{"reachability": [["A", "B", true], ["C", "D", false]]}"#.to_string(),
                input_tokens: 101,
                output_tokens: 7,
                latency_ms: 5,
                ..Default::default()
            })],
        ));
        let mut batched = instance("b", vec![Policy::reachability("A", "B", true)]);
        let second: PolicySet = vec![Policy::reachability("C", "D", false)].into();
        batched.batch_size = 2;
        batched.requests.push(SubRequest {
            id: "b-r1".to_string(),
            keys: second.iter().map(Policy::key).collect(),
            expected: Expected::Policies(second),
        });
        let generator = FixedGenerator(vec![batched]);

        let report = executor(store)
            .run(&generator, &[client as Arc<dyn ModelClient>], 1)
            .await
            .unwrap();

        let tokens: Vec<(u32, u32)> = report.results.iter().map(|r| (r.input_tokens, r.output_tokens)).collect();
        assert_eq!(tokens, vec![(51, 4), (50, 3)]);
        assert_eq!(report.metrics.input_tokens, 101);
        assert!(report.results.iter().all(|r| r.outcome == TrialOutcome::Success));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(ScriptedClient::new(
            "m",
            (0..3).map(|_| Err(ModelCallError::Transient("503".to_string()))).collect(),
        ));
        let generator = FixedGenerator(vec![instance("t", vec![Policy::reachability("A", "B", true)])]);

        let report = executor(store)
            .run(&generator, &[client as Arc<dyn ModelClient>], 1)
            .await
            .unwrap();

        assert_eq!(report.results[0].outcome, TrialOutcome::ModelCallFailed);
        assert_eq!(report.results[0].attempts, 3);
        assert!(report.aborted.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_dispatch_for_pairing() {
        let store = Arc::new(MemoryResultStore::new());
        let failing = Arc::new(ScriptedClient::new("bad", vec![Err(ModelCallError::Fatal("401".to_string()))]));
        let healthy = Arc::new(ScriptedClient::new(
            "good",
            (0..3)
                .map(|_| Ok(text(r#"{"reachability": [["A", "B", true]]}"#)))
                .collect(),
        ));
        let generator = FixedGenerator(vec![
            instance("t1", vec![Policy::reachability("A", "B", true)]),
            instance("t2", vec![Policy::reachability("A", "B", true)]),
            instance("t3", vec![Policy::reachability("A", "B", true)]),
        ]);
        let clients: Vec<Arc<dyn ModelClient>> = vec![failing.clone(), healthy];

        let report = executor(store).run(&generator, &clients, 1).await.unwrap();

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.aborted.len(), 1);
        assert_eq!(report.aborted[0].model_id, "bad");
        assert_eq!(report.aborted[0].skipped_instances, 2);

        let bad: Vec<_> = report.results.iter().filter(|r| r.model_id == "bad").collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].outcome, TrialOutcome::ModelCallFailed);
        assert_eq!(bad[0].attempts, 1);

        let good = report.results.iter().filter(|r| r.model_id == "good").count();
        assert_eq!(good, 3);
    }

    #[tokio::test]
    async fn test_parse_failure_is_recorded_with_raw_output() {
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(ScriptedClient::new("m", vec![Ok(text("I cannot help with that."))]));
        let generator = FixedGenerator(vec![instance("t", vec![Policy::reachability("A", "B", true)])]);

        let report = executor(store)
            .run(&generator, &[client as Arc<dyn ModelClient>], 1)
            .await
            .unwrap();

        let result = &report.results[0];
        assert_eq!(result.outcome, TrialOutcome::ParseFailure);
        assert!(result.parse_error.is_some());
        assert_eq!(result.raw_output, "I cannot help with that.");
        assert_eq!(report.metrics.counts.parse_failures, 1);
    }

    #[tokio::test]
    async fn test_native_calls_are_parsed() {
        let store = Arc::new(MemoryResultStore::new());
        let mut client = ScriptedClient::new(
            "native",
            vec![Ok(CompletionResponse {
                tool_calls: vec![FunctionCall::new(
                    "add_waypoint",
                    serde_json::json!({"source": "A", "destination": "C", "via": "D"}),
                )],
                ..Default::default()
            })],
        );
        client.native = true;
        let generator = FixedGenerator(vec![instance("t", vec![Policy::waypoint("A", "C", "D")])]);

        let report = executor(store)
            .run(&generator, &[Arc::new(client) as Arc<dyn ModelClient>], 1)
            .await
            .unwrap();
        assert_eq!(report.results[0].outcome, TrialOutcome::Success);
    }

    #[tokio::test]
    async fn test_runs_produce_distinct_keys() {
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(ScriptedClient::new(
            "m",
            (0..3)
                .map(|_| Ok(text(r#"{"reachability": [["A", "B", false]]}"#)))
                .collect(),
        ));
        let generator = FixedGenerator(vec![instance("t", vec![Policy::reachability("A", "B", false)])]);

        let report = executor(store.clone())
            .run(&generator, &[client as Arc<dyn ModelClient>], 3)
            .await
            .unwrap();

        let runs: Vec<u32> = report.results.iter().map(|r| r.run_index).collect();
        assert_eq!(runs, vec![0, 1, 2]);
        assert_eq!(store.len(), 3);
        assert!((report.metrics.accuracy - 1.0).abs() < 1e-9);
    }
}
