use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kb_mcp_core::RunCodexArgs;
use kb_orchestrator::model::{AgentId, StatusId, TaskId};
use kb_orchestrator::orchestrator::EMPTY_RESPONSE;
use kb_orchestrator::{
    AgentSpec, Event, MissingMarker, NotificationHub, Orchestrator, OrchestratorOptions,
    PromptExecutor, RetryPolicy, ScheduleOutcome, Store, TaskSpec, Transport, TransportError,
};
use tokio::sync::Semaphore;

/// Answers every call with the same text, optionally waiting for a permit first.
struct ScriptedTransport {
    reply: Result<String, ()>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<RunCodexArgs>>,
}

impl ScriptedTransport {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            gate: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: Err(()),
            gate: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn gated(text: &str, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            gate: Some(gate),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<RunCodexArgs> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn run_codex(&self, args: &RunCodexArgs) -> Result<String, TransportError> {
        self.calls.lock().unwrap().push(args.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.reply.clone().map_err(|_| TransportError::Closed)
    }
}

struct Board {
    store: Arc<Store>,
    working: StatusId,
    done: StatusId,
    failed: StatusId,
    review: StatusId,
    dev: AgentId,
    human: AgentId,
}

fn board(api_key: Option<&str>) -> Board {
    let store = Arc::new(Store::new());
    let project = store.create_project("Demo").unwrap().id;
    let working = store.create_status(project, "Working", "#0af").unwrap().id;
    let done = store.create_status(project, "Done", "#0f0").unwrap().id;
    let failed = store.create_status(project, "Failed", "#f00").unwrap().id;
    let review = store.create_status(project, "Review", "#fa0").unwrap().id;
    let role = store.create_role("developer", "You write code.").unwrap().id;
    let dev = store
        .create_agent(AgentSpec {
            name: "dev".into(),
            project_id: project,
            role_id: Some(role),
            working_status: Some(working),
            success_status: Some(done),
            error_status: Some(failed),
            acceptance_criteria: "it compiles".into(),
            api_key: api_key.map(str::to_string),
            model: Some("gpt-test".into()),
            ..AgentSpec::default()
        })
        .unwrap()
        .id;
    let human = store
        .create_agent(AgentSpec {
            name: "human".into(),
            project_id: project,
            ..AgentSpec::default()
        })
        .unwrap()
        .id;

    Board {
        store,
        working,
        done,
        failed,
        review,
        dev,
        human,
    }
}

fn orchestrator(
    board: &Board,
    transport: Arc<dyn Transport>,
    policy: MissingMarker,
) -> Orchestrator {
    let executor = PromptExecutor::new(
        transport,
        RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 1,
            backoff: Duration::ZERO,
        },
    );
    Orchestrator::start(
        Arc::clone(&board.store),
        executor,
        Arc::new(NotificationHub::default()),
        OrchestratorOptions {
            workers: 2,
            missing_marker: policy,
            ..OrchestratorOptions::default()
        },
    )
}

fn new_task(board: &Board, title: &str) -> TaskSpec {
    let project_id = board
        .store
        .read(|b| b.statuses[&board.working].project_id)
        .unwrap();
    TaskSpec {
        title: title.into(),
        project_id,
        status_id: board.working,
        message: Some((board.human, format!("please {title}"))),
    }
}

fn holder_of(board: &Board, agent_id: AgentId) -> Option<TaskId> {
    board
        .store
        .read(|b| b.agents[&agent_id].current_task)
        .unwrap()
}

async fn until_called(transport: &ScriptedTransport, calls: usize) {
    while transport.calls().len() < calls {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn status_of(board: &Board, task_id: TaskId) -> StatusId {
    board.store.read(|b| b.tasks[&task_id].status_id).unwrap()
}

fn messages_of(board: &Board, task_id: TaskId) -> Vec<(AgentId, String)> {
    board
        .store
        .read(|b| {
            b.messages_for(task_id)
                .map(|m| (m.author_id, m.text.clone()))
                .collect()
        })
        .unwrap()
}

#[tokio::test]
async fn success_moves_task_and_frees_agent_for_the_next_one() {
    let board = board(Some("sk-test"));
    let transport = ScriptedTransport::replying("Done\nSTATUS: SUCCESS");
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);

    // Both tasks wait in Working; only the first is triggered.
    let (first, first_change) = board.store.create_task(new_task(&board, "build")).unwrap();
    let (second, _) = board.store.create_task(new_task(&board, "test")).unwrap();
    orchestrator.commit(&[first_change]);
    orchestrator.wait_idle().await;

    assert_eq!(status_of(&board, first.id), board.done);
    assert_eq!(status_of(&board, second.id), board.done);
    assert_eq!(
        messages_of(&board, first.id),
        vec![
            (board.human, "please build".to_string()),
            (board.dev, "Done".to_string())
        ]
    );
    let current = board.store.read(|b| b.agents[&board.dev].current_task).unwrap();
    assert_eq!(current, None);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].task_id, Some(first.id));
    assert_eq!(calls[1].task_id, Some(second.id));
    assert_eq!(calls[0].status_id, Some(board.working));
    assert!(calls[0].prompt.starts_with("build\n\nhuman: please build"));
    assert_eq!(calls[0].instructions, "You write code.\nAcceptance criteria: it compiles");
    assert_eq!(calls[0].api_key, "sk-test");
    assert_eq!(calls[0].model, "gpt-test");
}

#[tokio::test]
async fn trigger_for_a_running_task_is_deferred() {
    let board = board(Some("sk-test"));
    let gate = Arc::new(Semaphore::new(0));
    let transport = ScriptedTransport::gated("ok\nSTATUS: SUCCESS", Arc::clone(&gate));
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);

    let (task, _) = board.store.create_task(new_task(&board, "build")).unwrap();
    assert_eq!(orchestrator.schedule(task.id), ScheduleOutcome::Queued);
    assert_eq!(orchestrator.schedule(task.id), ScheduleOutcome::AlreadyRunning);
    assert!(orchestrator.tracker().is_running(task.id));

    gate.add_permits(1);
    orchestrator.wait_idle().await;

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(status_of(&board, task.id), board.done);
    assert!(!orchestrator.tracker().is_running(task.id));
}

#[tokio::test]
async fn manual_move_during_a_run_is_kept() {
    let board = board(Some("sk-test"));
    let gate = Arc::new(Semaphore::new(0));
    let transport = ScriptedTransport::gated("Done\nSTATUS: SUCCESS", Arc::clone(&gate));
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);

    let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
    until_called(&transport, 1).await;
    assert_eq!(holder_of(&board, board.dev), Some(task.id));

    let change = orchestrator.move_task(task.id, board.review).unwrap();
    assert!(change.is_some());
    assert_eq!(holder_of(&board, board.dev), None);

    gate.add_permits(1);
    orchestrator.wait_idle().await;

    assert_eq!(status_of(&board, task.id), board.review);
    assert_eq!(
        messages_of(&board, task.id).pop().unwrap(),
        (board.dev, "Done".to_string())
    );
    assert_eq!(holder_of(&board, board.dev), None);
    assert_eq!(transport.calls().len(), 1);
}

/// Blows up inside the remote call.
struct PanickingTransport;

#[async_trait]
impl Transport for PanickingTransport {
    async fn run_codex(&self, _args: &RunCodexArgs) -> Result<String, TransportError> {
        panic!("sandbox client crashed");
    }
}

#[tokio::test]
async fn panicking_run_still_reports_finished() {
    let board = board(Some("sk-test"));
    let orchestrator = orchestrator(&board, Arc::new(PanickingTransport), MissingMarker::Error);
    let mut events = orchestrator.subscribe();

    let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
    orchestrator.wait_idle().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&Event::TaskLlmStarted { task_id: task.id }));
    assert!(seen.contains(&Event::TaskLlmFinished {
        task_id: task.id,
        agent_name: Some("dev".into()),
        working_status_id: Some(board.working),
        working_status_color: Some("#0af".into()),
    }));
    assert!(!orchestrator.tracker().is_running(task.id));
}

#[tokio::test]
async fn unwatched_status_publishes_no_run_events() {
    let board = board(Some("sk-test"));
    let transport = ScriptedTransport::replying("unused");
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);
    let mut events = orchestrator.subscribe();

    let mut spec = new_task(&board, "later");
    spec.status_id = board.review;
    let task = orchestrator.create_task(spec).unwrap();
    orchestrator.wait_idle().await;

    assert_eq!(
        events.try_recv().unwrap(),
        Event::TaskStatusChanged {
            task_id: task.id,
            status_id: board.review
        }
    );
    assert!(events.try_recv().is_err());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn answer_without_marker_follows_the_configured_policy() {
    for (policy, expected_done) in [(MissingMarker::Error, false), (MissingMarker::Success, true)] {
        let board = board(Some("sk-test"));
        let transport = ScriptedTransport::replying("I think it works");
        let orchestrator = orchestrator(&board, transport, policy);

        let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
        orchestrator.wait_idle().await;

        let expected = if expected_done { board.done } else { board.failed };
        assert_eq!(status_of(&board, task.id), expected, "policy {policy:?}");
        assert_eq!(
            messages_of(&board, task.id).last().unwrap().1,
            "I think it works"
        );
    }
}

#[tokio::test]
async fn transport_failure_is_recorded_after_retries() {
    let board = board(Some("sk-test"));
    let transport = ScriptedTransport::failing();
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);

    let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
    orchestrator.wait_idle().await;

    assert_eq!(transport.calls().len(), 2);
    assert_eq!(status_of(&board, task.id), board.failed);
    let (author, text) = messages_of(&board, task.id).pop().unwrap();
    assert_eq!(author, board.dev);
    assert!(text.starts_with("Agent run failed"), "{text}");
}

#[tokio::test]
async fn missing_credential_fails_without_calling_the_sandbox() {
    let board = board(None);
    let transport = ScriptedTransport::replying("unused");
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);

    let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
    orchestrator.wait_idle().await;

    assert!(transport.calls().is_empty());
    assert_eq!(status_of(&board, task.id), board.failed);
    let text = messages_of(&board, task.id).pop().unwrap().1;
    assert!(text.contains("configuration error"), "{text}");
}

#[tokio::test]
async fn empty_answer_takes_the_error_path() {
    let board = board(Some("sk-test"));
    let transport = ScriptedTransport::replying("   ");
    let orchestrator = orchestrator(&board, transport, MissingMarker::Success);

    let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
    orchestrator.wait_idle().await;

    assert_eq!(status_of(&board, task.id), board.failed);
    assert_eq!(messages_of(&board, task.id).pop().unwrap().1, EMPTY_RESPONSE);
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let board = board(Some("sk-test"));
    let transport = ScriptedTransport::replying("Done\nSTATUS: SUCCESS");
    let orchestrator = orchestrator(&board, transport, MissingMarker::Error);
    let mut events = orchestrator.subscribe();

    let task = orchestrator.create_task(new_task(&board, "build")).unwrap();
    orchestrator.wait_idle().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert_eq!(
        seen[0],
        Event::TaskStatusChanged {
            task_id: task.id,
            status_id: board.working
        }
    );
    assert!(seen.contains(&Event::TaskLlmStarted { task_id: task.id }));
    assert!(seen.contains(&Event::TaskLlmFinished {
        task_id: task.id,
        agent_name: Some("dev".into()),
        working_status_id: Some(board.working),
        working_status_color: Some("#0af".into()),
    }));
    assert!(seen.contains(&Event::TaskStatusChanged {
        task_id: task.id,
        status_id: board.done
    }));
}

#[tokio::test]
async fn at_most_one_agent_holds_a_task() {
    let board = board(Some("sk-test"));
    let project_id = board
        .store
        .read(|b| b.statuses[&board.working].project_id)
        .unwrap();
    board
        .store
        .create_agent(AgentSpec {
            name: "alt".into(),
            project_id,
            working_status: Some(board.working),
            success_status: Some(board.done),
            error_status: Some(board.failed),
            api_key: Some("sk-test".into()),
            model: Some("gpt-test".into()),
            ..AgentSpec::default()
        })
        .unwrap();

    let gate = Arc::new(Semaphore::new(0));
    let transport = ScriptedTransport::gated("Done\nSTATUS: SUCCESS", Arc::clone(&gate));
    let orchestrator = orchestrator(&board, transport.clone(), MissingMarker::Error);

    let tasks: Vec<TaskId> = (0..4)
        .map(|i| {
            orchestrator
                .create_task(new_task(&board, &format!("job {i}")))
                .unwrap()
                .id
        })
        .collect();

    // Let claims settle while both agents are busy.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = board.store.snapshot().unwrap();
    for task_id in &tasks {
        let holders = snapshot
            .agents
            .values()
            .filter(|agent| agent.current_task == Some(*task_id))
            .count();
        assert!(holders <= 1);
    }

    gate.add_permits(16);
    orchestrator.wait_idle().await;
    for task_id in tasks {
        assert_eq!(status_of(&board, task_id), board.done);
    }
    assert_eq!(transport.calls().len(), 4);
}
