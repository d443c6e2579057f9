//! 步骤循环端到端测试：脚本化后端 + 内存设备

use std::sync::Arc;
use std::time::Duration;

use phonepilot::action::{
    ActionTranslator, DeviceSize, PackageMap, PixelPoint, PrimitiveCall, TranslatorTimings,
};
use phonepilot::core::{RetryPolicy, TerminalReason};
use phonepilot::device::{ActionExecutor, ConnectionManager, DisplayMode, MockConnector};
use phonepilot::llm::ScriptedLlmClient;
use phonepilot::runner::{ChannelReplySource, ReplyPolicy, RunRequest, RunStop, TaskRunner};
use phonepilot::session::{
    MemorySessionStore, ModelConfig, SessionEvent, SessionOrchestrator, TaskType,
};
use tokio_util::sync::CancellationToken;

const CLICK: &str = "<STATUS>home<ACTION>explain:点击中间\taction:CLICK\tpoint:500,500<PAYLOAD>summary:点了一下";
const COMPLETE: &str = "<ACTION>explain:完成\taction:COMPLETE<PAYLOAD>summary:任务完成";
const INFO: &str = "<ACTION>explain:需要确认\taction:INFO\tvalue:发给谁？";
const DEVICE: &str = "emulator-5554";

struct Harness {
    runner: TaskRunner,
    llm: Arc<ScriptedLlmClient>,
    connector: Arc<MockConnector>,
    connections: Arc<ConnectionManager>,
}

fn harness_with(llm: ScriptedLlmClient) -> Harness {
    let llm = Arc::new(llm);
    let orchestrator = Arc::new(SessionOrchestrator::new(
        Arc::new(MemorySessionStore::new()),
        llm.clone(),
    ));
    let connector = Arc::new(MockConnector::new(DeviceSize::new(1080, 2400)));
    let connections = Arc::new(ConnectionManager::new(connector.clone()));
    let translator =
        ActionTranslator::new(Arc::new(PackageMap::builtin())).with_timings(TranslatorTimings {
            type_focus_delay_ms: 0,
            app_launch_delay_ms: 0,
            ..TranslatorTimings::default()
        });
    let executor = ActionExecutor::new(RetryPolicy::immediate(2), RetryPolicy::immediate(3));
    let runner = TaskRunner::new(
        orchestrator,
        connections.clone(),
        Arc::new(translator),
        Arc::new(executor),
    )
    .with_settle_delay(Duration::ZERO)
    .with_display_mode(DisplayMode::Headless);
    Harness {
        runner,
        llm,
        connector,
        connections,
    }
}

fn harness(replies: &[&str]) -> Harness {
    harness_with(ScriptedLlmClient::replies(replies.iter().copied()))
}

fn task(text: &str) -> RunRequest {
    RunRequest::new_task(DEVICE, text, TaskType::Tagged, ModelConfig::new("test-model"))
}

#[tokio::test]
async fn test_click_then_complete() {
    let h = harness(&[CLICK, COMPLETE]);
    let mut events = h.runner.subscribe();

    let report = h.runner.run(task("点一下屏幕中间"), CancellationToken::new()).await.unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Complete));
    assert_eq!(report.steps, 2);
    assert_eq!(h.llm.calls(), 2);

    let channel = h.connector.last_channel().unwrap();
    assert_eq!(
        channel.calls(),
        vec![PrimitiveCall::Tap {
            point: PixelPoint::new(540, 1200)
        }]
    );
    assert_eq!(h.connector.created(), 1);

    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        seen.push(ev);
    }
    assert!(matches!(seen.first(), Some(SessionEvent::StepStarted { step: 0, .. })));
    assert!(matches!(
        seen.last(),
        Some(SessionEvent::Terminated {
            reason: TerminalReason::Complete,
            ..
        })
    ));
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::Executed { step: 0, error: None, .. })));

    let session = h.runner.orchestrator().load(&report.session_id).await.unwrap();
    assert!(session.steps[0].environment.image.starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn test_info_passes_to_client_then_resumes() {
    let h = harness(&[INFO, COMPLETE]);

    let report = h.runner.run(task("给朋友发消息"), CancellationToken::new()).await.unwrap();
    assert_eq!(
        report.stop,
        RunStop::AwaitingReply {
            question: "发给谁？".into()
        }
    );
    assert_eq!(report.steps, 1);
    assert_eq!(h.llm.calls(), 1);

    // 不带回复恢复：仍然等待，不调用后端
    let again = h
        .runner
        .run(RunRequest::resume(DEVICE, &report.session_id, None), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(again.stop, RunStop::AwaitingReply { .. }));
    assert_eq!(h.llm.calls(), 1);

    let resumed = h
        .runner
        .run(
            RunRequest::resume(DEVICE, &report.session_id, Some("张三".into())),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resumed.stop, RunStop::Terminated(TerminalReason::Complete));
    assert_eq!(resumed.steps, 2);
    assert!(h.llm.requests()[1].messages[1].text().contains("张三"));

    let session = h.runner.orchestrator().load(&report.session_id).await.unwrap();
    assert_eq!(session.steps[1].environment.reply.as_deref(), Some("张三"));
}

#[tokio::test]
async fn test_auto_reply_asks_backend() {
    let h = harness(&[INFO, "李四", COMPLETE]);
    let report = h
        .runner
        .run(
            task("给朋友发消息").with_reply_policy(ReplyPolicy::AutoReply),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Complete));
    assert_eq!(h.llm.calls(), 3);
    let session = h.runner.orchestrator().load(&report.session_id).await.unwrap();
    assert_eq!(session.steps[1].environment.reply.as_deref(), Some("李四"));
}

#[tokio::test]
async fn test_manual_reply_from_channel() {
    let h = harness(&[INFO, COMPLETE]);
    let (tx, source) = ChannelReplySource::new(1);
    tx.send("王五".into()).await.unwrap();
    let report = h
        .runner
        .run(
            task("给朋友发消息").with_reply_policy(ReplyPolicy::ManualReply(Arc::new(source))),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Complete));
    assert!(h.llm.requests()[1].messages[1].text().contains("王五"));
}

#[tokio::test]
async fn test_cancel_while_waiting_for_manual_reply() {
    let h = harness(&[INFO, COMPLETE]);
    // 保留发送端：回复永远不会到达
    let (_tx, source) = ChannelReplySource::new(1);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let report = tokio::time::timeout(
        Duration::from_secs(2),
        h.runner.run(
            task("给朋友发消息").with_reply_policy(ReplyPolicy::ManualReply(Arc::new(source))),
            cancel,
        ),
    )
    .await
    .expect("cancellation should interrupt the reply wait")
    .unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Cancelled));
    assert_eq!(report.steps, 1);
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = harness(&[CLICK]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.runner.run(task("任意"), cancel).await.unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Cancelled));
    assert_eq!(report.steps, 0);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_backend_call() {
    let h = harness_with(ScriptedLlmClient::replies([CLICK]).with_delay(Duration::from_secs(5)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let report = tokio::time::timeout(Duration::from_secs(2), h.runner.run(task("任意"), cancel))
        .await
        .expect("cancellation should interrupt the backend call")
        .unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Cancelled));
    assert_eq!(report.steps, 0);
    assert!(h.connector.last_channel().unwrap().calls().is_empty());
}

#[tokio::test]
async fn test_unknown_app_is_recorded_and_loop_continues() {
    let h = harness(&["<ACTION>explain:打开\taction:AWAKE\tvalue:不存在的应用", COMPLETE]);
    let report = h.runner.run(task("打开应用"), CancellationToken::new()).await.unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::Complete));
    assert_eq!(report.steps, 2);
    let session = h.runner.orchestrator().load(&report.session_id).await.unwrap();
    assert!(session.steps[0]
        .execution_error
        .as_deref()
        .unwrap()
        .contains("不存在的应用"));
}

#[tokio::test]
async fn test_step_budget() {
    let h = harness(&[CLICK, CLICK, CLICK]);
    let report = h
        .runner
        .run(task("一直点").with_max_steps(2), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::MaxStepsReached));
    assert_eq!(report.steps, 2);
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test]
async fn test_unreachable_device() {
    let h = harness(&[CLICK]);
    h.connector.set_fail(true);
    let report = h.runner.run(task("任意"), CancellationToken::new()).await.unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::DeviceUnreachable));
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_execution_failure_after_retries() {
    let h = harness(&[CLICK, COMPLETE]);
    h.connections.acquire(DEVICE, DisplayMode::Headless).await.unwrap();
    h.connector.last_channel().unwrap().fail_next(10);

    let report = h.runner.run(task("点一下"), CancellationToken::new()).await.unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::DeviceExecutionError));
    assert_eq!(report.steps, 1);
    let session = h.runner.orchestrator().load(&report.session_id).await.unwrap();
    assert!(session.steps[0].execution_error.is_some());
    assert_eq!(h.connector.created(), 1);
}

#[tokio::test]
async fn test_parse_failure_ends_session() {
    let h = harness(&["我觉得应该点击按钮"]);
    let report = h.runner.run(task("任意"), CancellationToken::new()).await.unwrap();
    assert_eq!(report.stop, RunStop::Terminated(TerminalReason::ParseError));
    assert_eq!(report.steps, 1);

    let err = h
        .runner
        .run(RunRequest::resume(DEVICE, &report.session_id, None), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        phonepilot::PilotError::SessionTerminated {
            reason: TerminalReason::ParseError,
            ..
        }
    ));
}
