//! PhonePilot 命令行入口
//!
//! 子命令：devices 列出设备；run 在设备上执行新任务；resume 带回复继续暂停的会话；show 查看会话记录。
//! Ctrl+C 通过 SessionSupervisor 取消正在运行的会话，会话以 CANCELLED 结束。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use phonepilot::config::{load_config, AppConfig, ReplyMode, StoreKind};
use phonepilot::core::{RetryPolicy, SessionSupervisor};
use phonepilot::device::{list_devices, ActionExecutor, AdbConnector, ConnectionManager};
use phonepilot::llm::{ProviderRouter, RetryingLlmClient, SamplingParams};
use phonepilot::runner::{ReplyPolicy, RunRequest, RunStop, StdinReplySource, TaskRunner};
use phonepilot::session::{
    FileSessionStore, MemorySessionStore, ModelConfig, SessionOrchestrator, SessionStore, TaskType,
};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "phonepilot", version, about = "Drive an Android device with a decision backend")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices visible to adb
    Devices,
    /// Start a new task on a device
    Run(RunArgs),
    /// Continue a paused session, optionally with a reply
    Resume(ResumeArgs),
    /// Print a recorded session as JSON (all sessions when no id is given)
    Show(ShowArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Device serial or host:port
    #[arg(short, long)]
    device: String,
    task: String,
    /// tagged | invoke
    #[arg(long, default_value = "tagged")]
    task_type: String,
    #[arg(short, long)]
    model: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_steps: Option<usize>,
    /// auto_reply | manual_reply | pass_to_client
    #[arg(long)]
    reply_mode: Option<String>,
}

#[derive(Args)]
struct ResumeArgs {
    #[arg(short, long)]
    device: String,
    session_id: String,
    #[arg(short, long)]
    reply: Option<String>,
    #[arg(long)]
    max_steps: Option<usize>,
    #[arg(long)]
    reply_mode: Option<String>,
}

#[derive(Args)]
struct ShowArgs {
    session_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    phonepilot::observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Command::Devices => {
            let devices = list_devices(
                Path::new(&cfg.device.adb_path),
                Duration::from_secs(cfg.device.command_timeout_secs),
            )
            .await
            .map_err(anyhow::Error::msg)
            .context("adb devices failed")?;
            if devices.is_empty() {
                println!("no devices");
            }
            for d in devices {
                println!("{d}");
            }
        }
        Command::Run(args) => {
            let task_type = TaskType::parse(&args.task_type)?;
            let mut model_config =
                ModelConfig::new(args.model.unwrap_or_else(|| cfg.llm.model.clone()))
                    .with_provider(args.provider.unwrap_or_default());
            model_config.args = SamplingParams {
                temperature: args.temperature,
                ..SamplingParams::default()
            };
            let mut request = RunRequest::new_task(&args.device, &args.task, task_type, model_config)
                .with_reply_policy(reply_policy(&cfg, args.reply_mode.as_deref())?);
            if let Some(n) = args.max_steps {
                request = request.with_max_steps(n);
            }
            drive(&cfg, request).await?;
        }
        Command::Resume(args) => {
            let mut request = RunRequest::resume(&args.device, &args.session_id, args.reply)
                .with_reply_policy(reply_policy(&cfg, args.reply_mode.as_deref())?);
            if let Some(n) = args.max_steps {
                request = request.with_max_steps(n);
            }
            drive(&cfg, request).await?;
        }
        Command::Show(args) => {
            let store = build_store(&cfg);
            match args.session_id {
                Some(id) => {
                    let session = store.load(&id).await.context("Failed to load session")?;
                    println!("{}", serde_json::to_string_pretty(&session)?);
                }
                None => {
                    for s in store.list().await.context("Failed to list sessions")? {
                        println!("{}", serde_json::to_string(&s)?);
                    }
                }
            }
        }
    }
    Ok(())
}

fn reply_policy(cfg: &AppConfig, flag: Option<&str>) -> anyhow::Result<ReplyPolicy> {
    let mode = match flag {
        Some("auto_reply") => ReplyMode::AutoReply,
        Some("manual_reply") => ReplyMode::ManualReply,
        Some("pass_to_client") => ReplyMode::PassToClient,
        Some(other) => anyhow::bail!("unknown reply mode '{other}'"),
        None => cfg.runner.reply_mode,
    };
    Ok(match mode {
        ReplyMode::AutoReply => ReplyPolicy::AutoReply,
        ReplyMode::ManualReply => ReplyPolicy::ManualReply(Arc::new(StdinReplySource)),
        ReplyMode::PassToClient => ReplyPolicy::PassToClient,
    })
}

fn build_store(cfg: &AppConfig) -> Arc<dyn SessionStore> {
    match cfg.app.store {
        StoreKind::Memory => Arc::new(MemorySessionStore::new()),
        StoreKind::File => Arc::new(FileSessionStore::new(&cfg.app.log_dir, &cfg.app.image_dir)),
    }
}

fn build_runner(cfg: &AppConfig) -> anyhow::Result<(TaskRunner, Arc<ConnectionManager>)> {
    let router = ProviderRouter::from_config(&cfg.llm);
    tracing::debug!(providers = ?router.providers(), "llm providers");
    let llm = Arc::new(RetryingLlmClient::new(
        Arc::new(router),
        RetryPolicy::new(cfg.llm.retry_attempts, Duration::from_secs(1)),
    ));
    let orchestrator = SessionOrchestrator::new(build_store(cfg), llm)
        .with_default_timeout(Duration::from_secs(cfg.llm.request_timeout_secs));

    let command_timeout = Duration::from_secs(cfg.device.command_timeout_secs);
    let connector = AdbConnector::new(&cfg.device.adb_path, command_timeout);
    let connections = Arc::new(
        ConnectionManager::new(Arc::new(connector))
            .with_failure_threshold(cfg.device.failure_threshold),
    );
    let translator = cfg.build_translator().context("Failed to build translator")?;
    let executor = ActionExecutor::new(cfg.retry.execution.policy(), cfg.retry.screenshot.policy())
        .with_call_timeout(command_timeout);

    let runner = TaskRunner::new(
        Arc::new(orchestrator),
        connections.clone(),
        Arc::new(translator),
        Arc::new(executor),
    )
    .with_max_steps(cfg.runner.max_steps)
    .with_settle_delay(Duration::from_millis(cfg.runner.settle_delay_ms))
    .with_display_mode(cfg.device.display_mode);
    Ok((runner, connections))
}

async fn drive(cfg: &AppConfig, request: RunRequest) -> anyhow::Result<()> {
    let (runner, connections) = build_runner(cfg)?;
    let supervisor = Arc::new(SessionSupervisor::new());
    let cancel = supervisor.begin(&request.device_id);

    let on_ctrl_c = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            on_ctrl_c.cancel_all();
        }
    });

    let mut events = runner.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event printer lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let device_id = request.device_id.clone();
    let result = runner.run(request, cancel).await;
    supervisor.finish(&device_id);
    connections.release_all().await;
    drop(runner);
    let _ = printer.await;

    let report = result.context("Run failed")?;
    match report.stop {
        RunStop::Terminated(reason) => {
            println!("session {} finished: {} after {} steps", report.session_id, reason, report.steps)
        }
        RunStop::AwaitingReply { question } => {
            println!("session {} is waiting for a reply: {}", report.session_id, question);
            println!("resume with: phonepilot resume -d {} {} -r <reply>", device_id, report.session_id);
        }
    }
    Ok(())
}
