//! Scheduler-fired job router — the piece that turns a fired [`Job`] into a
//! delivery on whatever channel the reminder was created from.
//!
//! Grounded on `nanobot-discord::proactive`/`nanobot-telegram::proactive`
//! (per-channel delivery tasks) and `nanobot-agent::tools::reminder`
//! (the `ReminderAction` JSON shape written into `jobs.action`).

use std::sync::Arc;

use nanobot_channels::{InboundMessage, InboundMetadata};
use nanobot_core::reminder::{ReminderAction, ReminderDelivery, ReminderKind, SystemEventAction};
use nanobot_protocol::frames::EventFrame;
use nanobot_scheduler::Job;
use nanobot_terminal::ExecOptions;
use tokio::sync::mpsc;
use tracing::warn;

use crate::app::AppState;

/// Per-channel delivery senders the dispatcher can hand a fired job off to.
/// Any entry left `None` means that channel adapter isn't configured —
/// reminders created from it are logged and dropped rather than panicking.
#[derive(Default)]
pub struct DeliverySenders {
    pub discord: Option<mpsc::Sender<ReminderDelivery>>,
    pub telegram: Option<mpsc::Sender<ReminderDelivery>>,
}

/// Consume fired jobs for the lifetime of the process, running each job's
/// optional `bash_command` and routing the result to its origin channel.
///
/// Every fired job's outcome — success or failure of the bash command and/or
/// the channel delivery — is recorded onto the job row via
/// `SchedulerHandle::record_result`, per spec.md §4.9 ("Failures set
/// lastStatus=error and lastError; successes clear lastError").
pub async fn run(app: Arc<AppState>, senders: DeliverySenders, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        if job.name.starts_with("system:") {
            dispatch_system_event(&app, &job).await;
            continue;
        }

        let action: ReminderAction = match serde_json::from_str(&job.action) {
            Ok(a) => a,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "fired job action is not a ReminderAction, skipping");
                continue;
            }
        };

        let (message, command_error) = match &action.bash_command {
            Some(cmd) => {
                let terminal = app.terminal.lock().await;
                match terminal.exec(cmd, ExecOptions::default()).await {
                    Ok(result) if result.exit_code == 0 => (
                        format!("{}\n```\n{}\n```", action.message, result.stdout.trim_end()),
                        None,
                    ),
                    Ok(result) => {
                        let err = format!(
                            "command exited {}: {}",
                            result.exit_code,
                            result.stderr.trim_end()
                        );
                        (format!("{}\n({err})", action.message), Some(err))
                    }
                    Err(e) => {
                        let err = format!("command failed: {e}");
                        (format!("{}\n({err})", action.message), Some(err))
                    }
                }
            }
            None => (action.message.clone(), None),
        };

        let delivery_error = if action.kind == ReminderKind::AgentTurn {
            publish_agent_turn(&app, &job.id, &action, message)
        } else {
            deliver(&app, &senders, &job.id, &action, message).await
        };

        let outcome = command_error.or(delivery_error);
        let record = match &outcome {
            Some(err) => app.scheduler.record_result(&job.id, "error", Some(err.as_str())),
            None => app.scheduler.record_result(&job.id, "ok", None),
        };
        if let Err(e) = record {
            warn!(job_id = %job.id, "failed to persist reminder job result: {e}");
        }
    }

    tracing::info!("reminder dispatcher exiting (scheduler channel closed)");
}

/// Route a fired `system:*` job into the auto-memory-integration /
/// maintenance handlers rather than channel delivery, then persist whatever
/// state they return back onto the job row, plus the success/failure
/// outcome itself.
async fn dispatch_system_event(app: &Arc<AppState>, job: &Job) {
    let action: SystemEventAction = match serde_json::from_str(&job.action) {
        Ok(a) => a,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "fired system job action is not a SystemEventAction, skipping");
            return;
        }
    };

    let (new_state, outcome) = nanobot_agent::maintenance::handle_system_event(
        &app.agent,
        &app.sessions,
        &app.memory,
        &action.event,
        action.state,
    )
    .await;

    let new_action = SystemEventAction {
        event: action.event,
        state: new_state,
    };
    match serde_json::to_string(&new_action) {
        Ok(json) => {
            if let Err(e) = app.scheduler.update_action(&job.id, &json) {
                warn!(job_id = %job.id, "failed to persist system job state: {e}");
            }
        }
        Err(e) => warn!(job_id = %job.id, "failed to serialize system job state: {e}"),
    }

    let record = match &outcome {
        Err(err) => app.scheduler.record_result(&job.id, "error", Some(err.as_str())),
        Ok(()) => app.scheduler.record_result(&job.id, "ok", None),
    };
    if let Err(e) = record {
        warn!(job_id = %job.id, "failed to persist system job result: {e}");
    }
}

/// `kind == AgentTurn`: instead of delivering `message` directly, publish it
/// as a synthetic `"system"`-channel inbound message on the origin session —
/// `bus_consumer::run` picks it up and drives a real agent turn, per the
/// `agent_turn` payload kind. Returns `Some(error)` if the bus had no
/// consumer to hand the message to.
fn publish_agent_turn(
    app: &Arc<AppState>,
    job_id: &str,
    action: &ReminderAction,
    message: String,
) -> Option<String> {
    let origin_chat_id = action
        .channel_id
        .map(|id| id.to_string())
        .or_else(|| action.session_key.clone())
        .unwrap_or_else(|| "default".to_string());

    let msg = InboundMessage {
        channel: "system".to_string(),
        sender_id: "scheduler".to_string(),
        sender_name: None,
        chat_id: InboundMessage::encode_system_chat_id(&action.channel, &origin_chat_id),
        content: message,
        media: Vec::new(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        raw_payload: None,
        metadata: InboundMetadata::default(),
    };

    if app.bus_inbound.send(msg).is_err() {
        warn!(job_id, "agent_turn reminder: bus has no consumer, dropping");
        return Some("agent_turn reminder: bus has no consumer".to_string());
    }
    None
}

/// Deliver `message` to the channel the reminder was created from. Returns
/// `Some(error)` when the target channel adapter isn't configured/reachable.
async fn deliver(
    app: &Arc<AppState>,
    senders: &DeliverySenders,
    job_id: &str,
    action: &ReminderAction,
    message: String,
) -> Option<String> {
    let delivery = ReminderDelivery {
        job_id: job_id.to_string(),
        channel_id: action.channel_id,
        message: message.clone(),
        image_url: action.image_url.clone(),
    };

    match action.channel.as_str() {
        "discord" => match &senders.discord {
            Some(tx) if tx.send(delivery).await.is_ok() => None,
            _ => {
                warn!(job_id, "discord delivery unavailable, reminder dropped");
                Some("discord delivery unavailable".to_string())
            }
        },
        "telegram" => match &senders.telegram {
            Some(tx) if tx.send(delivery).await.is_ok() => None,
            _ => {
                warn!(job_id, "telegram delivery unavailable, reminder dropped");
                Some("telegram delivery unavailable".to_string())
            }
        },
        "ws" => {
            let seq = app.next_seq();
            let frame = EventFrame::new("reminder.fired", &delivery).with_seq(seq);
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    app.broadcaster.send(json);
                    None
                }
                Err(e) => Some(format!("failed to serialize ws delivery: {e}")),
            }
        }
        _ => {
            // HTTP/terminal clients poll `/notifications` for their session key.
            let key = action.session_key.clone().unwrap_or_else(|| "default".to_string());
            app.notifications.entry(key).or_default().push(message);
            None
        }
    }
}
