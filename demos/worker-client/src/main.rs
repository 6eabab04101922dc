// Reference worker client: register -> heartbeat loop -> execute assigned
// jobs -> report status -> signal ready. See worker/main.py in the original
// implementation for the protocol this mirrors.

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit_core::{CoordinatorMessage, WorkerMessage};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use config::WorkerConfig;

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_worker_demo=info".into()),
        )
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(worker_id = %config.worker_id, url = %config.coordinator_url, "connecting to coordinator");

    let url = format!("{}/{}", config.coordinator_url.trim_end_matches('/'), config.worker_id);
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    tracing::info!("connected");

    let (sink, mut source) = stream.split();
    let sink = Arc::new(Mutex::new(sink));

    send(&sink, &WorkerMessage::Register {
        capabilities: config.capabilities.clone(),
    })
    .await?;

    let heartbeat_sink = sink.clone();
    let worker_id = config.worker_id.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if send(
                &heartbeat_sink,
                &WorkerMessage::Heartbeat {
                    worker_id: Some(worker_id.clone()),
                },
            )
            .await
            .is_err()
            {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = source.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => handle_frame(&sink, &config, &text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(%err, "websocket error");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("worker shutdown complete");
    Ok(())
}

async fn handle_frame(sink: &Arc<Mutex<WsSink>>, config: &WorkerConfig, text: &str) {
    let message: CoordinatorMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(%err, "ignoring malformed coordinator frame");
            return;
        }
    };

    match message {
        CoordinatorMessage::JobAssignment {
            job_id,
            job_type,
            parameters,
            ..
        } => {
            let sink = sink.clone();
            let worker_id = config.worker_id.clone();
            tokio::spawn(async move {
                run_job(&sink, &worker_id, job_id, job_type, parameters).await;
            });
        }
        CoordinatorMessage::RegistrationAck { status, .. } => {
            tracing::info!(%status, "registration acknowledged");
        }
        CoordinatorMessage::HeartbeatAck { .. } => {}
    }
}

async fn run_job(
    sink: &Arc<Mutex<WsSink>>,
    worker_id: &str,
    job_id: String,
    job_type: conduit_core::JobType,
    parameters: serde_json::Value,
) {
    tracing::info!(%job_id, %job_type, "executing job");

    let _ = send(
        sink,
        &WorkerMessage::JobStatus {
            job_id: job_id.clone(),
            status: "running".to_string(),
            result: None,
            worker_id: Some(worker_id.to_string()),
        },
    )
    .await;

    let result = jobs::execute(job_type, &parameters).await;

    let _ = send(
        sink,
        &WorkerMessage::JobStatus {
            job_id: job_id.clone(),
            status: "completed".to_string(),
            result: Some(result),
            worker_id: Some(worker_id.to_string()),
        },
    )
    .await;

    tracing::info!(%job_id, "job completed");

    let _ = send(
        sink,
        &WorkerMessage::Ready {
            worker_id: Some(worker_id.to_string()),
        },
    )
    .await;
}

async fn send(sink: &Arc<Mutex<WsSink>>, message: &WorkerMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    sink.lock().await.send(Message::Text(text)).await.context("failed to send frame")
}
