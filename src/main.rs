use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use uuid::Uuid;

mod config;
mod db;
mod dispatcher;
mod error;
mod escalation;
mod factors;
mod models;
mod pipeline;
mod queue;
mod risk;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;
mod transport;

use config::Settings;
use dispatcher::{Clock, Dispatched, Dispatcher, NotificationRequest, SystemClock};
use models::{Channel, NotificationKind, Priority};
use pipeline::Pipeline;
use queue::{ChannelQueues, DeliveryOutcome, DeliveryQueue, RetryPolicy};
use scheduler::Scheduler;
use store::Store;
use transport::{Transport, WebhookTransport};

#[derive(Parser)]
#[command(name = "dropout-alerts")]
#[command(about = "Student dropout risk scoring and escalation alerts", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import student signals from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Preview a student's risk without saving it
    Score {
        #[arg(long)]
        email: String,
    },
    /// Recalculate every active student once and send escalations
    Sweep,
    /// Flag sharp score increases in recent history
    ScanRapid,
    /// Run the daily and rapid-increase sweeps until interrupted
    Run,
    /// Send a test notification to a recipient on every channel
    SendTest {
        #[arg(long)]
        recipient: Uuid,
    },
    /// Retry every undelivered channel of a notification
    Resend {
        #[arg(long)]
        notification: Uuid,
    },
    /// Soft-delete a notification and cancel its scheduled deliveries
    DeleteNotification {
        #[arg(long)]
        notification: Uuid,
    },
}

struct Services {
    queues: ChannelQueues,
    dispatcher: Arc<Dispatcher>,
    pipeline: Arc<Pipeline>,
    scheduler: Scheduler,
}

fn webhook(
    channel: Channel,
    endpoint: Option<&url::Url>,
    settings: &Settings,
) -> anyhow::Result<Option<Arc<dyn Transport>>> {
    let Some(endpoint) = endpoint else {
        tracing::warn!(%channel, "no webhook configured, channel will be disabled");
        return Ok(None);
    };
    let transport: Arc<dyn Transport> = Arc::new(
        WebhookTransport::new(channel, endpoint.clone(), settings.transport_timeout())
            .with_context(|| format!("failed to build {channel} transport"))?,
    );
    Ok(Some(transport))
}

fn build(settings: &Settings, pool: sqlx::PgPool) -> anyhow::Result<Services> {
    let store: Arc<dyn Store> = Arc::new(db::PgStore::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue = |channel: Channel, transport: Option<Arc<dyn Transport>>| {
        DeliveryQueue::new(
            channel,
            RetryPolicy::for_channel(channel),
            transport,
            store.clone(),
            settings.delivery_concurrency,
        )
    };
    let inbox: Arc<dyn Transport> = Arc::new(db::PgInbox::new(pool));
    let queues = ChannelQueues {
        email: queue(
            Channel::Email,
            webhook(Channel::Email, settings.email_webhook_url.as_ref(), settings)?,
        ),
        sms: queue(
            Channel::Sms,
            webhook(Channel::Sms, settings.sms_webhook_url.as_ref(), settings)?,
        ),
        in_app: queue(Channel::InApp, Some(inbox)),
    };

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), queues.clone(), clock.clone()));
    let pipeline = Arc::new(
        Pipeline::new(store, dispatcher.clone(), clock)
            .with_academic_period(settings.academic_period.clone()),
    );
    let scheduler = Scheduler::new(
        pipeline.clone(),
        settings.sweep_concurrency,
        settings.daily_interval(),
        settings.rapid_interval(),
    );

    Ok(Services {
        queues,
        dispatcher,
        pipeline,
        scheduler,
    })
}

fn describe(outcome: &DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::Delivered {
            provider_id,
            attempts,
        } => format!("delivered as {provider_id} after {attempts} attempt(s)"),
        DeliveryOutcome::Exhausted {
            attempts,
            last_error,
        } => format!("failed after {attempts} attempt(s): {last_error}"),
        DeliveryOutcome::AlreadySent => "already sent".to_string(),
        DeliveryOutcome::Cancelled => "cancelled".to_string(),
        DeliveryOutcome::Aborted(reason) => format!("aborted: {reason}"),
    }
}

async fn print_deliveries(dispatched: Dispatched) {
    let notification_id = dispatched.notification.id;
    let disabled: Vec<_> = dispatched
        .notification
        .channels
        .iter()
        .filter(|(_, state)| !state.enabled)
        .map(|(channel, state)| {
            let reason = state
                .errors
                .last()
                .map(|error| error.message.clone())
                .unwrap_or_default();
            (*channel, reason)
        })
        .collect();

    println!("Notification {notification_id}:");
    let outcomes = dispatched.settle().await;
    for (channel, outcome) in &outcomes {
        println!("- {channel}: {}", describe(outcome));
    }
    let delivered = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_delivered())
        .count();
    println!("{delivered} of {} queued channel(s) delivered.", outcomes.len());
    for (channel, reason) in disabled {
        println!("- {channel}: disabled ({reason})");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings;
    let database_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let imported = db::import_csv(&pool, &csv).await?;
            println!("Imported {imported} students from {}.", csv.display());
        }
        Commands::Score { email } => {
            let services = build(&settings, pool)?;
            let student = services
                .pipeline
                .store()
                .student_by_email(&email)
                .await?
                .with_context(|| format!("no student with email {email}"))?;
            let snapshot = services.pipeline.preview(&student).await?;
            let band = risk::timeline_band(snapshot.total_score);

            println!(
                "{} ({}, {}) score {}/100: {} risk",
                student.full_name,
                student.email,
                student.cohort,
                snapshot.total_score,
                snapshot.level
            );
            println!(
                "Dropout probability {}, likely timeline {}. Data completeness {}%.",
                band.probability, band.timeline, snapshot.data_completeness_percent
            );
            for factor in &snapshot.factors {
                println!(
                    "- {} {}/100 (weight {:.2})",
                    factor.factor, factor.score, factor.weight
                );
            }
            println!("Recommended actions:");
            for recommendation in &snapshot.recommendations {
                println!("- [{:?}] {}", recommendation.priority, recommendation.action);
            }
        }
        Commands::Sweep => {
            let services = build(&settings, pool)?;
            let report = services.scheduler.daily_sweep().await?;
            services.queues.drain().await;
            println!(
                "Recalculated {} students ({} failed), {} escalated.",
                report.successful, report.failed, report.escalated
            );
            println!(
                "Created {} notifications ({} recipients could not be notified).",
                report.notified, report.notify_failures
            );
        }
        Commands::ScanRapid => {
            let services = build(&settings, pool)?;
            let report = services.scheduler.rapid_increase_sweep().await?;
            println!(
                "Scanned {} students ({} failed), flagged {} rapid increases.",
                report.scanned, report.failed, report.flagged
            );
        }
        Commands::Run => {
            let services = build(&settings, pool)?;
            let resumed = services.dispatcher.resume_pending().await?;
            tracing::info!(resumed, "scheduler starting");
            services.scheduler.run(shutdown_signal()).await;
            println!("Scheduler stopped.");
        }
        Commands::SendTest { recipient } => {
            let services = build(&settings, pool)?;
            let dispatched = services
                .dispatcher
                .create_notification(NotificationRequest {
                    recipient_id: recipient,
                    kind: NotificationKind::Test,
                    priority: Priority::Normal,
                    title: "Test notification".to_string(),
                    message: "This is a test notification from the dropout alert service."
                        .to_string(),
                    short_message: None,
                    related_student: None,
                    channels: Channel::ALL.to_vec(),
                    created_by: Some("cli".to_string()),
                    scheduled_for: None,
                })
                .await?;
            print_deliveries(dispatched).await;
        }
        Commands::Resend { notification } => {
            let services = build(&settings, pool)?;
            let dispatched = services.dispatcher.resend(notification).await?;
            print_deliveries(dispatched).await;
        }
        Commands::DeleteNotification { notification } => {
            let services = build(&settings, pool)?;
            services.dispatcher.soft_delete(notification).await?;
            println!("Notification {notification} deleted.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_global_settings() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "dropout-alerts",
            "resend",
            "--notification",
            &id.to_string(),
            "--sweep-concurrency",
            "3",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Resend { notification } if notification == id));
        assert_eq!(cli.settings.sweep_concurrency, 3);
    }

    #[test]
    fn outcomes_read_as_sentences() {
        let delivered = DeliveryOutcome::Delivered {
            provider_id: "msg-7".to_string(),
            attempts: 2,
        };
        assert_eq!(describe(&delivered), "delivered as msg-7 after 2 attempt(s)");
        assert_eq!(describe(&DeliveryOutcome::Cancelled), "cancelled");
    }
}
