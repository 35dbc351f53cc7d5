use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mail_aggregator::collaborators::{MailboxHandler, UnreadSink};
use mail_aggregator::config::AggregatorConfig;
use mail_aggregator::error::{CollaboratorError, PollError};
use mail_aggregator::launcher::{Collaborators, Launcher};
use mail_aggregator::mailbox::{MailboxDescriptor, NotificationTarget};
use mail_aggregator::store::LibSqlStore;

/// Stand-in protocol client: logs the mailbox and reports no new mail.
struct DryRunHandler;

#[async_trait]
impl MailboxHandler for DryRunHandler {
    async fn poll_mailbox(&self, mailbox: &MailboxDescriptor) -> Result<u32, PollError> {
        tracing::info!(
            mailbox_id = mailbox.mailbox_id,
            address = %mailbox.address,
            "Dry-run poll"
        );
        Ok(0)
    }
}

/// Stand-in push channel: logs instead of pushing.
struct LogUnreadSink;

#[async_trait]
impl UnreadSink for LogUnreadSink {
    async fn unread_count(&self, _target: &NotificationTarget) -> Result<u32, CollaboratorError> {
        Ok(0)
    }

    async fn push_unread_count(
        &self,
        target: &NotificationTarget,
        count: u32,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(tenant = target.tenant, user_id = %target.user_id, count, "Unread count");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AggregatorConfig::from_env();

    eprintln!("📬 Mail Aggregator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {}", config.store_path.display());
    if config.use_dump {
        eprintln!("   Journal: {}", config.dump_path.display());
    }
    eprintln!("   Workers: {}", config.max_tasks_at_once);

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(LibSqlStore::new_local(&config.store_path).await?);

    let collaborators = Collaborators {
        repository: store.clone(),
        billing: store.clone(),
        directory: store.clone(),
        alerts: store,
        handler: Arc::new(DryRunHandler),
        unread: Arc::new(LogUnreadSink),
    };

    // ── Shutdown on Ctrl-C ──────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
        }
        tracing::info!("Shutdown requested");
        stopper.cancel();
    });

    let report = Launcher::new(config, collaborators).run(cancel).await?;
    eprintln!(
        "   Polled {} mailboxes ({} failed)",
        report.completed, report.failed
    );
    Ok(())
}
