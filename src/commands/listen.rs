//! Headless notification listener.
//!
//! Restores the stored session, keeps the push channel up and prints every
//! new inbox record until Ctrl-C or until the session ends.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::keyring::TokenStore;
use crate::notifications::NotificationRecord;
use crate::portal::Portal;

/// One terminal line for a record.
pub fn format_record(record: &NotificationRecord) -> String {
    format!(
        "{} [{}] {:<6} {}",
        record.timestamp.with_timezone(&chrono::Local).format("%H:%M"),
        record.kind.icon(),
        record.priority,
        record.message
    )
}

/// Records not yet in `shown`, oldest first. Ids no longer in the inbox
/// are forgotten so a re-delivered id prints again.
fn unseen<'a>(records: &'a [NotificationRecord], shown: &mut HashSet<String>) -> Vec<&'a NotificationRecord> {
    let fresh = records
        .iter()
        .rev()
        .filter(|record| shown.insert(record.id.clone()))
        .collect();
    let present: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
    shown.retain(|id| present.contains(id.as_str()));
    fresh
}

fn print_new(portal: &Portal, shown: &mut HashSet<String>) {
    let records = portal.notifications();
    for record in unseen(&records, shown) {
        println!("{}", format_record(record));
    }
}

/// Run the listener.
pub async fn run(config: Config, storage: Arc<dyn TokenStore>) -> Result<()> {
    let portal = Portal::start(config, storage).await?;
    let Some(profile) = portal.profile() else {
        anyhow::bail!("Not logged in. Run `hr-portal login --email <email>` first");
    };
    println!(
        "Listening for notifications for {} (Ctrl-C to stop)",
        profile.display_name()
    );

    let mut inbox_rx = portal.subscribe_inbox();
    let mut status_rx = portal.subscribe_channel_status();
    let mut session_rx = portal.session().subscribe();
    let mut shown = HashSet::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,

            changed = inbox_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new(&portal, &mut shown);
            }

            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                match &status.last_error {
                    Some(error) => eprintln!("push channel {} ({})", status.state, error),
                    None => eprintln!("push channel {}", status.state),
                }
            }

            changed = session_rx.changed() => {
                if changed.is_err() || !session_rx.borrow_and_update().is_authenticated() {
                    println!("Session ended");
                    break;
                }
            }
        }
    }

    portal.shutdown();
    Ok(())
}
