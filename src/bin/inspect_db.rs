use inbox_sync::config::Config;
use inbox_sync::db::Database;
use inbox_sync::queue::{JobQueue, SqliteJobQueue};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against Sender or Subject.");
        std::process::exit(1);
    }

    let query = &args[1];
    let config = Config::load()?;
    let db = Database::new(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let queue = SqliteJobQueue::from_settings(db.clone(), &config.queue);
    let counts = queue.counts().await?;
    println!(
        "Queue '{}': waiting={} active={} completed={} failed={}",
        config.queue.name, counts.waiting, counts.active, counts.completed, counts.failed
    );
    println!(
        "--------------------------------------------------------------------------------"
    );

    let mut found = db.search_messages(query, 1).await?;
    if let Some((subject, message)) = found.pop() {
        println!("Found Message:");
        println!("ID: {}", message.id);
        println!("Thread: {}", message.thread_id);
        println!("Provider ID: {}", message.provider_message_id);
        println!("From: {}", message.sender);
        println!("To: {:?}", message.recipients);
        println!("Subject: {:?}", subject);
        println!("Date: {}", message.sent_at);
        println!("Direction: {}", message.direction.as_str());
        println!("Unread: {}", message.is_unread);
        println!(
            "--------------------------------------------------------------------------------"
        );
        println!("BODY (Raw Debug):");
        println!("{:?}", message.body_text);
        println!(
            "--------------------------------------------------------------------------------"
        );
        println!("BODY (Display):");
        println!("{}", message.body_text);
    } else {
        println!("No messages found matching '{}'", query);
    }

    db.close().await;
    Ok(())
}
