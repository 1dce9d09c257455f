use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

use tagmail::config::{Config, DEFAULT_CONFIG_FILE};
use tagmail::store::millis_to_datetime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against sender name or subject in the replica.");
        std::process::exit(1);
    }

    let query = &args[1];
    let search_term = format!("%{}%", query);

    let config = Config::load(DEFAULT_CONFIG_FILE)?;
    let pool = SqlitePoolOptions::new()
        .connect(&config.database.replica_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to replica: {}", e))?;

    let row = sqlx::query(
        "SELECT id, owner_id, sender_name, subject, timestamp, content
         FROM messages
         WHERE sender_name LIKE ? OR subject LIKE ?
         ORDER BY timestamp DESC
         LIMIT 1",
    )
    .bind(&search_term)
    .bind(&search_term)
    .fetch_optional(&pool)
    .await?;

    let Some(row) = row else {
        println!("No messages found matching '{}'", query);
        return Ok(());
    };

    let id: String = row.get("id");
    let owner: String = row.get("owner_id");
    let sender: String = row.get("sender_name");
    let subject: String = row.get("subject");
    let timestamp: i64 = row.get("timestamp");
    let content: String = row.get("content");

    let links = sqlx::query(
        "SELECT ml.label_id, l.name FROM message_labels ml
         LEFT JOIN labels l ON l.id = ml.label_id
         WHERE ml.message_id = ?
         ORDER BY ml.label_id",
    )
    .bind(&id)
    .fetch_all(&pool)
    .await?;

    println!("Found Message:");
    println!("ID: {}", id);
    println!("Owner: {}", owner);
    println!("From: {}", sender);
    println!("Subject: {}", subject);
    println!("Date: {}", millis_to_datetime(timestamp));
    println!(
        "--------------------------------------------------------------------------------"
    );
    println!("LABEL LINKS:");
    if links.is_empty() {
        println!("(none)");
    }
    for link in links {
        let label_id: String = link.get(0);
        let name: Option<String> = link.get(1);
        match name {
            Some(name) => println!("{} ({})", label_id, name),
            None => println!("{} (missing label row)", label_id),
        }
    }
    println!(
        "--------------------------------------------------------------------------------"
    );
    println!("CONTENT:");
    println!("{}", content);

    Ok(())
}
