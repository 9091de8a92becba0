//! Command-line reports over the attendance database.
//!
//! Backs `attend stats`, `attend index rebuild`, and `attend people list`.
//! Each command opens its own pool and prints a plain-text summary.

use std::sync::Arc;

use anyhow::Result;

use attendance_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::index::{IndexStats, IndexStatus, VectorIndex};
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let pool = store.pool();

    let total_people: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM people")
        .fetch_one(pool)
        .await?;
    let enrolled: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM people WHERE face_embedding IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let total_punches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attendance")
        .fetch_one(pool)
        .await?;
    let with_photo: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM attendance WHERE image_url IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let last_punch: Option<String> = sqlx::query_scalar("SELECT MAX(punch_time) FROM attendance")
        .fetch_one(pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let index = VectorIndex::new(store.clone());
    let index_stats = match index.build(false).await {
        Ok(()) => Some(index.stats().await),
        Err(e) => {
            eprintln!("Warning: index build failed: {}", e);
            None
        }
    };

    println!("Attendance Harness: Database Stats");
    println!("===================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  People:      {}", total_people);
    println!(
        "  Enrolled:    {} / {} ({}%)",
        enrolled,
        total_people,
        percent(enrolled, total_people)
    );
    println!("  Punches:     {}", total_punches);
    println!(
        "  With photo:  {} / {} ({}%)",
        with_photo,
        total_punches,
        percent(with_photo, total_punches)
    );
    println!(
        "  Last punch:  {}",
        last_punch.as_deref().unwrap_or("never")
    );
    println!();
    if let Some(stats) = index_stats {
        print_index_stats(&stats);
    }

    store.pool().close().await;
    Ok(())
}

/// Build the similarity index from the database and report what it holds.
pub async fn run_index_rebuild(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let index = VectorIndex::new(store.clone());
    index.build(true).await?;

    let stats = index.stats().await;
    println!("Index rebuilt.");
    print_index_stats(&stats);

    store.pool().close().await;
    Ok(())
}

/// Print every person, most recently updated first.
pub async fn run_people_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let people = store.list_people().await?;

    if people.is_empty() {
        println!("No people registered.");
    } else {
        println!(
            "  {:<32} {:<8} {:<16} {}",
            "IDENT", "FACE", "TIME ZONE", "UPDATED"
        );
        println!("  {}", "-".repeat(86));
        for p in &people {
            println!(
                "  {:<32} {:<8} {:<16} {}",
                p.ident,
                if p.has_embedding() { "yes" } else { "no" },
                p.time_zone,
                p.updated_at
            );
        }
        println!();
        println!("  {} people", people.len());
    }

    store.pool().close().await;
    Ok(())
}

fn print_index_stats(stats: &IndexStats) {
    match stats.status {
        IndexStatus::Active => {
            println!("  Index:       active");
            println!("  Embeddings:  {}", stats.total_embeddings);
            println!("  Dimension:   {}", stats.dimension);
        }
        IndexStatus::NotInitialized => {
            println!("  Index:       not initialized (no stored embeddings)");
        }
    }
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_percent_handles_empty_total() {
        assert_eq!(percent(3, 0), 0);
        assert_eq!(percent(1, 3), 33);
    }
}
