// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic docsync usage example.
//!
//! Demonstrates:
//! 1. Opening a SQLite replica ("laptop") and an in-memory one ("phone")
//! 2. Writing documents through the `DocumentApi` binding
//! 3. Syncing both ways
//! 4. Concurrent edits turning into a conflict on both replicas
//! 5. Resolving the conflict and syncing the resolution
//! 6. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use docsync::{
    Database, DatabaseConfig, DocumentApi, LocalTarget, SyncConfig, SyncReport, Synchronizer,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docsync=info")),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║               docsync: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open two replicas
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let laptop = Arc::new(
        Database::open(DatabaseConfig {
            path: Some(dir.path().join("laptop.db").display().to_string()),
            replica_uid: Some("laptop".into()),
            ..Default::default()
        })
        .await?,
    );
    let phone = Arc::new(Database::open(DatabaseConfig::in_memory("phone")).await?);
    println!("📦 Replicas: {} (SQLite), {} (memory)", laptop.replica_uid(), phone.replica_uid());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write some documents
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing documents...");
    let list = laptop
        .create_doc(json!({"title": "groceries", "items": ["milk"]}), Some("list.groceries"))
        .await?;
    println!("   └─ laptop: {} @ {}", list.doc_id, list.revision.as_ref().map(ToString::to_string).unwrap_or_default());
    let note = phone.create_doc(json!({"text": "call the plumber"}), None).await?;
    println!("   └─ phone:  {} @ {}", note.doc_id, note.revision.as_ref().map(ToString::to_string).unwrap_or_default());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Sync
    // ─────────────────────────────────────────────────────────────────────────
    let sync = Synchronizer::new(laptop.clone(), SyncConfig::default());
    let phone_target = LocalTarget::new(phone.clone());

    println!("\n🔄 Syncing laptop ⇄ phone...");
    print_report(&sync.sync(&phone_target).await?);
    println!("   └─ laptop now has {} docs, phone {}", laptop.get_all_docs(false).await?.len(), phone.get_all_docs(false).await?.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Concurrent edits
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✏️  Editing the same list on both replicas...");
    let mut on_laptop = laptop.get_doc("list.groceries", false).await?.ok_or("missing on laptop")?;
    on_laptop.set_content(json!({"title": "groceries", "items": ["milk", "eggs"]}));
    laptop.put_doc(&on_laptop).await?;

    let mut on_phone = phone.get_doc("list.groceries", false).await?.ok_or("missing on phone")?;
    on_phone.set_content(json!({"title": "groceries", "items": ["milk", "bread"]}));
    phone.put_doc(&on_phone).await?;

    print_report(&sync.sync(&phone_target).await?);
    for db in [&laptop, &phone] {
        let versions = db.get_doc_conflicts("list.groceries").await?;
        println!("   └─ {} sees {} versions:", db.replica_uid(), versions.len());
        for version in versions {
            println!(
                "      └─ {} → {}",
                version.revision.as_ref().map(ToString::to_string).unwrap_or_default(),
                version.content_json().unwrap_or_default()
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Resolve and sync the resolution
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🤝 Resolving on the phone...");
    let doc = phone.get("list.groceries").await?;
    let conflicting: Vec<_> = doc.conflicts.iter().map(|c| c.revision.clone()).collect();
    let resolved = phone
        .resolve_conflicts(
            "list.groceries",
            Some(json!({"title": "groceries", "items": ["milk", "eggs", "bread"]})),
            &conflicting,
        )
        .await?;
    println!("   └─ resolved as {}", resolved);

    print_report(&sync.sync(&phone_target).await?);
    let merged = laptop.get("list.groceries").await?;
    println!(
        "   └─ laptop: {} (conflicts: {})",
        merged.content_json().unwrap_or_default(),
        merged.has_conflicts()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.early_exit {
        println!("   └─ nothing to sync");
        return;
    }
    println!(
        "   └─ sent {}, received {}, applied {}, conflicts {}, skipped {}",
        report.sent,
        report.received,
        report.applied,
        report.conflicts,
        report.skipped.len()
    );
}

/// Print every captured metric, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.0}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("{} samples, sum {:.6}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, value)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
