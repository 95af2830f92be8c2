//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    consumer: Option<ConsumerSummary>,
    components: HashMap<String, ComponentStatus>,
}

/// Consumer section of the health response.
#[derive(Debug, Deserialize)]
struct ConsumerSummary {
    state: String,
    consuming: bool,
    assigned_partitions: i64,
    #[serde(default)]
    halted_partitions: Vec<HaltedPartition>,
}

#[derive(Debug, Deserialize)]
struct HaltedPartition {
    partition: String,
    offset: i64,
    reason: String,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    // Fetch health status
    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => {
                    print_health_status(&health, status_code.as_u16());
                }
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the k2m consumer running?");
            println!("Start it with: k2m run --config <path-to-config>");
            return Ok(());
        }
    }

    // Fetch metrics
    let metrics_url = url
        .replace(":8080", ":9090")
        .replace("/health", "")
        .trim_end_matches('/')
        .to_string()
        + "/metrics";

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    let status_emoji = match health.status.as_str() {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    };

    println!(
        "{} Overall Status: {} (HTTP {})",
        status_emoji,
        health.status.to_uppercase(),
        status_code
    );
    println!();

    if let Some(consumer) = &health.consumer {
        println!(
            "Consumer: {} ({}), {} partitions assigned",
            consumer.state,
            if consumer.consuming { "consuming" } else { "idle" },
            consumer.assigned_partitions
        );
        for halted in &consumer.halted_partitions {
            println!(
                "  [HALTED] {} at offset {}: {}",
                halted.partition, halted.offset, halted.reason
            );
        }
        println!();
    }

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let emoji = match status.status.as_str() {
                "healthy" => "[OK]",
                "degraded" => "[WARN]",
                "unhealthy" => "[FAIL]",
                _ => "[?]",
            };

            if let Some(msg) = &status.message {
                println!("  {} {}: {} ({})", emoji, name, status.status, msg);
            } else {
                println!("  {} {}: {}", emoji, name, status.status);
            }
        }
    }
}

/// Sum samples per metric name across label sets.
fn sum_by_name(metrics_text: &str) -> HashMap<&str, f64> {
    let mut totals: HashMap<&str, f64> = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        // "name{labels} value" or "name value"
        let Some((series, value)) = line.rsplit_once(' ') else {
            continue;
        };
        let name = series.split('{').next().unwrap_or(series);
        if let Ok(value) = value.parse::<f64>() {
            *totals.entry(name).or_default() += value;
        }
    }

    totals
}

fn print_metrics(metrics_text: &str) {
    let values = sum_by_name(metrics_text);
    let get = |name: &str| values.get(name).map(|v| *v as u64);

    if let Some(v) = get("k2m_records_processed_total") {
        println!("Records Processed:     {}", format_number(v));
    }
    if let Some(v) = get("k2m_records_retried_total") {
        println!("Retries:               {}", format_number(v));
    }
    if let Some(v) = get("k2m_records_failed_total") {
        println!("Records Failed:        {}", v);
    }
    if let Some(v) = get("k2m_records_dead_lettered_total") {
        println!("Records Dead-Lettered: {}", v);
    }
    if let Some(v) = get("k2m_commits_total") {
        println!("Offset Commits:        {}", v);
    }
    if let Some(v) = get("k2m_partitions_assigned") {
        println!("Assigned Partitions:   {}", v);
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
