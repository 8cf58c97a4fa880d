//! List output in table, JSON or YAML form.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use shipyard::{CrateRecord, ShipRecord};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Serialize, Tabled)]
pub struct CrateRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "TAG")]
    pub tag: String,
    #[tabled(rename = "BASE")]
    pub base_image: String,
    #[tabled(rename = "DIGEST")]
    pub digest: String,
    #[tabled(rename = "SIZE")]
    pub size: String,
    #[tabled(rename = "CREATED")]
    pub created_at: String,
}

impl From<CrateRecord> for CrateRow {
    fn from(record: CrateRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            tag: record.tag,
            base_image: record.base_image,
            digest: record.digest.chars().take(12).collect(),
            size: human_size(record.size_bytes),
            created_at: timestamp(&record.created_at),
        }
    }
}

#[derive(Serialize, Tabled)]
pub struct ShipRow {
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "IMAGE")]
    pub image_id: i64,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "PID")]
    pub pid: String,
    #[tabled(rename = "STARTED")]
    pub started_at: String,
    #[tabled(rename = "STOPPED")]
    pub stopped_at: String,
    #[tabled(rename = "EXIT")]
    pub exit_code: String,
}

impl From<ShipRecord> for ShipRow {
    fn from(record: ShipRecord) -> Self {
        let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
        Self {
            name: record.name,
            image_id: record.image_id,
            status: record.state.status.to_string(),
            pid: opt(record.state.pid.map(|p| p.to_string())),
            started_at: opt(record.state.started_at.as_ref().map(timestamp)),
            stopped_at: opt(record.state.stopped_at.as_ref().map(timestamp)),
            exit_code: opt(record.state.exit_code.map(|c| c.to_string())),
        }
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn print_rows<T: Serialize + Tabled>(rows: Vec<T>, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new(rows);
            table.with(Style::blank());
            println!("{}", table);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&rows)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
