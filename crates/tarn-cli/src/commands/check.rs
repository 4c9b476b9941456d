use std::path::Path;

use serde::Serialize;
use tarn_core::{PoolEntry, PoolsConfig};

/// One line of the check report.
#[derive(Debug, Serialize)]
struct PoolSummary<'a> {
    alias: &'a str,
    url: &'a str,
    minimum: usize,
    maximum: usize,
    spare: usize,
    build_throttle: usize,
    house_keeping_ms: u64,
    validation: Option<&'a str>,
    fatal_errors: usize,
}

impl<'a> PoolSummary<'a> {
    fn from_entry(entry: &'a PoolEntry) -> Self {
        let d = &entry.definition;
        Self {
            alias: &entry.alias,
            url: &d.url,
            minimum: d.minimum_connection_count,
            maximum: d.maximum_connection_count,
            spare: d.prototype_count,
            build_throttle: d.simultaneous_build_throttle,
            house_keeping_ms: d.house_keeping_sleep_time_ms,
            validation: d.house_keeping_test_sql.as_deref(),
            fatal_errors: d.fatal_errors.len(),
        }
    }
}

pub fn check(path: &str, format: &str) -> anyhow::Result<()> {
    let config = match PoolsConfig::from_file(Path::new(path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {path}: {e}");
            return Err(e.into());
        }
    };
    println!("{}", render(&config, format)?);
    Ok(())
}

fn render(config: &PoolsConfig, format: &str) -> anyhow::Result<String> {
    let summaries: Vec<PoolSummary<'_>> = config.pools.iter().map(PoolSummary::from_entry).collect();
    match format {
        "json" => Ok(serde_json::to_string_pretty(&summaries)?),
        "text" => {
            let mut out = format!("✓ {} pool(s) valid", summaries.len());
            for s in &summaries {
                out.push_str(&format!(
                    "\n  {}: {} (min {}, max {}, spare {}, sweep every {} ms{})",
                    s.alias,
                    s.url,
                    s.minimum,
                    s.maximum,
                    s.spare,
                    s.house_keeping_ms,
                    s.validation
                        .map(|sql| format!(", validates with `{sql}`"))
                        .unwrap_or_default(),
                ));
            }
            Ok(out)
        }
        other => anyhow::bail!("unknown format '{other}', expected text or json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
[[pool]]
alias = "orders"
url = "sim://orders"
minimum_connection_count = 2
maximum_connection_count = 8
house_keeping_test_sql = "SELECT 1"

[[pool]]
alias = "billing"
url = "sim://billing"
"#;

    #[test]
    fn text_report_lists_pools() {
        let config = PoolsConfig::from_toml_str(CONFIG).unwrap();
        let out = render(&config, "text").unwrap();
        assert!(out.starts_with("✓ 2 pool(s) valid"));
        assert!(out.contains("orders: sim://orders (min 2, max 8"));
        assert!(out.contains("validates with `SELECT 1`"));
    }

    #[test]
    fn json_report_is_an_array() {
        let config = PoolsConfig::from_toml_str(CONFIG).unwrap();
        let out = render(&config, "json").unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value[1]["alias"], "billing");
        assert_eq!(value[1]["maximum"], 15);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let config = PoolsConfig::from_toml_str(CONFIG).unwrap();
        assert!(render(&config, "yaml").is_err());
    }

    #[test]
    fn check_reads_file_and_rejects_bad_config() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        good.write_all(CONFIG.as_bytes()).unwrap();
        assert!(check(good.path().to_str().unwrap(), "text").is_ok());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        bad.write_all(b"[[pool]]\nalias = \"x\"\nurl = \"sim://x\"\nmaximum_connection_count = 0\n")
            .unwrap();
        assert!(check(bad.path().to_str().unwrap(), "text").is_err());
    }
}
