use crate::filter::FilterResult;
use crate::models::{JobStatus, JobStatusView};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

/// Output handler for job results
pub struct OutputHandler {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Json, // Default
        }
    }
}

impl OutputHandler {
    /// Create a new output handler; console output always goes to stdout
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let writer: Option<Box<dyn Write + Send>> = match (&format, file_path) {
            (OutputFormat::Console, _) => None,
            (_, Some(path)) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            (_, None) => None,
        };

        Ok(OutputHandler { format, writer })
    }

    /// Handler writing into an arbitrary sink
    pub fn to_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputHandler {
            format,
            writer: Some(writer),
        }
    }

    /// Write a job status view
    pub fn write_job(&mut self, view: &JobStatusView) -> Result<(), Box<dyn std::error::Error>> {
        match self.format {
            OutputFormat::Console => {
                let output = render_job(view);
                self.write_output(&output)
            }
            _ => self.write_serialized(view),
        }
    }

    /// Write the result of a filter query
    pub fn write_filter(&mut self, result: &FilterResult) -> Result<(), Box<dyn std::error::Error>> {
        match self.format {
            OutputFormat::Console => {
                let mut output = format!("{} matching record(s)", result.total);
                if result.matches.len() < result.total {
                    output.push_str(&format!(" (showing {})", result.matches.len()));
                }
                output.push_str(":\n");
                for record in &result.matches {
                    output.push_str(&format!(
                        "  {} {:<8} {:<15} {}\n",
                        record.timestamp.to_rfc3339(),
                        record.severity.as_str(),
                        record
                            .source_address
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        record.raw_text
                    ));
                }
                self.write_output(&output)
            }
            _ => self.write_serialized(result),
        }
    }

    fn write_serialized<T: Serialize>(&mut self, value: &T) -> Result<(), Box<dyn std::error::Error>> {
        let json = match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value)?,
            _ => serde_json::to_string(value)?,
        };
        self.write_output(&format!("{}\n", json))
    }

    fn write_output(&mut self, data: &str) -> Result<(), Box<dyn std::error::Error>> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", data);
                io::stdout().flush()?;
            }
        }
        Ok(())
    }

    /// Flush any buffered output
    pub fn flush(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

fn render_job(view: &JobStatusView) -> String {
    let mut out = format!(
        "Job {} [{}] created {}\n",
        view.id,
        view.status,
        view.created_at.to_rfc3339()
    );
    if view.status == JobStatus::Failed {
        if let Some(error) = &view.error {
            out.push_str(&format!("  Error: {}\n", error));
        }
        return out;
    }

    out.push_str(&format!(
        "  Records analyzed: {} ({} dropped)\n",
        view.total_logs, view.skipped_records
    ));
    if let Some(stats) = &view.statistics {
        out.push_str(&format!(
            "  Error rate: {:.1}% across {} address(es)\n",
            stats.error_rate, stats.unique_ips
        ));
        if !stats.top_paths.is_empty() {
            let paths = stats
                .top_paths
                .iter()
                .take(3)
                .map(|p| format!("{} ({})", p.path, p.count))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("  Top paths: {}\n", paths));
        }
    }
    if let Some(insights) = &view.ai_insights {
        out.push_str(&format!(
            "  Risk level: {} ({} anomalies)\n",
            insights.summary.risk_level, insights.summary.total_anomalies
        ));
        if !insights.concerns.is_empty() {
            out.push_str("  Concerns:\n");
            for concern in &insights.concerns {
                out.push_str(&format!("    - {}\n", concern));
            }
        }
        if !insights.recommendations.is_empty() {
            out.push_str("  Recommendations:\n");
            for recommendation in &insights.recommendations {
                out.push_str(&format!("    - {}\n", recommendation));
            }
        }
    }

    if !view.suspicious_ips.is_empty() {
        out.push_str("  Suspicious addresses:\n");
        for ip in &view.suspicious_ips {
            let sources = ip
                .sources
                .iter()
                .map(|(name, score)| format!("{}={:.0}", name, score))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(
                "    {:<39} score {:>3}{} {}\n",
                ip.ip,
                ip.risk_score,
                if ip.is_malicious { " MALICIOUS" } else { "" },
                if sources.is_empty() {
                    String::new()
                } else {
                    format!("[{}]", sources)
                }
            ));
        }
    }
    out
}
