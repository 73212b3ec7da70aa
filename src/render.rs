use serde::Serialize;
use std::path::PathBuf;

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("failed to serialize json: {}", e),
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ErrorOut<'a> {
    pub code: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'a str>,
}

pub fn print_json_error(code: &str, message: &str, hint: Option<&str>) {
    let err = ErrorOut { code, message, hint };
    print_json(&err);
}

/// What a finished run reports on stdout.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub model: String,
    pub chunks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub output: PathBuf,
    pub log: PathBuf,
}

pub fn render_summary_text(summary: &RunSummary) {
    println!(
        "{} of {} chunks processed; {} failed.",
        summary.succeeded, summary.chunks, summary.failed
    );
    println!("output: {}", summary.output.display());
    println!("log: {}", summary.log.display());
}

pub fn render_summary(summary: &RunSummary, json: bool) {
    if json {
        print_json(summary);
    } else {
        render_summary_text(summary);
    }
}
