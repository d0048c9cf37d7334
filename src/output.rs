use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    ClearResult, DownloadResult, FilterResult, InitResult, ListResult, ProgressEvent,
    ProgressSink, QueryResult, TrainResult,
};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_query(result: &QueryResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_filter(result: &FilterResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_train(result: &TrainResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_init(result: &InitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Progress is dropped in JSON mode; diagnostics go to stderr through tracing.
impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        tracing::debug!(message = %event.message, "progress");
    }
}
