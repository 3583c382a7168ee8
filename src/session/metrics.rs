use crate::download::format_bytes;
use serde::Serialize;
use std::time::Duration;
use sysinfo::System;

/// Measurements of one generation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkMetrics {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub tokens_per_second: f64,
    pub time_to_first_token: Option<Duration>,
    pub total_time: Duration,
    pub resident_memory_bytes: Option<u64>,
}

impl BenchmarkMetrics {
    /// Back to the zero state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for BenchmarkMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Prompt tokens:      {}", self.prompt_tokens)?;
        writeln!(f, "Completion tokens:  {}", self.completion_tokens)?;
        writeln!(f, "Tokens/second:      {:.1}", self.tokens_per_second)?;
        match self.time_to_first_token {
            Some(ttft) => writeln!(f, "Time to first token: {} ms", ttft.as_millis())?,
            None => writeln!(f, "Time to first token: -")?,
        }
        writeln!(f, "Total time:         {:.2} s", self.total_time.as_secs_f64())?;
        match self.resident_memory_bytes {
            Some(bytes) => write!(f, "Resident memory:    {}", format_bytes(bytes)),
            None => write!(f, "Resident memory:    -"),
        }
    }
}

/// Resident memory of the current process, if the platform reports it.
///
/// Blocking; refreshes system-wide process information.
#[must_use]
pub fn resident_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let sys = System::new_all();
    sys.process(pid).map(sysinfo::Process::memory)
}
