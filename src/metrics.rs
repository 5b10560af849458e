use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Metrics {
    pub runs_started: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub submissions_total: AtomicU64,
    pub submissions_dropped: AtomicU64,
    pub generations_completed: AtomicU64,
    pub generations_failed: AtomicU64,
    pub generation_ms_sum: AtomicU64,
    pub judgements_completed: AtomicU64,
    pub judgements_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_finished(&self, completed: bool) {
        if completed {
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn submitted(&self) {
        self.submissions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.submissions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_finished(&self, success: bool, elapsed_ms: u64) {
        if success {
            self.generations_completed.fetch_add(1, Ordering::Relaxed);
            self.generation_ms_sum.fetch_add(elapsed_ms, Ordering::Relaxed);
        } else {
            self.generations_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn judgement_finished(&self, success: bool) {
        if success {
            self.judgements_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.judgements_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &str, &str, u64); 10] = [
            ("runs_started_total", "counter", "Benchmark runs started.", self.runs_started.load(Ordering::Relaxed)),
            ("runs_completed_total", "counter", "Benchmark runs completed.", self.runs_completed.load(Ordering::Relaxed)),
            ("runs_failed_total", "counter", "Benchmark runs that failed.", self.runs_failed.load(Ordering::Relaxed)),
            ("submissions_total", "counter", "Generation jobs submitted.", self.submissions_total.load(Ordering::Relaxed)),
            ("submissions_dropped_total", "counter", "Queued jobs dropped by pause or stop.", self.submissions_dropped.load(Ordering::Relaxed)),
            ("generations_completed_total", "counter", "Generations that produced a response.", self.generations_completed.load(Ordering::Relaxed)),
            ("generations_failed_total", "counter", "Generations that ended in an error.", self.generations_failed.load(Ordering::Relaxed)),
            ("generation_ms_sum", "counter", "Sum of successful generation times in ms.", self.generation_ms_sum.load(Ordering::Relaxed)),
            ("judgements_completed_total", "counter", "Results scored by the judge.", self.judgements_completed.load(Ordering::Relaxed)),
            ("judgements_failed_total", "counter", "Results the judge could not score.", self.judgements_failed.load(Ordering::Relaxed)),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in counters {
            out.push_str(&format!(
                "# HELP llm_bench_{name} {help}\n# TYPE llm_bench_{name} {kind}\nllm_bench_{name} {value}\n"
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_counters() {
        let m = Metrics::new();
        m.submitted();
        m.submitted();
        m.generation_finished(true, 1200);
        m.generation_finished(false, 99);
        assert_eq!(m.submissions_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.generations_completed.load(Ordering::Relaxed), 1);
        assert_eq!(m.generations_failed.load(Ordering::Relaxed), 1);
        assert_eq!(m.generation_ms_sum.load(Ordering::Relaxed), 1200);
    }

    #[test]
    fn test_prometheus_output() {
        let m = Metrics::new();
        m.run_started();
        m.judgement_finished(false);
        let out = m.render_prometheus();
        assert!(out.contains("llm_bench_runs_started_total 1"));
        assert!(out.contains("llm_bench_judgements_failed_total 1"));
        assert!(out.contains("# TYPE llm_bench_generation_ms_sum counter"));
    }
}
