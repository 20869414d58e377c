//! Links every bench crate so that their `typetag` registrations end up in
//! the binary.
use common::bench::Bench;

pub use alloc_bench::Alloc;
pub use boottime::BootTime;
pub use tpch::Tpch;

/// Crates that log, used to build the tracing filter
pub const MODULES: &[&str] = &["common", "alloc_bench", "boottime", "tpch"];

/// Names of the available benches
pub fn init_benches() -> Vec<&'static str> {
    let benches: [Box<dyn Bench>; 3] = [
        Box::new(Alloc::default()),
        Box::new(BootTime::default()),
        Box::new(Tpch::default()),
    ];
    benches.iter().map(|bench| bench.name()).collect()
}

#[cfg(test)]
mod tests {
    use common::config::Config;

    use super::*;

    #[test]
    fn every_bench_is_registered() {
        assert_eq!(init_benches(), ["alloc", "boottime", "tpch"]);
    }

    #[test]
    fn config_resolves_bench_types() {
        let config: Config = serde_json::from_str(
            r#"{
                "name": "osv",
                "benches": [
                    {"name": "alloc", "bench": {"type": "Alloc", "bench_file": "alloc.bench", "environment": "native"}},
                    {"name": "boot", "bench": {"type": "BootTime", "bench_file": "boot.bench"}},
                    {"name": "tpch", "bench": {"type": "Tpch", "scale_factor": "sf1", "retry": {"max_attempts": 1, "timeout_secs": 120}}}
                ]
            }"#,
        )
        .unwrap();
        let names = config.benches.iter().map(|b| b.bench.name()).collect::<Vec<_>>();
        assert_eq!(names, ["alloc", "boottime", "tpch"]);
        assert_eq!(config.settings.results_dir(), "results");
    }
}
